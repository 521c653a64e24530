//! Push transports. The dispatcher only sees the [`PushSender`] trait.

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    dto::sse::ServerEvent,
    state::{
        notification::NotificationKind,
        sse::{NotificationHub, UserEvent},
    },
};

/// Identifier returned by the transport for an accepted message.
pub type MessageId = String;

/// Failure reported by a push transport.
#[derive(Debug, Error)]
pub enum SendError {
    /// Nobody is connected to receive the message.
    #[error("no subscriber connected for `{recipient_id}`")]
    NoSubscriber { recipient_id: String },
    /// The payload could not be encoded.
    #[error("failed to encode push payload")]
    Encode(#[source] serde_json::Error),
    /// The transport could not be reached.
    #[cfg(feature = "webhook-push")]
    #[error("failed to reach push endpoint `{url}`")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    /// The transport answered with a non-success status.
    #[cfg(feature = "webhook-push")]
    #[error("push endpoint `{url}` answered {status}")]
    Rejected {
        url: String,
        status: reqwest::StatusCode,
    },
}

/// Best-effort, at-least-once message transport.
pub trait PushSender: Send + Sync {
    fn send(
        &self,
        recipient_id: String,
        kind: NotificationKind,
        payload: Value,
    ) -> BoxFuture<'static, Result<MessageId, SendError>>;
}

/// Delivers notifications to the recipient's open `/sse/notifications/{user_id}` stream.
#[derive(Clone)]
pub struct SsePushSender {
    hub: NotificationHub,
}

impl SsePushSender {
    pub fn new(hub: NotificationHub) -> Self {
        Self { hub }
    }
}

impl PushSender for SsePushSender {
    fn send(
        &self,
        recipient_id: String,
        kind: NotificationKind,
        payload: Value,
    ) -> BoxFuture<'static, Result<MessageId, SendError>> {
        let hub = self.hub.clone();
        Box::pin(async move {
            let event =
                ServerEvent::json(Some(kind.to_string()), &payload).map_err(SendError::Encode)?;
            if hub.publish(UserEvent {
                recipient_id: recipient_id.clone(),
                event,
            }) {
                Ok(Uuid::new_v4().to_string())
            } else {
                Err(SendError::NoSubscriber { recipient_id })
            }
        })
    }
}

#[cfg(feature = "webhook-push")]
pub use webhook::WebhookPushSender;

#[cfg(feature = "webhook-push")]
mod webhook {
    use std::sync::Arc;

    use futures::future::BoxFuture;
    use reqwest::Client;
    use serde::Serialize;
    use serde_json::Value;
    use uuid::Uuid;

    use super::{MessageId, PushSender, SendError};
    use crate::state::notification::NotificationKind;

    const MESSAGE_ID_HEADER: &str = "x-message-id";

    #[derive(Serialize)]
    struct WebhookBody<'a> {
        message_id: &'a str,
        recipient_id: &'a str,
        kind: NotificationKind,
        payload: &'a Value,
    }

    /// Forwards every notification as a JSON POST to an external push gateway.
    #[derive(Clone)]
    pub struct WebhookPushSender {
        client: Client,
        url: Arc<str>,
    }

    impl WebhookPushSender {
        pub fn new(url: impl Into<String>) -> Self {
            Self {
                client: Client::new(),
                url: Arc::from(url.into()),
            }
        }

        /// Build from `PUSH_WEBHOOK_URL`, if set.
        pub fn from_env() -> Option<Self> {
            std::env::var("PUSH_WEBHOOK_URL")
                .ok()
                .filter(|url| !url.trim().is_empty())
                .map(Self::new)
        }
    }

    impl PushSender for WebhookPushSender {
        fn send(
            &self,
            recipient_id: String,
            kind: NotificationKind,
            payload: Value,
        ) -> BoxFuture<'static, Result<MessageId, SendError>> {
            let sender = self.clone();
            Box::pin(async move {
                let message_id = Uuid::new_v4().to_string();
                let body = WebhookBody {
                    message_id: &message_id,
                    recipient_id: &recipient_id,
                    kind,
                    payload: &payload,
                };

                let response = sender
                    .client
                    .post(sender.url.as_ref())
                    .header(MESSAGE_ID_HEADER, &message_id)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|source| SendError::Transport {
                        url: sender.url.to_string(),
                        source,
                    })?;

                if response.status().is_success() {
                    Ok(message_id)
                } else {
                    Err(SendError::Rejected {
                        url: sender.url.to_string(),
                        status: response.status(),
                    })
                }
            })
        }
    }
}

use indexmap::IndexSet;
use tracing::info;

use crate::{
    dto::notification::{ExternalNotificationRequest, ExternalNotificationResponse},
    error::ServiceError,
    services::dispatcher,
    state::{SharedState, notification::Notification},
};

/// Fan an invite, chat or friendship event out to its recipients and wait for delivery.
pub async fn send_external(
    state: &SharedState,
    request: ExternalNotificationRequest,
) -> Result<ExternalNotificationResponse, ServiceError> {
    if request.kind.is_lifecycle() {
        return Err(ServiceError::InvalidInput(format!(
            "`{}` notifications are emitted by the race lifecycle only",
            request.kind
        )));
    }

    let recipients: IndexSet<String> = request
        .recipients
        .into_iter()
        .map(|recipient| recipient.trim().to_string())
        .filter(|recipient| !recipient.is_empty())
        .collect();
    if recipients.is_empty() {
        return Err(ServiceError::InvalidInput("no recipients given".into()));
    }

    let occurrence = request.occurrence.unwrap_or_default();
    let notifications: Vec<Notification> = recipients
        .iter()
        .map(|recipient| Notification {
            kind: request.kind,
            entity_id: request.entity_id.clone(),
            recipient_id: recipient.clone(),
            occurrence: occurrence.clone(),
            title: request.title.clone(),
            body: request.body.clone(),
            data: request.data.clone(),
        })
        .collect();

    let report = dispatcher::dispatch(state, notifications).await;
    info!(
        kind = %request.kind,
        entity_id = %request.entity_id,
        sent = report.sent,
        duplicates = report.duplicates,
        failed = report.failed,
        "external notification dispatched"
    );

    Ok(ExternalNotificationResponse {
        recipients: recipients.len() as u32,
        report,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::{
        config::AppConfig,
        services::testing::{RecordingSender, memory_state},
        state::notification::NotificationKind,
    };

    fn chat(recipients: &[&str]) -> ExternalNotificationRequest {
        ExternalNotificationRequest {
            kind: NotificationKind::DirectMessage,
            entity_id: "chat-7".into(),
            occurrence: Some("msg-1".into()),
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            title: "New message".into(),
            body: "See you at the start line".into(),
            data: Map::new(),
        }
    }

    #[tokio::test]
    async fn duplicates_are_collapsed_and_replays_skipped() {
        let sender = RecordingSender::shared();
        let state = memory_state(AppConfig::default(), &sender, None).await;

        let response = send_external(&state, chat(&["a", "b", "a"])).await.unwrap();
        assert_eq!(response.recipients, 2);
        assert_eq!(response.report.sent, 2);

        let replay = send_external(&state, chat(&["a"])).await.unwrap();
        assert_eq!(replay.report.duplicates, 1);
        assert_eq!(sender.count(NotificationKind::DirectMessage), 2);
    }

    #[tokio::test]
    async fn colons_in_ids_do_not_collide() {
        let sender = RecordingSender::shared();
        let state = memory_state(AppConfig::default(), &sender, None).await;

        let mut first = chat(&["bob"]);
        first.entity_id = "chat:alice".into();
        first.occurrence = None;
        let mut second = chat(&["alice:bob"]);
        second.entity_id = "chat".into();
        second.occurrence = None;

        assert_eq!(send_external(&state, first).await.unwrap().report.sent, 1);
        let report = send_external(&state, second).await.unwrap().report;
        assert_eq!(report.sent, 1);
        assert_eq!(report.duplicates, 0);
    }

    #[tokio::test]
    async fn invite_friend_and_chat_kinds_are_delivered() {
        let sender = RecordingSender::shared();
        let state = memory_state(AppConfig::default(), &sender, None).await;
        let kinds = [
            NotificationKind::RaceInvite,
            NotificationKind::InviteAccepted,
            NotificationKind::InviteDeclined,
            NotificationKind::JoinRequest,
            NotificationKind::JoinRequestAccepted,
            NotificationKind::JoinRequestDeclined,
            NotificationKind::FriendRequest,
            NotificationKind::FriendAccepted,
            NotificationKind::FriendDeclined,
            NotificationKind::FriendRemoved,
            NotificationKind::DirectMessage,
            NotificationKind::RaceChatMessage,
        ];

        for kind in kinds {
            let mut request = chat(&["a"]);
            request.kind = kind;
            let response = send_external(&state, request).await.unwrap();
            assert_eq!(response.report.sent, 1, "{kind}");
        }
        for kind in kinds {
            assert_eq!(sender.recipients(kind), ["a"], "{kind}");
        }
    }

    #[tokio::test]
    async fn lifecycle_kinds_are_rejected() {
        let sender = RecordingSender::shared();
        let state = memory_state(AppConfig::default(), &sender, None).await;
        let mut request = chat(&["a"]);
        request.kind = NotificationKind::RaceStarted;
        assert!(matches!(
            send_external(&state, request).await,
            Err(ServiceError::InvalidInput(_))
        ));
    }
}

use std::{convert::Infallible, time::Duration};

use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::{
    dto::sse::{Handshake, ServerEvent},
    state::{SharedState, sse::UserSubscription},
};

const EVENT_HANDSHAKE: &str = "handshake";

/// Subscribe to the public race status stream.
pub fn subscribe_races(state: &SharedState) -> broadcast::Receiver<ServerEvent> {
    state.race_sse().subscribe()
}

/// Subscribe to the notifications addressed to `user_id`.
pub fn subscribe_notifications(state: &SharedState, user_id: &str) -> UserSubscription {
    state.notification_hub().subscribe(user_id)
}

/// Initial event telling the client which stream it joined.
pub fn handshake(state: &SharedState, stream: &str, message: String) -> Option<ServerEvent> {
    let payload = Handshake {
        stream: stream.to_string(),
        message,
        degraded: state.is_degraded(),
    };
    match ServerEvent::json(Some(EVENT_HANDSHAKE.to_string()), &payload) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(stream, error = %err, "failed to serialize SSE handshake");
            None
        }
    }
}

/// Convert a broadcast receiver into an SSE response, forwarding events until
/// the client disconnects.
pub fn to_sse_stream(
    mut receiver: broadcast::Receiver<ServerEvent>,
    greeting: Option<ServerEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // small bounded channel between forwarder and response
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(8);

    tokio::spawn(async move {
        if let Some(greeting) = greeting {
            if tx.send(Ok(to_event(greeting))).await.is_err() {
                return;
            }
        }
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                recv_result = receiver.recv() => {
                    match recv_result {
                        Ok(payload) => {
                            if tx.send(Ok(to_event(payload))).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(_)) => {
                            // Skip lagged messages but keep the stream alive.
                            continue;
                        }
                    }
                }
            }
        }

        tracing::info!("race SSE stream disconnected");
    });

    keep_alive(ReceiverStream::new(rx))
}

/// Stream one user's notifications; the subscription is released when the client goes away.
pub fn to_notification_stream(
    mut subscription: UserSubscription,
    greeting: Option<ServerEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        if let Some(greeting) = greeting {
            yield Ok(to_event(greeting));
        }
        while let Some(payload) = subscription.next().await {
            yield Ok(to_event(payload));
        }
        tracing::info!(user_id = subscription.user_id(), "notification SSE stream closed");
    };

    keep_alive(stream)
}

fn to_event(payload: ServerEvent) -> Event {
    let event = Event::default().data(payload.data);
    match payload.event {
        Some(name) => event.event(name),
        None => event,
    }
}

fn keep_alive<S>(stream: S) -> Sse<KeepAliveStream<S>>
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

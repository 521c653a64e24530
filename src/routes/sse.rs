use std::convert::Infallible;

use axum::{
    Router,
    extract::{Path, State},
    response::sse::Sse,
    routing::get,
};
use futures::Stream;
use tracing::info;

use crate::{services::sse_service, state::SharedState};

#[utoipa::path(
    get,
    path = "/sse/races",
    tag = "sse",
    responses((status = 200, description = "Race status changes", content_type = "text/event-stream", body = String))
)]
/// Stream race creations and status changes to any listener.
pub async fn race_stream(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<axum::response::sse::Event, Infallible>>> {
    let receiver = sse_service::subscribe_races(&state);
    info!("new race SSE connection");
    let greeting = sse_service::handshake(&state, "races", "race stream connected".into());
    sse_service::to_sse_stream(receiver, greeting)
}

#[utoipa::path(
    get,
    path = "/sse/notifications/{user_id}",
    tag = "sse",
    params(("user_id" = String, Path, description = "Recipient whose notifications are streamed")),
    responses((status = 200, description = "Per-user notifications", content_type = "text/event-stream", body = String))
)]
/// Stream the push notifications addressed to one user.
pub async fn notification_stream(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
) -> Sse<impl Stream<Item = Result<axum::response::sse::Event, Infallible>>> {
    let subscription = sse_service::subscribe_notifications(&state, &user_id);
    info!(%user_id, "new notification SSE connection");
    let greeting = sse_service::handshake(
        &state,
        "notifications",
        format!("notifications for `{user_id}` connected"),
    );
    sse_service::to_notification_stream(subscription, greeting)
}

/// Configure the SSE endpoints.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new()
        .route("/sse/races", get(race_stream))
        .route("/sse/notifications/{user_id}", get(notification_stream))
}

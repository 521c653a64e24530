use axum::{Json, Router, extract::State, routing::post};
use axum_valid::Valid;

use crate::{
    dto::notification::{ExternalNotificationRequest, ExternalNotificationResponse},
    error::AppError,
    services::notification_service,
    state::SharedState,
};

pub fn router() -> Router<SharedState> {
    Router::new().route("/notifications", post(send_notification))
}

/// Fan out an invite, join request, chat or friendship event.
#[utoipa::path(
    post,
    path = "/notifications",
    tag = "notifications",
    request_body = ExternalNotificationRequest,
    responses(
        (status = 200, description = "Delivery report", body = ExternalNotificationResponse),
        (status = 400, description = "Lifecycle kind or no recipients")
    )
)]
pub async fn send_notification(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<ExternalNotificationRequest>>,
) -> Result<Json<ExternalNotificationResponse>, AppError> {
    Ok(Json(
        notification_service::send_external(&state, payload).await?,
    ))
}

use axum::{Json, Router, extract::State, routing::post};

use crate::{
    error::AppError,
    services::scheduler::{self, TickReport},
    state::SharedState,
};

/// Manual trigger for deployments driven by an external cron.
pub fn router() -> Router<SharedState> {
    Router::new().route("/scheduler/tick", post(tick))
}

/// Run one scheduler pass now.
#[utoipa::path(
    post,
    path = "/scheduler/tick",
    tag = "scheduler",
    responses(
        (status = 200, description = "Tick finished", body = TickReport),
        (status = 503, description = "Storage unavailable")
    )
)]
pub async fn tick(State(state): State<SharedState>) -> Result<Json<TickReport>, AppError> {
    Ok(Json(scheduler::tick(&state).await?))
}

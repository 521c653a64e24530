use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use axum_valid::Valid;
use uuid::Uuid;

use crate::{
    dto::{
        identity::Actor,
        race::{CancelRequest, CreateRaceRequest, ProgressRequest, ProgressResponse, RaceSnapshot},
    },
    error::AppError,
    services::race_service,
    state::SharedState,
};

/// Race lifecycle endpoints. Every call identifies its user through `x-user-id`.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/races", post(create_race))
        .route("/races/{id}", get(get_race))
        .route("/races/{id}/join", post(join_race))
        .route("/races/{id}/leave", post(leave_race))
        .route("/races/{id}/progress", post(report_progress))
        .route("/races/{id}/complete", post(complete_race))
        .route("/races/{id}/start", post(start_race))
        .route("/races/{id}/cancel", post(cancel_race))
}

/// Open a new race; without `schedule_time` it starts immediately.
#[utoipa::path(
    post,
    path = "/races",
    tag = "races",
    params(("x-user-id" = String, Header, description = "Acting user")),
    request_body = CreateRaceRequest,
    responses(
        (status = 201, description = "Race created", body = RaceSnapshot),
        (status = 400, description = "Invalid payload"),
        (status = 401, description = "Missing user identity")
    )
)]
pub async fn create_race(
    State(state): State<SharedState>,
    actor: Actor,
    Valid(Json(payload)): Valid<Json<CreateRaceRequest>>,
) -> Result<(StatusCode, Json<RaceSnapshot>), AppError> {
    let race = race_service::create_race(&state, &actor, payload).await?;
    Ok((StatusCode::CREATED, Json(race)))
}

/// Current snapshot of a race with participants ordered by rank.
#[utoipa::path(
    get,
    path = "/races/{id}",
    tag = "races",
    params(("id" = Uuid, Path, description = "Race identifier")),
    responses(
        (status = 200, description = "Race", body = RaceSnapshot),
        (status = 404, description = "Unknown race")
    )
)]
pub async fn get_race(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RaceSnapshot>, AppError> {
    Ok(Json(race_service::get_race(&state, id).await?))
}

#[utoipa::path(
    post,
    path = "/races/{id}/join",
    tag = "races",
    params(
        ("id" = Uuid, Path, description = "Race identifier"),
        ("x-user-id" = String, Header, description = "Acting user"),
        ("x-user-name" = Option<String>, Header, description = "Display name shown to others")
    ),
    responses(
        (status = 200, description = "Joined", body = RaceSnapshot),
        (status = 409, description = "Race full, closed or already joined")
    )
)]
pub async fn join_race(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    actor: Actor,
) -> Result<Json<RaceSnapshot>, AppError> {
    Ok(Json(race_service::join_race(&state, id, &actor).await?))
}

#[utoipa::path(
    post,
    path = "/races/{id}/leave",
    tag = "races",
    params(
        ("id" = Uuid, Path, description = "Race identifier"),
        ("x-user-id" = String, Header, description = "Acting user")
    ),
    responses(
        (status = 200, description = "Left", body = RaceSnapshot),
        (status = 409, description = "Not racing or race over")
    )
)]
pub async fn leave_race(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    actor: Actor,
) -> Result<Json<RaceSnapshot>, AppError> {
    Ok(Json(race_service::leave_race(&state, id, &actor).await?))
}

/// Report cumulative progress; lower values than the stored one are ignored.
#[utoipa::path(
    post,
    path = "/races/{id}/progress",
    tag = "races",
    params(
        ("id" = Uuid, Path, description = "Race identifier"),
        ("x-user-id" = String, Header, description = "Acting user")
    ),
    request_body = ProgressRequest,
    responses(
        (status = 200, description = "Progress recorded", body = ProgressResponse),
        (status = 409, description = "Race not running or participant not racing")
    )
)]
pub async fn report_progress(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    actor: Actor,
    Valid(Json(payload)): Valid<Json<ProgressRequest>>,
) -> Result<Json<ProgressResponse>, AppError> {
    Ok(Json(
        race_service::report_progress(&state, id, &actor, payload.progress).await?,
    ))
}

#[utoipa::path(
    post,
    path = "/races/{id}/complete",
    tag = "races",
    params(
        ("id" = Uuid, Path, description = "Race identifier"),
        ("x-user-id" = String, Header, description = "Acting user")
    ),
    responses(
        (status = 200, description = "Participant finished", body = RaceSnapshot),
        (status = 409, description = "Race not running or participant not racing")
    )
)]
pub async fn complete_race(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    actor: Actor,
) -> Result<Json<RaceSnapshot>, AppError> {
    Ok(Json(race_service::complete_race(&state, id, &actor).await?))
}

/// Organizer only: skip the wait and enter the countdown.
#[utoipa::path(
    post,
    path = "/races/{id}/start",
    tag = "races",
    params(
        ("id" = Uuid, Path, description = "Race identifier"),
        ("x-user-id" = String, Header, description = "Organizer")
    ),
    responses(
        (status = 200, description = "Countdown started", body = RaceSnapshot),
        (status = 403, description = "Not the organizer"),
        (status = 409, description = "Race is not scheduled")
    )
)]
pub async fn start_race(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    actor: Actor,
) -> Result<Json<RaceSnapshot>, AppError> {
    Ok(Json(race_service::start_race(&state, id, &actor).await?))
}

/// Organizer only: stop a race that has not ended.
#[utoipa::path(
    post,
    path = "/races/{id}/cancel",
    tag = "races",
    params(
        ("id" = Uuid, Path, description = "Race identifier"),
        ("x-user-id" = String, Header, description = "Organizer")
    ),
    request_body = CancelRequest,
    responses(
        (status = 200, description = "Race cancelled", body = RaceSnapshot),
        (status = 403, description = "Not the organizer"),
        (status = 409, description = "Race already over")
    )
)]
pub async fn cancel_race(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    actor: Actor,
    Valid(Json(payload)): Valid<Json<CancelRequest>>,
) -> Result<Json<RaceSnapshot>, AppError> {
    Ok(Json(
        race_service::cancel_race(&state, id, &actor, payload).await?,
    ))
}

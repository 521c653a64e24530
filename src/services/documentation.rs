use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for the race lifecycle service.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::races::create_race,
        crate::routes::races::get_race,
        crate::routes::races::join_race,
        crate::routes::races::leave_race,
        crate::routes::races::report_progress,
        crate::routes::races::complete_race,
        crate::routes::races::start_race,
        crate::routes::races::cancel_race,
        crate::routes::scheduler::tick,
        crate::routes::notifications::send_notification,
        crate::routes::sse::race_stream,
        crate::routes::sse::notification_stream,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::race::CreateRaceRequest,
            crate::dto::race::ProgressRequest,
            crate::dto::race::CancelRequest,
            crate::dto::race::RaceSnapshot,
            crate::dto::race::ParticipantView,
            crate::dto::race::LeaderView,
            crate::dto::race::ProgressResponse,
            crate::dto::notification::ExternalNotificationRequest,
            crate::dto::notification::ExternalNotificationResponse,
            crate::dto::sse::Handshake,
            crate::dto::sse::SystemStatus,
            crate::dto::sse::RaceStatusChangedEvent,
            crate::services::dispatcher::DispatchReport,
            crate::services::scheduler::TickReport,
            crate::state::notification::Notification,
            crate::state::notification::NotificationKind,
            crate::state::race::ParticipantStatus,
            crate::state::state_machine::RaceStatus,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "races", description = "Race lifecycle operations"),
        (name = "scheduler", description = "Time-driven transitions"),
        (name = "notifications", description = "Push notification fan-out"),
        (name = "sse", description = "Server-sent events streams"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_route_is_documented() {
        let doc = ApiDoc::openapi();
        for path in [
            "/races",
            "/races/{id}",
            "/races/{id}/progress",
            "/scheduler/tick",
            "/notifications",
            "/sse/notifications/{user_id}",
        ] {
            assert!(doc.paths.paths.contains_key(path), "{path} missing");
        }
    }
}

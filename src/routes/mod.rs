use axum::Router;

use crate::state::SharedState;

pub mod docs;
pub mod health;
pub mod identity;
pub mod notifications;
pub mod races;
pub mod scheduler;
pub mod sse;

/// Compose all route trees, wiring in shared state and documentation routes.
pub fn router(state: SharedState) -> Router<()> {
    let api_router = health::router()
        .merge(sse::router())
        .merge(races::router())
        .merge(scheduler::router())
        .merge(notifications::router());

    let docs_router = docs::router(state.clone());

    api_router.merge(docs_router).with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::{
        config::AppConfig,
        services::testing::{RecordingSender, memory_state},
    };

    async fn app() -> Router<()> {
        let sender = RecordingSender::shared();
        router(memory_state(AppConfig::default(), &sender, None).await)
    }

    fn post(uri: &str, user: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::post(uri).header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header(identity::USER_ID_HEADER, user);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn create_requires_identity_and_valid_payload() {
        let app = app().await;
        let payload = json!({ "title": "Canal 5k", "target_progress": 5000.0 });

        let response = app
            .clone()
            .oneshot(post("/races", None, payload.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(post(
                "/races",
                Some("org"),
                json!({ "title": "Canal 5k", "target_progress": 0.0 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(post("/races", Some("org"), payload))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = json_body(response).await;
        assert_eq!(created["status"], "active");

        let id = created["id"].as_str().unwrap();
        let response = app
            .oneshot(
                Request::get(format!("/races/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["participant_count"], 1);
    }

    #[tokio::test]
    async fn lifecycle_errors_map_to_status_codes() {
        let app = app().await;
        let response = app
            .clone()
            .oneshot(post(
                "/races",
                Some("org"),
                json!({
                    "title": "Dawn run",
                    "target_progress": 100.0,
                    "schedule_time": "2999-01-01T06:00:00Z"
                }),
            ))
            .await
            .unwrap();
        let id = json_body(response).await["id"].as_str().unwrap().to_string();

        let forbidden = app
            .clone()
            .oneshot(post(&format!("/races/{id}/start"), Some("mallory"), json!({})))
            .await
            .unwrap();
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

        let not_running = app
            .clone()
            .oneshot(post(
                &format!("/races/{id}/progress"),
                Some("org"),
                json!({ "progress": 10.0 }),
            ))
            .await
            .unwrap();
        assert_eq!(not_running.status(), StatusCode::CONFLICT);

        let missing = app
            .oneshot(post(
                &format!("/races/{}/join", uuid::Uuid::new_v4()),
                Some("org"),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}

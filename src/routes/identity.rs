use axum::{extract::FromRequestParts, http::request::Parts};

use crate::{dto::identity::Actor, error::AppError};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_NAME_HEADER: &str = "x-user-name";

/// Read the acting user from `x-user-id` (required) and `x-user-name` (optional).
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };

        let user_id = header(USER_ID_HEADER)
            .ok_or_else(|| AppError::Unauthorized(format!("missing `{USER_ID_HEADER}` header")))?;
        let actor = Actor::new(user_id);
        Ok(match header(USER_NAME_HEADER) {
            Some(name) => actor.named(name),
            None => actor,
        })
    }
}

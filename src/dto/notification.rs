use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;
use validator::Validate;

use crate::{services::dispatcher::DispatchReport, state::notification::NotificationKind};

/// Event raised outside the race lifecycle (invites, chat, friends) to fan out.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct ExternalNotificationRequest {
    /// Must be one of the non-lifecycle kinds.
    pub kind: NotificationKind,
    /// Chat, invite or friendship identifier; scopes the dedup key.
    #[validate(length(min = 1, max = 128))]
    pub entity_id: String,
    /// Distinguishes repeated events on the same entity (e.g. a chat message id).
    #[serde(default)]
    #[validate(length(max = 128))]
    pub occurrence: Option<String>,
    #[validate(length(min = 1, max = 500))]
    pub recipients: Vec<String>,
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(length(max = 2000))]
    pub body: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub data: Map<String, Value>,
}

/// Delivery counters for an external fan-out.
#[derive(Debug, Serialize, ToSchema)]
pub struct ExternalNotificationResponse {
    pub recipients: u32,
    #[serde(flatten)]
    pub report: DispatchReport,
}

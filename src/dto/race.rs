use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dto::{
        format_system_time,
        validation::{validate_rfc3339, validate_title},
    },
    state::{
        race::{Participant, ParticipantStatus, Race},
        state_machine::RaceStatus,
    },
};

/// Payload used to open a new race.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct CreateRaceRequest {
    #[validate(length(max = 120), custom(function = "validate_title"))]
    pub title: String,
    /// Distance or step count that counts as finishing.
    #[validate(range(exclusive_min = 0.0))]
    pub target_progress: f64,
    /// RFC 3339 start time. Omit to start a quick race immediately.
    #[serde(default)]
    #[validate(custom(function = "validate_rfc3339"))]
    pub schedule_time: Option<String>,
    #[serde(default)]
    #[validate(range(min = 1))]
    pub max_participants: Option<u32>,
    /// Register the organizer as first participant (default `true`).
    #[serde(default = "default_true")]
    pub join: bool,
}

fn default_true() -> bool {
    true
}

/// A progress report in the race's unit.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct ProgressRequest {
    #[validate(range(min = 0.0))]
    pub progress: f64,
}

/// Optional explanation attached to a cancellation.
#[derive(Debug, Default, Deserialize, ToSchema, Validate)]
pub struct CancelRequest {
    #[serde(default)]
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

/// Public projection of a participant.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ParticipantView {
    pub user_id: String,
    pub display_name: String,
    pub progress: f64,
    pub rank: Option<u32>,
    pub status: ParticipantStatus,
    pub joined_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_order: Option<u32>,
}

/// Leader projection.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LeaderView {
    pub user_id: String,
    pub display_name: String,
    pub progress: f64,
}

/// Race as returned by the REST API; participants are sorted by rank.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RaceSnapshot {
    pub id: Uuid,
    pub title: String,
    pub organizer_id: String,
    pub target_progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_participants: Option<u32>,
    pub status: RaceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub countdown_ends_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_finisher_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,
    pub participant_count: u32,
    pub active_participant_count: u32,
    pub completed_participant_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_participant: Option<LeaderView>,
    pub participants: Vec<ParticipantView>,
    pub version: u64,
    pub created_at: String,
    pub updated_at: String,
}

/// Outcome of a progress report.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProgressResponse {
    /// `false` when the value did not move the participant forward.
    pub accepted: bool,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub milestone: Option<u8>,
    pub race: RaceSnapshot,
}

impl From<&Participant> for ParticipantView {
    fn from(participant: &Participant) -> Self {
        Self {
            user_id: participant.user_id.clone(),
            display_name: participant.display_name.clone(),
            progress: participant.progress,
            rank: participant.rank,
            status: participant.status,
            joined_at: format_system_time(participant.joined_at),
            completed_at: participant.completed_at.map(format_system_time),
            finish_order: participant.finish_order,
        }
    }
}

impl From<&Race> for RaceSnapshot {
    fn from(race: &Race) -> Self {
        let mut participants: Vec<ParticipantView> =
            race.participants.values().map(Into::into).collect();
        participants.sort_by_key(|p| p.rank.unwrap_or(u32::MAX));

        Self {
            id: race.id,
            title: race.title.clone(),
            organizer_id: race.organizer_id.clone(),
            target_progress: race.target_progress,
            max_participants: race.max_participants,
            status: race.status,
            schedule_time: race.schedule_time.map(format_system_time),
            countdown_ends_at: race.countdown_ends_at.map(format_system_time),
            started_at: race.started_at.map(format_system_time),
            deadline: race.deadline.map(format_system_time),
            ended_at: race.ended_at.map(format_system_time),
            first_finisher_id: race.first_finisher_id.clone(),
            cancellation_reason: race.cancellation_reason.clone(),
            participant_count: race.participant_count,
            active_participant_count: race.active_participant_count,
            completed_participant_count: race.completed_participant_count,
            top_participant: race.top_participant.as_ref().map(|top| LeaderView {
                user_id: top.user_id.clone(),
                display_name: top.display_name.clone(),
                progress: top.progress,
            }),
            participants,
            version: race.version,
            created_at: format_system_time(race.created_at),
            updated_at: format_system_time(race.updated_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn create_request_defaults_and_validation() {
        let request: CreateRaceRequest =
            serde_json::from_value(json!({ "title": "Park run", "target_progress": 5000.0 }))
                .unwrap();
        assert!(request.join);
        assert!(request.schedule_time.is_none());
        assert!(request.validate().is_ok());

        let bad: CreateRaceRequest = serde_json::from_value(json!({
            "title": "  ",
            "target_progress": 0.0,
            "schedule_time": "next friday",
            "max_participants": 0
        }))
        .unwrap();
        let errors = bad.validate().unwrap_err();
        let fields = errors.field_errors();
        for field in ["title", "target_progress", "schedule_time", "max_participants"] {
            assert!(fields.contains_key(field), "missing error for {field}");
        }
    }
}

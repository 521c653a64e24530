use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use crate::state::{
    notification::PendingNotification, race::ParticipantStatus, state_machine::RaceStatus,
};

/// Participant record embedded in its race document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParticipantEntity {
    /// Identity of the participant.
    pub user_id: String,
    /// Display name captured at join time.
    pub display_name: String,
    /// Last accepted progress value.
    pub progress: f64,
    /// Rank among non-left participants.
    pub rank: Option<u32>,
    /// Membership state.
    pub status: ParticipantStatus,
    /// Join timestamp.
    pub joined_at: SystemTime,
    /// Join sequence within the race.
    pub join_order: u32,
    /// Completion timestamp.
    pub completed_at: Option<SystemTime>,
    /// Arrival order among finishers.
    pub finish_order: Option<u32>,
    /// Milestones already announced.
    #[serde(default)]
    pub reached_milestones: Vec<u8>,
}

/// Cached leader snapshot stored on the race document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopParticipantEntity {
    pub user_id: String,
    pub display_name: String,
    pub progress: f64,
}

/// Race document persisted by the storage layer, participants included.
///
/// One document per race so that a single conditional write covers the race
/// fields and every participant at once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RaceEntity {
    /// Primary key of the race.
    pub id: Uuid,
    /// Title of the race.
    pub title: String,
    /// Creator of the race.
    pub organizer_id: String,
    /// Progress that counts as finishing.
    pub target_progress: f64,
    /// Optional participant cap.
    pub max_participants: Option<u32>,
    /// Lifecycle state.
    pub status: RaceStatus,
    /// Planned start.
    pub schedule_time: Option<SystemTime>,
    /// End of the countdown window.
    pub countdown_ends_at: Option<SystemTime>,
    /// When the race went live.
    pub started_at: Option<SystemTime>,
    /// Deadline of the ending window.
    pub deadline: Option<SystemTime>,
    /// When the race reached a terminal state.
    pub ended_at: Option<SystemTime>,
    /// First finisher, if any.
    pub first_finisher_id: Option<String>,
    /// Whether the deadline warning was already enqueued.
    pub countdown_notified: bool,
    /// Cached number of non-left participants.
    pub participant_count: u32,
    /// Cached number of racing participants.
    pub active_participant_count: u32,
    /// Cached number of finishers.
    pub completed_participant_count: u32,
    /// Cached leader snapshot.
    pub top_participant: Option<TopParticipantEntity>,
    /// Reason given on cancellation.
    pub cancellation_reason: Option<String>,
    /// Participants in join order.
    pub participants: Vec<ParticipantEntity>,
    /// Notifications committed with the race but not delivered yet.
    #[serde(default)]
    pub pending_notifications: Vec<PendingNotification>,
    /// Optimistic concurrency token.
    pub version: u64,
    /// Creation timestamp.
    pub created_at: SystemTime,
    /// Last update timestamp.
    pub updated_at: SystemTime,
}

use std::time::SystemTime;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    dao::models::{ParticipantEntity, RaceEntity, TopParticipantEntity},
    state::{
        notification::{Notification, Outbox, PendingNotification},
        state_machine::{RaceStatus, Timeline},
    },
};

/// Membership state of a participant inside one race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    /// Registered, has not raced yet.
    Joined,
    /// Racing.
    Active,
    /// Reached the target.
    Completed,
    /// Soft-deleted; kept for history.
    Left,
}

/// A user's membership and live progress within one race.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    /// Identity supplied by the session layer.
    pub user_id: String,
    /// Name shown in notifications.
    pub display_name: String,
    /// Distance or step count reported so far.
    pub progress: f64,
    /// 1-based position among non-left participants.
    pub rank: Option<u32>,
    /// Membership state.
    pub status: ParticipantStatus,
    /// Join timestamp.
    pub joined_at: SystemTime,
    /// Monotonic join sequence, used as the stable tie-breaker.
    pub join_order: u32,
    /// When the participant reached the target.
    pub completed_at: Option<SystemTime>,
    /// 1-based order of arrival among finishers.
    pub finish_order: Option<u32>,
    /// Milestone percentages already announced.
    pub reached_milestones: Vec<u8>,
}

impl Participant {
    /// Participants that still count towards standings.
    pub fn is_counted(&self) -> bool {
        self.status != ParticipantStatus::Left
    }

    /// Participants that may still report progress.
    pub fn is_racing(&self) -> bool {
        matches!(
            self.status,
            ParticipantStatus::Joined | ParticipantStatus::Active
        )
    }
}

/// Cached snapshot of the current leader.
#[derive(Debug, Clone, PartialEq)]
pub struct TopParticipant {
    /// Leader identity.
    pub user_id: String,
    /// Leader display name.
    pub display_name: String,
    /// Leader progress.
    pub progress: f64,
}

/// Input needed to open a new race.
#[derive(Debug, Clone)]
pub struct RaceDraft {
    /// Title shown to participants.
    pub title: String,
    /// Creator of the race.
    pub organizer_id: String,
    /// Creator display name, used when the organizer joins.
    pub organizer_name: String,
    /// Progress that counts as finishing.
    pub target_progress: f64,
    /// Planned start; `None` opens a quick race directly in ACTIVE.
    pub schedule_time: Option<SystemTime>,
    /// Optional participant cap.
    pub max_participants: Option<u32>,
    /// Register the organizer as first participant.
    pub organizer_joins: bool,
}

/// Aggregate race state, read and written as one unit inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Race {
    /// Immutable identifier.
    pub id: Uuid,
    /// Title shown to participants.
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
    /// When the race went ACTIVE.
    pub started_at: Option<SystemTime>,
    /// Deadline of the ENDING window.
    pub deadline: Option<SystemTime>,
    /// When the race reached a terminal state.
    pub ended_at: Option<SystemTime>,
    /// First participant to reach the target; written at most once.
    pub first_finisher_id: Option<String>,
    /// Guards the one-shot deadline warning.
    pub countdown_notified: bool,
    /// Non-left participants.
    pub participant_count: u32,
    /// Participants currently racing.
    pub active_participant_count: u32,
    /// Participants that finished.
    pub completed_participant_count: u32,
    /// Current leader.
    pub top_participant: Option<TopParticipant>,
    /// Reason given on cancellation.
    pub cancellation_reason: Option<String>,
    /// Participants in join order, keyed by user id.
    pub participants: IndexMap<String, Participant>,
    /// Outbox entries still waiting for the push sender.
    pub pending_notifications: Vec<PendingNotification>,
    /// Incremented on every committed write.
    pub version: u64,
    /// Creation timestamp.
    pub created_at: SystemTime,
    /// Last committed write.
    pub updated_at: SystemTime,
}

impl Race {
    /// Build a race from a draft. Quick races start ACTIVE, scheduled ones SCHEDULED.
    pub fn new(draft: RaceDraft, now: SystemTime) -> Self {
        let status = if draft.schedule_time.is_some() {
            RaceStatus::Scheduled
        } else {
            RaceStatus::Active
        };

        let mut race = Self {
            id: Uuid::new_v4(),
            title: draft.title,
            organizer_id: draft.organizer_id.clone(),
            target_progress: draft.target_progress,
            max_participants: draft.max_participants,
            status,
            schedule_time: draft.schedule_time,
            countdown_ends_at: None,
            started_at: (status == RaceStatus::Active).then_some(now),
            deadline: None,
            ended_at: None,
            first_finisher_id: None,
            countdown_notified: false,
            participant_count: 0,
            active_participant_count: 0,
            completed_participant_count: 0,
            top_participant: None,
            cancellation_reason: None,
            participants: IndexMap::new(),
            pending_notifications: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        };

        if draft.organizer_joins {
            let participant = race.new_participant(draft.organizer_id, draft.organizer_name, now);
            race.participants
                .insert(participant.user_id.clone(), participant);
        }

        race
    }

    /// Clock-relevant fields for the state machine.
    pub fn timeline(&self) -> Timeline {
        Timeline {
            status: self.status,
            schedule_time: self.schedule_time,
            countdown_ends_at: self.countdown_ends_at,
            deadline: self.deadline,
        }
    }

    /// Create a participant record with the next join sequence number.
    pub fn new_participant(
        &self,
        user_id: String,
        display_name: String,
        now: SystemTime,
    ) -> Participant {
        let join_order = self
            .participants
            .values()
            .map(|p| p.join_order)
            .max()
            .map_or(1, |max| max + 1);
        let status = if self.status == RaceStatus::Active {
            ParticipantStatus::Active
        } else {
            ParticipantStatus::Joined
        };

        Participant {
            user_id,
            display_name,
            progress: 0.0,
            rank: None,
            status,
            joined_at: now,
            join_order,
            completed_at: None,
            finish_order: None,
            reached_milestones: Vec::new(),
        }
    }

    /// Participants that still count towards standings, in join order.
    pub fn counted(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values().filter(|p| p.is_counted())
    }

    /// Identifiers of every non-left participant.
    pub fn counted_ids(&self) -> Vec<String> {
        self.counted().map(|p| p.user_id.clone()).collect()
    }

    /// Identifiers of participants still racing (not completed nor left).
    pub fn racing_ids(&self) -> Vec<String> {
        self.participants
            .values()
            .filter(|p| p.is_racing())
            .map(|p| p.user_id.clone())
            .collect()
    }

    /// Store the outbox on the race and return the notifications it held.
    pub fn enqueue(&mut self, outbox: Outbox, queued_at: SystemTime) -> Vec<Notification> {
        let fresh = outbox.into_vec();
        self.pending_notifications.extend(
            fresh
                .iter()
                .cloned()
                .map(|notification| PendingNotification::new(notification, queued_at)),
        );
        fresh
    }

    /// Display name for a user, falling back to the raw identifier.
    pub fn display_name(&self, user_id: &str) -> String {
        self.participants
            .get(user_id)
            .map(|p| p.display_name.clone())
            .unwrap_or_else(|| user_id.to_string())
    }
}

impl From<ParticipantEntity> for Participant {
    fn from(value: ParticipantEntity) -> Self {
        Self {
            user_id: value.user_id,
            display_name: value.display_name,
            progress: value.progress,
            rank: value.rank,
            status: value.status,
            joined_at: value.joined_at,
            join_order: value.join_order,
            completed_at: value.completed_at,
            finish_order: value.finish_order,
            reached_milestones: value.reached_milestones,
        }
    }
}

impl From<Participant> for ParticipantEntity {
    fn from(value: Participant) -> Self {
        Self {
            user_id: value.user_id,
            display_name: value.display_name,
            progress: value.progress,
            rank: value.rank,
            status: value.status,
            joined_at: value.joined_at,
            join_order: value.join_order,
            completed_at: value.completed_at,
            finish_order: value.finish_order,
            reached_milestones: value.reached_milestones,
        }
    }
}

impl From<TopParticipantEntity> for TopParticipant {
    fn from(value: TopParticipantEntity) -> Self {
        Self {
            user_id: value.user_id,
            display_name: value.display_name,
            progress: value.progress,
        }
    }
}

impl From<TopParticipant> for TopParticipantEntity {
    fn from(value: TopParticipant) -> Self {
        Self {
            user_id: value.user_id,
            display_name: value.display_name,
            progress: value.progress,
        }
    }
}

impl From<RaceEntity> for Race {
    fn from(value: RaceEntity) -> Self {
        let participants = value
            .participants
            .into_iter()
            .map(|entity| (entity.user_id.clone(), entity.into()))
            .collect();

        Self {
            id: value.id,
            title: value.title,
            organizer_id: value.organizer_id,
            target_progress: value.target_progress,
            max_participants: value.max_participants,
            status: value.status,
            schedule_time: value.schedule_time,
            countdown_ends_at: value.countdown_ends_at,
            started_at: value.started_at,
            deadline: value.deadline,
            ended_at: value.ended_at,
            first_finisher_id: value.first_finisher_id,
            countdown_notified: value.countdown_notified,
            participant_count: value.participant_count,
            active_participant_count: value.active_participant_count,
            completed_participant_count: value.completed_participant_count,
            top_participant: value.top_participant.map(Into::into),
            cancellation_reason: value.cancellation_reason,
            participants,
            pending_notifications: value.pending_notifications,
            version: value.version,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

impl From<Race> for RaceEntity {
    fn from(value: Race) -> Self {
        Self {
            id: value.id,
            title: value.title,
            organizer_id: value.organizer_id,
            target_progress: value.target_progress,
            max_participants: value.max_participants,
            status: value.status,
            schedule_time: value.schedule_time,
            countdown_ends_at: value.countdown_ends_at,
            started_at: value.started_at,
            deadline: value.deadline,
            ended_at: value.ended_at,
            first_finisher_id: value.first_finisher_id,
            countdown_notified: value.countdown_notified,
            participant_count: value.participant_count,
            active_participant_count: value.active_participant_count,
            completed_participant_count: value.completed_participant_count,
            top_participant: value.top_participant.map(Into::into),
            cancellation_reason: value.cancellation_reason,
            participants: value.participants.into_values().map(Into::into).collect(),
            pending_notifications: value.pending_notifications,
            version: value.version,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

//! Notification records produced by race transactions and external triggers.
//!
//! A transaction never talks to the push transport directly: it appends
//! [`Notification`]s to an [`Outbox`]. On commit the outbox is stored on the
//! race document as [`PendingNotification`]s, in the same conditional write,
//! and entries leave the document only once the push sender accepted them.

use std::{fmt, time::SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;
use uuid::Uuid;

/// Every kind of push notification the service emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    RaceCreated,
    ParticipantJoined,
    RaceStarted,
    FirstFinisher,
    DeadlineAlert,
    DeadlineWarning,
    RaceCompleted,
    RaceCancelled,
    LeaderChanged,
    Overtaking,
    Overtaken,
    /// Overtake seen by the rest of the field.
    OvertakingAlert,
    MilestonePersonal,
    MilestoneAlert,
    RaceInvite,
    InviteAccepted,
    InviteDeclined,
    JoinRequest,
    JoinRequestAccepted,
    JoinRequestDeclined,
    FriendRequest,
    FriendAccepted,
    FriendDeclined,
    FriendRemoved,
    DirectMessage,
    RaceChatMessage,
}

impl NotificationKind {
    /// Wire label, also the first segment of dedup keys.
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::RaceCreated => "race_created",
            NotificationKind::ParticipantJoined => "participant_joined",
            NotificationKind::RaceStarted => "race_started",
            NotificationKind::FirstFinisher => "first_finisher",
            NotificationKind::DeadlineAlert => "deadline_alert",
            NotificationKind::DeadlineWarning => "deadline_warning",
            NotificationKind::RaceCompleted => "race_completed",
            NotificationKind::RaceCancelled => "race_cancelled",
            NotificationKind::LeaderChanged => "leader_changed",
            NotificationKind::Overtaking => "overtaking",
            NotificationKind::Overtaken => "overtaken",
            NotificationKind::OvertakingAlert => "overtaking_alert",
            NotificationKind::MilestonePersonal => "milestone_personal",
            NotificationKind::MilestoneAlert => "milestone_alert",
            NotificationKind::RaceInvite => "race_invite",
            NotificationKind::InviteAccepted => "invite_accepted",
            NotificationKind::InviteDeclined => "invite_declined",
            NotificationKind::JoinRequest => "join_request",
            NotificationKind::JoinRequestAccepted => "join_request_accepted",
            NotificationKind::JoinRequestDeclined => "join_request_declined",
            NotificationKind::FriendRequest => "friend_request",
            NotificationKind::FriendAccepted => "friend_accepted",
            NotificationKind::FriendDeclined => "friend_declined",
            NotificationKind::FriendRemoved => "friend_removed",
            NotificationKind::DirectMessage => "direct_message",
            NotificationKind::RaceChatMessage => "race_chat_message",
        }
    }

    /// Kinds produced by the race lifecycle itself; the rest come from
    /// `POST /notifications`.
    pub fn is_lifecycle(self) -> bool {
        !matches!(
            self,
            NotificationKind::RaceInvite
                | NotificationKind::InviteAccepted
                | NotificationKind::InviteDeclined
                | NotificationKind::JoinRequest
                | NotificationKind::JoinRequestAccepted
                | NotificationKind::JoinRequestDeclined
                | NotificationKind::FriendRequest
                | NotificationKind::FriendAccepted
                | NotificationKind::FriendDeclined
                | NotificationKind::FriendRemoved
                | NotificationKind::DirectMessage
                | NotificationKind::RaceChatMessage
        )
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message addressed to one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Notification {
    pub kind: NotificationKind,
    /// Race id for lifecycle events, caller-chosen for external ones.
    pub entity_id: String,
    pub recipient_id: String,
    /// Distinguishes repeated events of the same kind; empty for once-only events.
    pub occurrence: String,
    pub title: String,
    pub body: String,
    /// Free-form payload forwarded to the client.
    #[schema(value_type = Object)]
    pub data: Map<String, Value>,
}

impl Notification {
    /// Idempotency key over `(kind, entity, recipient, occurrence)`.
    ///
    /// Each free-form part is prefixed with its byte length, so parts that
    /// contain `:` cannot run into their neighbours.
    pub fn dedup_key(&self) -> String {
        let mut key = String::from(self.kind.as_str());
        for part in [&self.entity_id, &self.recipient_id, &self.occurrence] {
            key.push_str(&format!(":{}:{part}", part.len()));
        }
        key
    }
}

/// A notification stored on its race document until it is delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingNotification {
    pub notification: Notification,
    /// Commit time of the transaction that produced it.
    pub queued_at: SystemTime,
    /// Dispatch rounds that ended without delivery.
    #[serde(default)]
    pub failed_rounds: u32,
}

impl PendingNotification {
    pub fn new(notification: Notification, queued_at: SystemTime) -> Self {
        Self {
            notification,
            queued_at,
            failed_rounds: 0,
        }
    }
}

/// Recipient-independent part of a notification.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: NotificationKind,
    pub occurrence: String,
    pub title: String,
    pub body: String,
    pub data: Map<String, Value>,
}

impl Message {
    /// Once-only message (empty occurrence).
    pub fn new(kind: NotificationKind, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind,
            occurrence: String::new(),
            title: title.into(),
            body: body.into(),
            data: Map::new(),
        }
    }

    /// Tag repeatable events so each occurrence gets its own dedup key.
    pub fn occurrence(mut self, occurrence: impl ToString) -> Self {
        self.occurrence = occurrence.to_string();
        self
    }

    /// Add `key` to the client payload.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    fn addressed(&self, entity_id: &str, recipient_id: String) -> Notification {
        Notification {
            kind: self.kind,
            entity_id: entity_id.to_string(),
            recipient_id,
            occurrence: self.occurrence.clone(),
            title: self.title.clone(),
            body: self.body.clone(),
            data: self.data.clone(),
        }
    }
}

/// Notifications collected during one transaction attempt.
#[derive(Debug, Default)]
pub struct Outbox {
    entries: Vec<Notification>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `message` for a single recipient of race `race_id`.
    pub fn send(&mut self, race_id: Uuid, recipient: impl Into<String>, message: Message) {
        let entity = race_id.to_string();
        self.entries.push(message.addressed(&entity, recipient.into()));
    }

    /// Queue `message` for every recipient except `actor`.
    pub fn fan_out<I>(
        &mut self,
        race_id: Uuid,
        recipients: I,
        actor: Option<&str>,
        message: &Message,
    ) where
        I: IntoIterator<Item = String>,
    {
        let entity = race_id.to_string();
        self.entries.extend(
            recipients
                .into_iter()
                .filter(|recipient| Some(recipient.as_str()) != actor)
                .map(|recipient| message.addressed(&entity, recipient)),
        );
    }

    pub fn push(&mut self, notification: Notification) {
        self.entries.push(notification);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry queued after the first `len`.
    pub fn truncate(&mut self, len: usize) {
        self.entries.truncate(len);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.entries.iter()
    }

    pub fn into_vec(self) -> Vec<Notification> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_includes_occurrence() {
        let race = Uuid::nil();
        let mut outbox = Outbox::new();
        outbox.send(
            race,
            "bob",
            Message::new(NotificationKind::Overtaken, "t", "b").occurrence(7),
        );
        let key = outbox.iter().next().map(Notification::dedup_key);
        assert_eq!(
            key.as_deref(),
            Some(&*format!("overtaken:36:{race}:3:bob:1:7"))
        );
    }

    #[test]
    fn dedup_keys_keep_colons_inside_their_part() {
        let chat = |entity: &str, recipient: &str| Notification {
            kind: NotificationKind::DirectMessage,
            entity_id: entity.into(),
            recipient_id: recipient.into(),
            occurrence: String::new(),
            title: "t".into(),
            body: "b".into(),
            data: Map::new(),
        };
        assert_ne!(
            chat("chat:alice", "bob").dedup_key(),
            chat("chat", "alice:bob").dedup_key()
        );
        assert_ne!(chat("a:", "b").dedup_key(), chat("a", ":b").dedup_key());
    }

    #[test]
    fn fan_out_skips_the_actor() {
        let message = Message::new(NotificationKind::RaceStarted, "go", "go");
        let mut outbox = Outbox::new();
        outbox.fan_out(
            Uuid::nil(),
            ["alice".to_string(), "bob".to_string(), "carol".to_string()],
            Some("bob"),
            &message,
        );

        let recipients: Vec<_> = outbox.iter().map(|n| n.recipient_id.as_str()).collect();
        assert_eq!(recipients, ["alice", "carol"]);
        assert!(outbox.iter().all(|n| n.occurrence.is_empty()));
    }

    #[test]
    fn external_kinds_are_not_lifecycle() {
        assert!(NotificationKind::RaceStarted.is_lifecycle());
        assert!(NotificationKind::OvertakingAlert.is_lifecycle());
        for kind in [
            NotificationKind::InviteAccepted,
            NotificationKind::InviteDeclined,
            NotificationKind::JoinRequestAccepted,
            NotificationKind::JoinRequestDeclined,
            NotificationKind::FriendDeclined,
            NotificationKind::FriendRemoved,
            NotificationKind::DirectMessage,
            NotificationKind::RaceChatMessage,
        ] {
            assert!(!kind.is_lifecycle(), "{kind}");
        }
    }

    #[test]
    fn wire_labels_match_serde() {
        for kind in [
            NotificationKind::OvertakingAlert,
            NotificationKind::JoinRequestDeclined,
            NotificationKind::RaceChatMessage,
        ] {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, Value::String(kind.as_str().to_string()));
        }
    }

    #[test]
    fn truncate_rolls_back_later_entries() {
        let message = Message::new(NotificationKind::RaceStarted, "go", "go");
        let mut outbox = Outbox::new();
        outbox.send(Uuid::nil(), "a", message.clone());
        let checkpoint = outbox.len();
        outbox.send(Uuid::nil(), "b", message);
        outbox.truncate(checkpoint);
        assert_eq!(outbox.len(), 1);
    }
}

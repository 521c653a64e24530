use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::dto::sse::ServerEvent;

/// SSE-specific sub-state carved out from [`AppState`](super::AppState).
pub struct SseState {
    races: SseHub,
    notifications: NotificationHub,
}

impl SseState {
    /// Build the SSE sub-tree with per-stream channel capacities.
    pub fn new(races_capacity: usize, notifications_capacity: usize) -> Self {
        Self {
            races: SseHub::new(races_capacity),
            notifications: NotificationHub::new(notifications_capacity),
        }
    }

    /// Hub carrying public race status changes.
    pub fn races(&self) -> &SseHub {
        &self.races
    }

    /// Hub carrying per-user notifications.
    pub fn notifications(&self) -> &NotificationHub {
        &self.notifications
    }
}

/// Simple broadcast hub wrapper used by the SSE services.
pub struct SseHub {
    sender: broadcast::Sender<ServerEvent>,
}

impl SseHub {
    /// Construct a new hub backed by a Tokio broadcast channel with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a new subscriber that will receive subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    /// Send an event to all current subscribers, ignoring delivery errors.
    pub fn broadcast(&self, event: ServerEvent) {
        let _ = self.sender.send(event);
    }
}

/// An SSE event addressed to a single user.
#[derive(Debug)]
pub struct UserEvent {
    pub recipient_id: String,
    pub event: ServerEvent,
}

/// Broadcast hub whose subscribers filter events by recipient.
///
/// Open subscriptions are counted per user so a publish for somebody who is
/// not connected is reported as undelivered.
#[derive(Clone)]
pub struct NotificationHub {
    sender: broadcast::Sender<Arc<UserEvent>>,
    connected: Arc<DashMap<String, usize>>,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self {
            sender,
            connected: Arc::new(DashMap::new()),
        }
    }

    /// Open a stream of the events addressed to `user_id`.
    pub fn subscribe(&self, user_id: &str) -> UserSubscription {
        *self.connected.entry(user_id.to_string()).or_insert(0) += 1;
        UserSubscription {
            receiver: self.sender.subscribe(),
            user_id: user_id.to_string(),
            connected: self.connected.clone(),
        }
    }

    /// Whether `user_id` has at least one open subscription.
    pub fn is_connected(&self, user_id: &str) -> bool {
        self.connected.contains_key(user_id)
    }

    /// Publish an event; `false` when its recipient is not listening.
    pub fn publish(&self, event: UserEvent) -> bool {
        if !self.is_connected(&event.recipient_id) {
            return false;
        }
        self.sender.send(Arc::new(event)).is_ok()
    }
}

/// One user's view of the [`NotificationHub`]; unregisters itself on drop.
pub struct UserSubscription {
    receiver: broadcast::Receiver<Arc<UserEvent>>,
    user_id: String,
    connected: Arc<DashMap<String, usize>>,
}

impl UserSubscription {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Next event for this user; `None` once the hub is gone.
    pub async fn next(&mut self) -> Option<ServerEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.recipient_id == self.user_id => return Some(event.event.clone()),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(user_id = %self.user_id, skipped, "notification stream lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for UserSubscription {
    fn drop(&mut self) {
        if let Entry::Occupied(mut entry) = self.connected.entry(self.user_id.clone()) {
            *entry.get_mut() -= 1;
            if *entry.get() == 0 {
                entry.remove();
            }
        }
    }
}

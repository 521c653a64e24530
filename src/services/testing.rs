//! Shared fixtures for service tests.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, SystemTime},
};

use futures::future::BoxFuture;
use serde_json::Value;

use crate::{
    config::AppConfig,
    dao::race_store::memory::MemoryRaceStore,
    services::push::{MessageId, PushSender, SendError},
    state::{AppState, SharedState, clock::ManualClock, notification::NotificationKind},
};

/// Records every message; fails the next `failures` sends.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(String, NotificationKind, Value)>>,
    pub failures: AtomicU32,
}

impl RecordingSender {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<(String, NotificationKind, Value)> {
        self.sent.lock().unwrap().clone()
    }

    /// Recipients of `kind`, in send order.
    pub fn recipients(&self, kind: NotificationKind) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(recipient, _, _)| recipient)
            .collect()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        self.recipients(kind).len()
    }
}

impl PushSender for RecordingSender {
    fn send(
        &self,
        recipient_id: String,
        kind: NotificationKind,
        payload: Value,
    ) -> BoxFuture<'static, Result<MessageId, SendError>> {
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !fail {
            self.sent
                .lock()
                .unwrap()
                .push((recipient_id.clone(), kind, payload));
        }
        Box::pin(async move {
            if fail {
                Err(SendError::NoSubscriber { recipient_id })
            } else {
                Ok("test-message".to_string())
            }
        })
    }
}

pub fn epoch(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

/// State backed by a fresh in-memory store and the given sender.
pub async fn memory_state(
    config: AppConfig,
    sender: &Arc<RecordingSender>,
    clock: Option<Arc<ManualClock>>,
) -> SharedState {
    let mut builder = AppState::builder(config).push(sender.clone());
    if let Some(clock) = clock {
        builder = builder.clock(clock);
    }
    let state = builder.build();
    state
        .install_race_store(Arc::new(MemoryRaceStore::new()))
        .await;
    state
}

/// Let detached notification batches run to completion.
pub async fn flush() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

//! Post-commit notification fan-out and redelivery.
//!
//! Notifications live on their race document until the push sender accepted
//! them. Before a send the dispatcher leases the dedup key in the store, so
//! two dispatchers never send the same notification at once and a delivered
//! key is never sent again. A lease left behind by a crashed process expires
//! after `push.redelivery_delay`, and [`redeliver`] picks the entry up again.

use std::collections::HashSet;

use futures::{StreamExt, stream};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    dao::race_store::DeliveryClaim,
    error::ServiceError,
    state::{
        SharedState,
        notification::Notification,
        transitions::{self, Step},
    },
};

const MAX_CONCURRENT_SENDS: usize = 8;

/// Per-batch delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct DispatchReport {
    /// Accepted by the push transport.
    pub sent: u32,
    /// Already delivered earlier under the same dedup key.
    pub duplicates: u32,
    /// Being sent by another dispatcher right now.
    pub in_flight: u32,
    /// Gave up after retries, or could not be claimed.
    pub failed: u32,
}

impl DispatchReport {
    fn absorb(&mut self, other: DispatchReport) {
        self.sent += other.sent;
        self.duplicates += other.duplicates;
        self.in_flight += other.in_flight;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    Duplicate,
    InFlight,
    Failed,
}

/// Hand the notifications just committed on race `race_id` to a background task.
pub fn dispatch_detached(state: &SharedState, race_id: Uuid, notifications: Vec<Notification>) {
    if notifications.is_empty() {
        return;
    }

    let state = state.clone();
    tokio::spawn(async move {
        let report = dispatch_pending(&state, race_id, notifications).await;
        if report.failed > 0 {
            warn!(
                %race_id,
                sent = report.sent,
                duplicates = report.duplicates,
                failed = report.failed,
                "notification batch finished with failures; kept pending"
            );
        } else {
            debug!(
                %race_id,
                sent = report.sent,
                duplicates = report.duplicates,
                in_flight = report.in_flight,
                "notification batch delivered"
            );
        }
    });
}

/// Deliver `notifications` that carry no race document, at most
/// [`MAX_CONCURRENT_SENDS`] at a time.
pub async fn dispatch(state: &SharedState, notifications: Vec<Notification>) -> DispatchReport {
    summarize(&deliver_all(state, notifications).await)
}

/// Deliver notifications pending on race `race_id`, then settle its document:
/// delivered entries leave it, failed ones count a round and stay.
pub async fn dispatch_pending(
    state: &SharedState,
    race_id: Uuid,
    notifications: Vec<Notification>,
) -> DispatchReport {
    let outcomes = deliver_all(state, notifications).await;
    settle(state, race_id, &outcomes).await;
    summarize(&outcomes)
}

/// Re-send every pending notification older than `push.redelivery_delay`.
pub async fn redeliver(state: &SharedState) -> Result<DispatchReport, ServiceError> {
    let store = state.require_race_store().await?;
    let races = store.list_races_with_pending().await?;
    let now = state.now();
    let delay = state.config().push.redelivery_delay;

    let mut report = DispatchReport::default();
    for race in races {
        let due: Vec<Notification> = race
            .pending_notifications
            .into_iter()
            .filter(|pending| {
                now.duration_since(pending.queued_at)
                    .is_ok_and(|age| age >= delay)
            })
            .map(|pending| pending.notification)
            .collect();
        if due.is_empty() {
            continue;
        }

        debug!(race_id = %race.id, count = due.len(), "redelivering pending notifications");
        report.absorb(dispatch_pending(state, race.id, due).await);
    }
    Ok(report)
}

async fn deliver_all(
    state: &SharedState,
    notifications: Vec<Notification>,
) -> Vec<(String, Delivery)> {
    stream::iter(notifications)
        .map(|notification| async move {
            let key = notification.dedup_key();
            let outcome = deliver(state, &key, notification).await;
            (key, outcome)
        })
        .buffer_unordered(MAX_CONCURRENT_SENDS)
        .collect()
        .await
}

fn summarize(outcomes: &[(String, Delivery)]) -> DispatchReport {
    let mut report = DispatchReport::default();
    for (_, outcome) in outcomes {
        match outcome {
            Delivery::Sent => report.sent += 1,
            Delivery::Duplicate => report.duplicates += 1,
            Delivery::InFlight => report.in_flight += 1,
            Delivery::Failed => report.failed += 1,
        }
    }
    report
}

async fn deliver(state: &SharedState, key: &str, notification: Notification) -> Delivery {
    let Some(store) = state.race_store().await else {
        warn!(key, "no storage installed; notification stays pending");
        return Delivery::Failed;
    };

    let settings = &state.config().push;
    let now = state.now();
    match store
        .claim_delivery(key.to_string(), now, now + settings.redelivery_delay)
        .await
    {
        Ok(DeliveryClaim::Acquired) => {}
        Ok(DeliveryClaim::Delivered) => {
            debug!(key, "notification already delivered; skipping");
            return Delivery::Duplicate;
        }
        Ok(DeliveryClaim::Busy) => {
            debug!(key, "notification is being sent by another dispatcher");
            return Delivery::InFlight;
        }
        Err(err) => {
            warn!(key, error = %err, "failed to claim notification delivery");
            return Delivery::Failed;
        }
    }

    let payload = match serde_json::to_value(&notification) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(key, error = %err, "failed to encode notification");
            release(state, key).await;
            return Delivery::Failed;
        }
    };

    let push = state.push();
    for attempt in 1..=settings.attempts {
        match push
            .send(
                notification.recipient_id.clone(),
                notification.kind,
                payload.clone(),
            )
            .await
        {
            Ok(message_id) => {
                debug!(key, message_id, attempt, "notification sent");
                if let Err(err) = store.complete_delivery(key.to_string()).await {
                    warn!(key, error = %err, "failed to record notification delivery");
                }
                return Delivery::Sent;
            }
            Err(err) => {
                warn!(key, attempt, error = %err, "push send failed");
                if attempt < settings.attempts {
                    sleep(settings.retry_delay).await;
                }
            }
        }
    }

    release(state, key).await;
    Delivery::Failed
}

async fn release(state: &SharedState, key: &str) {
    let Some(store) = state.race_store().await else {
        return;
    };
    if let Err(err) = store.release_delivery(key.to_string()).await {
        warn!(key, error = %err, "failed to release notification claim");
    }
}

/// Drop delivered entries from the race and count a round against failed ones.
async fn settle(state: &SharedState, race_id: Uuid, outcomes: &[(String, Delivery)]) {
    let mut done = HashSet::new();
    let mut failed = HashSet::new();
    for (key, outcome) in outcomes {
        match outcome {
            Delivery::Sent | Delivery::Duplicate => {
                done.insert(key.as_str());
            }
            Delivery::Failed => {
                failed.insert(key.as_str());
            }
            Delivery::InFlight => {}
        }
    }
    if done.is_empty() && failed.is_empty() {
        return;
    }

    let max_rounds = state.config().push.max_delivery_rounds;
    let result = transitions::read_modify_write(state, race_id, |race, _| {
        let before = race.pending_notifications.clone();
        let mut abandoned = Vec::new();
        race.pending_notifications.retain_mut(|pending| {
            let key = pending.notification.dedup_key();
            if done.contains(key.as_str()) {
                return false;
            }
            if failed.contains(key.as_str()) {
                pending.failed_rounds += 1;
                if pending.failed_rounds >= max_rounds {
                    abandoned.push(key);
                    return false;
                }
            }
            true
        });

        Ok(if race.pending_notifications == before {
            Step::Skip(abandoned)
        } else {
            Step::Write(abandoned)
        })
    })
    .await;

    match result {
        Ok(committed) => {
            for key in committed.value {
                warn!(%race_id, key, rounds = max_rounds, "dropping undeliverable notification");
            }
        }
        // The entries stay pending and the next redelivery settles them.
        Err(err) => warn!(%race_id, error = %err, "failed to settle pending notifications"),
    }
}

//! Optimistic read-modify-write over a single race document.
//!
//! Every mutation reads the race, applies a closure to a private snapshot and
//! writes it back conditioned on the version it read. A lost write is retried
//! from a fresh read, so closures must be pure over their inputs.
//!
//! The notifications a closure queues are stored on the race in that same
//! write, so a crash after the commit cannot lose them.

use std::time::{Duration, SystemTime};

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    config::{AppConfig, TransactionSettings},
    error::ServiceError,
    services::{aggregator, dispatcher, sse_events},
    state::{SharedState, notification::Outbox, race::Race},
};

/// Per-attempt inputs handed to a mutation closure.
pub struct TxContext<'a> {
    /// Instant the attempt runs at.
    pub now: SystemTime,
    /// Runtime settings.
    pub config: &'a AppConfig,
    /// Notifications released only if this attempt commits.
    pub outbox: Outbox,
}

/// Decision returned by a mutation closure.
pub enum Step<T> {
    /// Persist the mutated snapshot.
    Write(T),
    /// Nothing to persist; the snapshot is discarded.
    Skip(T),
}

/// Result of a read-modify-write.
#[derive(Debug)]
pub struct Committed<T> {
    /// Value produced by the closure.
    pub value: T,
    /// The race as stored after the operation.
    pub race: Race,
    /// Whether a write happened.
    pub written: bool,
}

/// Run `mutate` against race `race_id` until its conditional write lands.
///
/// The snapshot carries the version it will be committed under, so
/// notifications may use it as their occurrence. After the commit the status
/// change is broadcast and the freshly queued notifications are dispatched.
pub async fn read_modify_write<T, F>(
    state: &SharedState,
    race_id: Uuid,
    mut mutate: F,
) -> Result<Committed<T>, ServiceError>
where
    F: FnMut(&mut Race, &mut TxContext<'_>) -> Result<Step<T>, ServiceError>,
{
    let settings = &state.config().transactions;
    let store = state.require_race_store().await?;

    for attempt in 1..=settings.max_attempts {
        let entity = store
            .find_race(race_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("race `{race_id}`")))?;
        let mut race = Race::from(entity);
        let expected = race.version;
        let previous = race.status;

        let mut ctx = TxContext {
            now: state.now(),
            config: state.config(),
            outbox: Outbox::new(),
        };
        race.version = expected + 1;

        let value = match mutate(&mut race, &mut ctx)? {
            Step::Write(value) => value,
            Step::Skip(value) => {
                race.version = expected;
                return Ok(Committed {
                    value,
                    race,
                    written: false,
                });
            }
        };

        race.updated_at = ctx.now;
        aggregator::recompute(&mut race)?;
        let queued = race.enqueue(std::mem::take(&mut ctx.outbox), ctx.now);

        match store.replace_race(race.clone().into(), expected).await {
            Ok(()) => {
                debug!(%race_id, version = race.version, status = %race.status, "race committed");
                sse_events::broadcast_race_status_changed(state, previous, &race);
                dispatcher::dispatch_detached(state, race_id, queued);
                return Ok(Committed {
                    value,
                    race,
                    written: true,
                });
            }
            Err(err) if err.is_conflict() => {
                debug!(%race_id, attempt, "conditional write lost; retrying");
                if attempt < settings.max_attempts {
                    sleep(backoff(settings, attempt)).await;
                }
            }
            Err(err) => return Err(err.into()),
        }
    }

    warn!(
        %race_id,
        attempts = settings.max_attempts,
        "giving up on contended race"
    );
    Err(ServiceError::AggregationConflict {
        race_id,
        attempts: settings.max_attempts,
    })
}

/// Persist a brand-new race together with its outbox, then dispatch it.
pub async fn insert(
    state: &SharedState,
    mut race: Race,
    outbox: Outbox,
) -> Result<Race, ServiceError> {
    aggregator::recompute(&mut race)?;
    let created_at = race.created_at;
    let queued = race.enqueue(outbox, created_at);
    let store = state.require_race_store().await?;
    store.insert_race(race.clone().into()).await?;

    debug!(race_id = %race.id, status = %race.status, "race created");
    sse_events::broadcast_race_created(state, &race);
    dispatcher::dispatch_detached(state, race.id, queued);
    Ok(race)
}

/// Exponential delay for retry `attempt` (1-based), capped and jittered to 50..100%.
fn backoff(settings: &TransactionSettings, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = settings
        .base_backoff
        .saturating_mul(1 << exponent)
        .min(settings.max_backoff);
    delay.mul_f64(rand::rng().random_range(0.5..=1.0))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::future::join_all;

    use super::*;
    use crate::{
        services::testing::{RecordingSender, memory_state},
        state::{
            notification::{Message, NotificationKind},
            race::RaceDraft,
        },
    };

    fn draft() -> RaceDraft {
        RaceDraft {
            title: "Lunch loop".into(),
            organizer_id: "org".into(),
            organizer_name: "Org".into(),
            target_progress: 100.0,
            schedule_time: None,
            max_participants: None,
            organizer_joins: false,
        }
    }

    #[test]
    fn backoff_grows_and_stays_capped() {
        let settings = TransactionSettings {
            max_attempts: 5,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        };
        let first = backoff(&settings, 1);
        assert!(first >= Duration::from_millis(5) && first <= Duration::from_millis(10));
        for attempt in 3..10 {
            let delay = backoff(&settings, attempt);
            assert!(delay >= Duration::from_millis(20) && delay <= Duration::from_millis(40));
        }
    }

    #[tokio::test]
    async fn skip_leaves_the_stored_version_alone() {
        let sender = RecordingSender::shared();
        let state = memory_state(AppConfig::default(), &sender, None).await;
        let race = insert(&state, Race::new(draft(), state.now()), Outbox::new())
            .await
            .unwrap();

        let committed = read_modify_write(&state, race.id, |_, _| Ok(Step::Skip(())))
            .await
            .unwrap();
        assert!(!committed.written);
        assert_eq!(committed.race.version, 0);
    }

    #[tokio::test]
    async fn concurrent_writers_are_serialized() {
        let sender = RecordingSender::shared();
        let mut config = AppConfig::default();
        config.transactions.max_attempts = 50;
        config.transactions.base_backoff = Duration::from_millis(1);
        config.transactions.max_backoff = Duration::from_millis(5);
        let state = memory_state(config, &sender, None).await;
        let race = insert(&state, Race::new(draft(), state.now()), Outbox::new())
            .await
            .unwrap();

        let writers = (0..10).map(|i| {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                read_modify_write(&state, race.id, |race, ctx| {
                    let user = format!("user-{i}");
                    aggregator::join(race, &user, &user, ctx.now)?;
                    Ok(Step::Write(()))
                })
                .await
            })
        });
        for result in join_all(writers).await {
            result.unwrap().unwrap();
        }

        let store = state.race_store().await.unwrap();
        let stored = Race::from(store.find_race(race.id).await.unwrap().unwrap());
        assert_eq!(stored.version, 10);
        assert_eq!(stored.participant_count, 10);
        aggregator::verify_ranks(&stored).unwrap();
    }

    #[tokio::test]
    async fn queued_notifications_are_stored_with_the_write() {
        let sender = RecordingSender::shared();
        sender.failures.store(u32::MAX, std::sync::atomic::Ordering::SeqCst);
        let mut config = AppConfig::default();
        config.push.attempts = 1;
        let state = memory_state(config, &sender, None).await;
        let race = insert(&state, Race::new(draft(), state.now()), Outbox::new())
            .await
            .unwrap();

        let committed = read_modify_write(&state, race.id, |race, ctx| {
            ctx.outbox.send(
                race.id,
                "bob",
                Message::new(NotificationKind::RaceStarted, "go", "go"),
            );
            Ok(Step::Write(()))
        })
        .await
        .unwrap();
        assert_eq!(committed.race.pending_notifications.len(), 1);

        let store = state.race_store().await.unwrap();
        let stored = Race::from(store.find_race(race.id).await.unwrap().unwrap());
        let pending = &stored.pending_notifications[0];
        assert_eq!(pending.notification.recipient_id, "bob");
        assert_eq!(pending.queued_at, committed.race.updated_at);
    }

    #[tokio::test]
    async fn missing_race_is_not_found() {
        let sender = RecordingSender::shared();
        let state = memory_state(AppConfig::default(), &sender, None).await;
        let err = read_modify_write(&state, Uuid::new_v4(), |_, _| Ok(Step::Write(())))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn failed_mutation_writes_nothing() {
        let sender = RecordingSender::shared();
        let state = memory_state(AppConfig::default(), &sender, None).await;
        let race = insert(&state, Race::new(draft(), state.now()), Outbox::new())
            .await
            .unwrap();

        let err = read_modify_write(&state, race.id, |race, _| {
            aggregator::leave(race, "ghost")?;
            Ok(Step::Write(()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));

        let store = state.race_store().await.unwrap();
        let stored = store.find_race(race.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 0);
    }
}

//! Process-local store used when no database is configured and in tests.

use std::{sync::Arc, time::SystemTime};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::{
    dao::{
        models::RaceEntity,
        race_store::{DeliveryClaim, RaceStore},
        storage::{StorageError, StorageResult},
    },
    state::state_machine::RaceStatus,
};

/// Race store backed by concurrent hash maps.
///
/// The compare-and-swap runs under the shard lock of the race entry, which
/// gives the same linearizable per-document semantics as a database write.
#[derive(Clone, Default)]
pub struct MemoryRaceStore {
    races: Arc<DashMap<Uuid, RaceEntity>>,
    deliveries: Arc<DashMap<String, DeliveryRecord>>,
}

#[derive(Debug, Clone, Copy)]
struct DeliveryRecord {
    delivered: bool,
    lease_until: SystemTime,
}

impl MemoryRaceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, race: RaceEntity) -> StorageResult<()> {
        match self.races.entry(race.id) {
            Entry::Occupied(_) => Err(StorageError::AlreadyExists { id: race.id }),
            Entry::Vacant(slot) => {
                slot.insert(race);
                Ok(())
            }
        }
    }

    fn replace(&self, race: RaceEntity, expected_version: u64) -> StorageResult<()> {
        let id = race.id;
        let mut current = self.races.get_mut(&id).ok_or(StorageError::Conflict {
            id,
            expected: expected_version,
        })?;

        if current.version != expected_version {
            return Err(StorageError::Conflict {
                id,
                expected: expected_version,
            });
        }

        *current = race;
        Ok(())
    }

    fn list(&self, statuses: &[RaceStatus]) -> Vec<RaceEntity> {
        self.races
            .iter()
            .filter(|entry| statuses.contains(&entry.status))
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn with_pending(&self) -> Vec<RaceEntity> {
        self.races
            .iter()
            .filter(|entry| !entry.pending_notifications.is_empty())
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn claim(&self, key: String, now: SystemTime, lease_until: SystemTime) -> DeliveryClaim {
        match self.deliveries.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(DeliveryRecord {
                    delivered: false,
                    lease_until,
                });
                DeliveryClaim::Acquired
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if record.delivered {
                    DeliveryClaim::Delivered
                } else if record.lease_until > now {
                    DeliveryClaim::Busy
                } else {
                    record.lease_until = lease_until;
                    DeliveryClaim::Acquired
                }
            }
        }
    }
}

impl RaceStore for MemoryRaceStore {
    fn insert_race(&self, race: RaceEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.insert(race) })
    }

    fn find_race(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<RaceEntity>>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.races.get(&id).map(|entry| entry.value().clone())) })
    }

    fn replace_race(
        &self,
        race: RaceEntity,
        expected_version: u64,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.replace(race, expected_version) })
    }

    fn list_races(
        &self,
        statuses: Vec<RaceStatus>,
    ) -> BoxFuture<'static, StorageResult<Vec<RaceEntity>>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.list(&statuses)) })
    }

    fn list_races_with_pending(&self) -> BoxFuture<'static, StorageResult<Vec<RaceEntity>>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.with_pending()) })
    }

    fn claim_delivery(
        &self,
        key: String,
        now: SystemTime,
        lease_until: SystemTime,
    ) -> BoxFuture<'static, StorageResult<DeliveryClaim>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.claim(key, now, lease_until)) })
    }

    fn complete_delivery(&self, key: String) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .deliveries
                .entry(key)
                .and_modify(|record| record.delivered = true)
                .or_insert(DeliveryRecord {
                    delivered: true,
                    lease_until: SystemTime::UNIX_EPOCH,
                });
            Ok(())
        })
    }

    fn release_delivery(&self, key: String) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store.deliveries.remove_if(&key, |_, record| !record.delivered);
            Ok(())
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Map;

    use super::*;
    use crate::state::notification::{Notification, NotificationKind, PendingNotification};

    fn entity(version: u64) -> RaceEntity {
        let now = SystemTime::now();
        RaceEntity {
            id: Uuid::nil(),
            title: "Morning 5k".into(),
            organizer_id: "alice".into(),
            target_progress: 5_000.0,
            max_participants: None,
            status: RaceStatus::Active,
            schedule_time: None,
            countdown_ends_at: None,
            started_at: Some(now),
            deadline: None,
            ended_at: None,
            first_finisher_id: None,
            countdown_notified: false,
            participant_count: 0,
            active_participant_count: 0,
            completed_participant_count: 0,
            top_participant: None,
            cancellation_reason: None,
            participants: Vec::new(),
            pending_notifications: Vec::new(),
            version,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn replace_requires_matching_version() {
        let store = MemoryRaceStore::new();
        store.insert_race(entity(0)).await.unwrap();

        store.replace_race(entity(1), 0).await.unwrap();
        let err = store.replace_race(entity(2), 0).await.unwrap_err();
        assert!(err.is_conflict());

        let stored = store.find_race(Uuid::nil()).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = MemoryRaceStore::new();
        store.insert_race(entity(0)).await.unwrap();
        assert!(matches!(
            store.insert_race(entity(0)).await,
            Err(StorageError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn delivery_claims_are_exclusive_until_released() {
        let store = MemoryRaceStore::new();
        let now = SystemTime::now();
        let lease = now + Duration::from_secs(60);
        let claim = |key: &str| store.claim_delivery(key.into(), now, lease);

        assert_eq!(claim("k").await.unwrap(), DeliveryClaim::Acquired);
        assert_eq!(claim("k").await.unwrap(), DeliveryClaim::Busy);
        store.release_delivery("k".into()).await.unwrap();
        assert_eq!(claim("k").await.unwrap(), DeliveryClaim::Acquired);
        store.complete_delivery("k".into()).await.unwrap();
        assert_eq!(claim("k").await.unwrap(), DeliveryClaim::Delivered);

        // Releasing a delivered key keeps it delivered.
        store.release_delivery("k".into()).await.unwrap();
        assert_eq!(claim("k").await.unwrap(), DeliveryClaim::Delivered);
    }

    #[tokio::test]
    async fn abandoned_claims_expire_with_their_lease() {
        let store = MemoryRaceStore::new();
        let now = SystemTime::now();
        let lease = Duration::from_secs(60);

        let first = store.claim_delivery("k".into(), now, now + lease);
        assert_eq!(first.await.unwrap(), DeliveryClaim::Acquired);
        let later = now + lease + Duration::from_secs(1);
        let takeover = store.claim_delivery("k".into(), later, later + lease);
        assert_eq!(takeover.await.unwrap(), DeliveryClaim::Acquired);
    }

    #[tokio::test]
    async fn races_with_pending_notifications_are_listed() {
        let store = MemoryRaceStore::new();
        store.insert_race(entity(0)).await.unwrap();
        assert!(store.list_races_with_pending().await.unwrap().is_empty());

        let mut race = entity(1);
        race.pending_notifications.push(PendingNotification::new(
            Notification {
                kind: NotificationKind::RaceStarted,
                entity_id: Uuid::nil().to_string(),
                recipient_id: "bob".into(),
                occurrence: String::new(),
                title: "go".into(),
                body: "go".into(),
                data: Map::new(),
            },
            SystemTime::now(),
        ));
        store.replace_race(race, 0).await.unwrap();
        assert_eq!(store.list_races_with_pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let store = MemoryRaceStore::new();
        store.insert_race(entity(0)).await.unwrap();
        assert_eq!(
            store
                .list_races(vec![RaceStatus::Active])
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(
            store
                .list_races(RaceStatus::time_driven().to_vec())
                .await
                .unwrap()
                .is_empty()
        );
    }
}

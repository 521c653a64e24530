#[cfg(feature = "couch-store")]
pub mod couchdb;
pub mod memory;
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use std::time::SystemTime;

use crate::dao::models::RaceEntity;
use crate::dao::storage::StorageResult;
use crate::state::state_machine::RaceStatus;
use futures::future::BoxFuture;
use uuid::Uuid;

/// Answer to a delivery claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClaim {
    /// The caller holds the key until its lease ends and should send.
    Acquired,
    /// The notification was delivered earlier.
    Delivered,
    /// Another dispatcher holds a lease that has not ended yet.
    Busy,
}

/// Abstraction over the persistence layer for races and delivery receipts.
///
/// `replace_race` is the only way to mutate a stored race: it succeeds only
/// when the stored `version` still equals `expected_version`, otherwise it
/// fails with [`StorageError::Conflict`](crate::dao::storage::StorageError::Conflict).
pub trait RaceStore: Send + Sync {
    fn insert_race(&self, race: RaceEntity) -> BoxFuture<'static, StorageResult<()>>;
    fn find_race(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<RaceEntity>>>;
    fn replace_race(
        &self,
        race: RaceEntity,
        expected_version: u64,
    ) -> BoxFuture<'static, StorageResult<()>>;
    fn list_races(&self, statuses: Vec<RaceStatus>)
    -> BoxFuture<'static, StorageResult<Vec<RaceEntity>>>;
    /// Races whose document still holds undelivered notifications.
    fn list_races_with_pending(&self) -> BoxFuture<'static, StorageResult<Vec<RaceEntity>>>;
    /// Lease delivery `key` until `lease_until`. An undelivered claim whose
    /// lease ended before `now` is taken over, since its holder may have died.
    fn claim_delivery(
        &self,
        key: String,
        now: SystemTime,
        lease_until: SystemTime,
    ) -> BoxFuture<'static, StorageResult<DeliveryClaim>>;
    /// Mark `key` as delivered for good.
    fn complete_delivery(&self, key: String) -> BoxFuture<'static, StorageResult<()>>;
    /// Drop an undelivered claim so the next round may try again.
    fn release_delivery(&self, key: String) -> BoxFuture<'static, StorageResult<()>>;
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}

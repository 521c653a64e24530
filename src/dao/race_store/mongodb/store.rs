use std::{sync::Arc, time::SystemTime};

use futures::{TryStreamExt, future::BoxFuture};
use mongodb::{
    Collection, Database,
    bson::{DateTime, Document, doc},
    error::{Error as MongoError, ErrorKind, WriteFailure},
    options::IndexOptions,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    config::MongoConfig,
    connection::open_database,
    error::{MongoDaoError, MongoResult},
    models::{MongoDeliveryDocument, MongoRaceDocument, doc_id, pending_filter, versioned_doc_id},
};
use crate::{
    dao::{
        models::RaceEntity,
        race_store::{DeliveryClaim, RaceStore},
        storage::{StorageError, StorageResult},
    },
    state::state_machine::RaceStatus,
};

const RACE_COLLECTION_NAME: &str = "races";
const DELIVERY_COLLECTION_NAME: &str = "deliveries";
const DUPLICATE_KEY: i32 = 11000;

#[derive(Clone)]
pub struct MongoRaceStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    state: RwLock<MongoState>,
    config: MongoConfig,
}

struct MongoState {
    database: Database,
}

impl MongoInner {
    async fn ping(&self) -> MongoResult<()> {
        let database = {
            let guard = self.state.read().await;
            guard.database.clone()
        };

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }

    async fn reconnect(&self) -> MongoResult<()> {
        let database = open_database(&self.config).await?;
        let mut guard = self.state.write().await;
        guard.database = database;
        Ok(())
    }
}

fn is_duplicate_key(err: &MongoError) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY
    )
}

impl MongoRaceStore {
    /// Establish a connection to MongoDB and ensure indexes are present.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let database = open_database(&config).await?;

        let inner = Arc::new(MongoInner {
            state: RwLock::new(MongoState { database }),
            config,
        });

        let store = Self { inner };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let collection = self.collection().await;
        // The scheduler scans by status on every tick.
        let index = mongodb::IndexModel::builder()
            .keys(doc! {"status": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("race_status_idx".to_owned()))
                    .build(),
            )
            .build();

        collection
            .create_index(index)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: RACE_COLLECTION_NAME,
                index: "status",
                source,
            })?;

        Ok(())
    }

    async fn collection(&self) -> Collection<MongoRaceDocument> {
        let guard = self.inner.state.read().await;
        guard
            .database
            .collection::<MongoRaceDocument>(RACE_COLLECTION_NAME)
    }

    async fn delivery_collection(&self) -> Collection<MongoDeliveryDocument> {
        let guard = self.inner.state.read().await;
        guard
            .database
            .collection::<MongoDeliveryDocument>(DELIVERY_COLLECTION_NAME)
    }

    async fn insert(&self, race: RaceEntity) -> StorageResult<()> {
        let id = race.id;
        let document: MongoRaceDocument = race.into();
        match self.collection().await.insert_one(&document).await {
            Ok(_) => Ok(()),
            Err(err) if is_duplicate_key(&err) => Err(StorageError::AlreadyExists { id }),
            Err(source) => Err(MongoDaoError::SaveRace { id, source }.into()),
        }
    }

    async fn replace(&self, race: RaceEntity, expected_version: u64) -> StorageResult<()> {
        let id = race.id;
        let document: MongoRaceDocument = race.into();
        let result = self
            .collection()
            .await
            .replace_one(versioned_doc_id(id, expected_version), &document)
            .await
            .map_err(|source| MongoDaoError::SaveRace { id, source })?;

        if result.matched_count == 0 {
            return Err(StorageError::Conflict {
                id,
                expected: expected_version,
            });
        }
        Ok(())
    }

    async fn find(&self, id: Uuid) -> MongoResult<Option<RaceEntity>> {
        let document = self
            .collection()
            .await
            .find_one(doc_id(id))
            .await
            .map_err(|source| MongoDaoError::LoadRace { id, source })?;

        Ok(document.map(Into::into))
    }

    async fn list(&self, statuses: Vec<RaceStatus>) -> MongoResult<Vec<RaceEntity>> {
        let labels: Vec<String> = statuses.iter().map(ToString::to_string).collect();
        self.find_races(doc! {"status": {"$in": labels}}).await
    }

    async fn find_races(&self, filter: Document) -> MongoResult<Vec<RaceEntity>> {
        let documents: Vec<MongoRaceDocument> = self
            .collection()
            .await
            .find(filter)
            .await
            .map_err(|source| MongoDaoError::ListRaces { source })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::ListRaces { source })?;

        Ok(documents.into_iter().map(Into::into).collect())
    }

    /// Insert a fresh lease, or take over one that ended before `now`.
    async fn claim(
        &self,
        key: String,
        now: SystemTime,
        lease_until: SystemTime,
    ) -> MongoResult<DeliveryClaim> {
        let deliveries = self.delivery_collection().await;
        let lease_until = DateTime::from_system_time(lease_until);
        let document = MongoDeliveryDocument {
            key: key.clone(),
            delivered: false,
            lease_until,
        };
        match deliveries.insert_one(&document).await {
            Ok(_) => return Ok(DeliveryClaim::Acquired),
            Err(err) if is_duplicate_key(&err) => {}
            Err(source) => return Err(MongoDaoError::Delivery { key, source }),
        }

        let takeover = deliveries
            .update_one(
                doc! {
                    "_id": &key,
                    "delivered": false,
                    "lease_until": {"$lte": DateTime::from_system_time(now)},
                },
                doc! {"$set": {"lease_until": lease_until}},
            )
            .await
            .map_err(|source| MongoDaoError::Delivery {
                key: key.clone(),
                source,
            })?;
        if takeover.modified_count == 1 {
            return Ok(DeliveryClaim::Acquired);
        }

        let current = deliveries
            .find_one(doc! {"_id": &key})
            .await
            .map_err(|source| MongoDaoError::Delivery { key, source })?;
        Ok(match current {
            Some(document) if document.delivered => DeliveryClaim::Delivered,
            _ => DeliveryClaim::Busy,
        })
    }

    async fn complete(&self, key: String) -> MongoResult<()> {
        self.delivery_collection()
            .await
            .update_one(
                doc! {"_id": &key},
                doc! {
                    "$set": {"delivered": true},
                    "$setOnInsert": {"lease_until": DateTime::now()},
                },
            )
            .upsert(true)
            .await
            .map_err(|source| MongoDaoError::Delivery { key, source })?;
        Ok(())
    }

    async fn release(&self, key: String) -> MongoResult<()> {
        self.delivery_collection()
            .await
            .delete_one(doc! {"_id": &key, "delivered": false})
            .await
            .map_err(|source| MongoDaoError::Delivery { key, source })?;
        Ok(())
    }
}

impl RaceStore for MongoRaceStore {
    fn insert_race(&self, race: RaceEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.insert(race).await })
    }

    fn find_race(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<RaceEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find(id).await.map_err(Into::into) })
    }

    fn replace_race(
        &self,
        race: RaceEntity,
        expected_version: u64,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.replace(race, expected_version).await })
    }

    fn list_races(
        &self,
        statuses: Vec<RaceStatus>,
    ) -> BoxFuture<'static, StorageResult<Vec<RaceEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.list(statuses).await.map_err(Into::into) })
    }

    fn list_races_with_pending(&self) -> BoxFuture<'static, StorageResult<Vec<RaceEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_races(pending_filter()).await.map_err(Into::into) })
    }

    fn claim_delivery(
        &self,
        key: String,
        now: SystemTime,
        lease_until: SystemTime,
    ) -> BoxFuture<'static, StorageResult<DeliveryClaim>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .claim(key, now, lease_until)
                .await
                .map_err(Into::into)
        })
    }

    fn complete_delivery(&self, key: String) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.complete(key).await.map_err(Into::into) })
    }

    fn release_delivery(&self, key: String) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.release(key).await.map_err(Into::into) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.ping().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.reconnect().await.map_err(Into::into) })
    }
}

use std::{sync::Arc, time::SystemTime};

use futures::future::BoxFuture;
use reqwest::{Client, Method, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use crate::{
    dao::{
        models::RaceEntity,
        race_store::{DeliveryClaim, RaceStore},
        storage::{StorageError, StorageResult},
    },
    state::state_machine::RaceStatus,
};

use super::{
    config::CouchConfig,
    error::{CouchDaoError, CouchResult},
    models::{
        CouchDeliveryDocument, CouchRaceDocument, FindResponse, decode_rows, delivery_doc_id,
        pending_selector, race_doc_id, status_selector,
    },
};

const FIND_PAGE_SIZE: usize = 200;
/// Attempts at flipping a delivery document to delivered before giving up.
const RECEIPT_ATTEMPTS: u32 = 3;

/// Outcome of a document write, separating revision conflicts from success.
enum PutOutcome {
    Written,
    Conflict,
}

#[derive(Clone)]
pub struct CouchRaceStore {
    client: Client,
    base_url: Arc<str>,
    database: Arc<str>,
    auth: Option<(Arc<str>, Arc<str>)>,
}

impl CouchRaceStore {
    /// Establish a connection to CouchDB and ensure the database exists.
    pub async fn connect(config: CouchConfig) -> CouchResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|source| CouchDaoError::Client { source })?;

        let store = Self {
            client,
            base_url: Arc::from(config.url),
            database: Arc::from(config.database),
            auth: config
                .credentials
                .map(|creds| (Arc::from(creds.username), Arc::from(creds.password))),
        };

        store.ensure_database().await?;
        store.ensure_status_index().await?;
        Ok(store)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}/{}", self.base_url, self.database, path);
        self.authorize(self.client.request(method, url))
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some((ref user, ref pass)) = self.auth {
            builder.basic_auth(user.as_ref(), Some(pass.as_ref()))
        } else {
            builder
        }
    }

    fn database_url(&self) -> String {
        format!("{}/{}", self.base_url, self.database)
    }

    async fn ensure_database(&self) -> CouchResult<()> {
        let database = self.database.to_string();
        let url = self.database_url();

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|source| CouchDaoError::Database {
                database: database.clone(),
                action: "query",
                source,
            })?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => {
                let create = self
                    .authorize(self.client.put(&url))
                    .send()
                    .await
                    .map_err(|source| CouchDaoError::Database {
                        database: database.clone(),
                        action: "create",
                        source,
                    })?;
                // 412 means another instance created it in the meantime.
                if create.status().is_success()
                    || create.status() == StatusCode::PRECONDITION_FAILED
                {
                    Ok(())
                } else {
                    Err(CouchDaoError::DatabaseStatus {
                        database,
                        status: create.status(),
                    })
                }
            }
            other => Err(CouchDaoError::DatabaseStatus {
                database,
                status: other,
            }),
        }
    }

    async fn get_document<T>(&self, doc_id: &str) -> CouchResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        let response = self
            .request(Method::GET, doc_id)
            .send()
            .await
            .map_err(|source| CouchDaoError::Transport {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                response.json::<T>().await.map(Some).map_err(|source| {
                    CouchDaoError::Decode {
                        path: doc_id.to_string(),
                        source,
                    }
                })
            }
            other => Err(CouchDaoError::UnexpectedStatus {
                path: doc_id.to_string(),
                status: other,
            }),
        }
    }

    /// PUT a document. CouchDB answers 409 when `_rev` is stale or, for a
    /// document without `_rev`, when it already exists.
    async fn put_document<T>(&self, doc_id: &str, document: &T) -> CouchResult<PutOutcome>
    where
        T: ?Sized + Serialize,
    {
        let response = self
            .request(Method::PUT, doc_id)
            .json(document)
            .send()
            .await
            .map_err(|source| CouchDaoError::Transport {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::CONFLICT => Ok(PutOutcome::Conflict),
            status if status.is_success() => Ok(PutOutcome::Written),
            status => Err(CouchDaoError::UnexpectedStatus {
                path: doc_id.to_string(),
                status,
            }),
        }
    }

    async fn delete_document(&self, doc_id: &str, rev: &str) -> CouchResult<()> {
        let response = self
            .request(Method::DELETE, doc_id)
            .query(&[("rev", rev)])
            .send()
            .await
            .map_err(|source| CouchDaoError::Transport {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            // Someone else already removed or re-created it; either way the claim is gone.
            StatusCode::NOT_FOUND | StatusCode::CONFLICT => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(CouchDaoError::UnexpectedStatus {
                path: doc_id.to_string(),
                status,
            }),
        }
    }

    /// The scheduler selects races by status on every tick.
    async fn ensure_status_index(&self) -> CouchResult<()> {
        const INDEX: &str = "_index";
        let body = json!({
            "index": {"fields": ["status"]},
            "name": "race-status",
            "type": "json",
        });
        let response = self
            .request(Method::POST, INDEX)
            .json(&body)
            .send()
            .await
            .map_err(|source| CouchDaoError::Transport {
                path: INDEX.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CouchDaoError::UnexpectedStatus {
                path: INDEX.to_string(),
                status: response.status(),
            });
        }
        Ok(())
    }

    /// Run a Mango query to the end, page by page.
    async fn find_documents<T>(&self, selector: Value) -> CouchResult<Vec<T>>
    where
        T: DeserializeOwned,
    {
        const FIND: &str = "_find";
        let mut documents = Vec::new();
        let mut bookmark: Option<String> = None;

        loop {
            let mut body = json!({"selector": selector, "limit": FIND_PAGE_SIZE});
            if let Some(mark) = &bookmark {
                body["bookmark"] = json!(mark);
            }

            let response = self
                .request(Method::POST, FIND)
                .json(&body)
                .send()
                .await
                .map_err(|source| CouchDaoError::Transport {
                    path: FIND.to_string(),
                    source,
                })?;
            if !response.status().is_success() {
                return Err(CouchDaoError::UnexpectedStatus {
                    path: FIND.to_string(),
                    status: response.status(),
                });
            }

            let page = response
                .json::<FindResponse>()
                .await
                .map_err(|source| CouchDaoError::Decode {
                    path: FIND.to_string(),
                    source,
                })?;
            let rows = page.docs.len();
            documents.extend(decode_rows(page.docs));

            match page.bookmark {
                Some(mark) if rows == FIND_PAGE_SIZE && bookmark.as_ref() != Some(&mark) => {
                    bookmark = Some(mark);
                }
                _ => break,
            }
        }

        Ok(documents)
    }

    async fn find_races(&self, selector: Value) -> StorageResult<Vec<RaceEntity>> {
        let docs = self.find_documents::<CouchRaceDocument>(selector).await?;
        Ok(docs.into_iter().map(CouchRaceDocument::into_entity).collect())
    }

    async fn insert(&self, race: RaceEntity) -> StorageResult<()> {
        let id = race.id;
        let doc_id = race_doc_id(id);
        let doc = CouchRaceDocument::from_entity(race, None);
        match self.put_document(&doc_id, &doc).await? {
            PutOutcome::Written => Ok(()),
            PutOutcome::Conflict => Err(StorageError::AlreadyExists { id }),
        }
    }

    /// Compare our own `version` first, then let `_rev` catch writers that
    /// slipped in between the read and the PUT.
    async fn replace(&self, race: RaceEntity, expected_version: u64) -> StorageResult<()> {
        let id = race.id;
        let doc_id = race_doc_id(id);
        let conflict = StorageError::Conflict {
            id,
            expected: expected_version,
        };

        let Some(current) = self.get_document::<CouchRaceDocument>(&doc_id).await? else {
            return Err(conflict);
        };
        if current.race.version != expected_version {
            return Err(conflict);
        }

        let doc = CouchRaceDocument::from_entity(race, current.rev);
        match self.put_document(&doc_id, &doc).await? {
            PutOutcome::Written => Ok(()),
            PutOutcome::Conflict => Err(conflict),
        }
    }

    /// Create the lease document, or take over one whose lease ended.
    /// `_rev` settles races between two claimers.
    async fn claim(
        &self,
        key: &str,
        now: SystemTime,
        lease_until: SystemTime,
    ) -> CouchResult<DeliveryClaim> {
        let doc_id = delivery_doc_id(key);
        let rev = match self.get_document::<CouchDeliveryDocument>(&doc_id).await? {
            Some(current) if current.delivered => return Ok(DeliveryClaim::Delivered),
            Some(current) if current.lease_until > now => return Ok(DeliveryClaim::Busy),
            Some(current) => current.rev,
            None => None,
        };

        let doc = CouchDeliveryDocument {
            id: doc_id.clone(),
            rev,
            delivered: false,
            lease_until,
        };
        Ok(match self.put_document(&doc_id, &doc).await? {
            PutOutcome::Written => DeliveryClaim::Acquired,
            PutOutcome::Conflict => DeliveryClaim::Busy,
        })
    }

    async fn complete(&self, key: &str) -> CouchResult<()> {
        let doc_id = delivery_doc_id(key);
        for attempt in 1..=RECEIPT_ATTEMPTS {
            let current = self.get_document::<CouchDeliveryDocument>(&doc_id).await?;
            if current.as_ref().is_some_and(|doc| doc.delivered) {
                return Ok(());
            }
            let doc = CouchDeliveryDocument {
                id: doc_id.clone(),
                lease_until: current
                    .as_ref()
                    .map_or_else(SystemTime::now, |doc| doc.lease_until),
                rev: current.and_then(|doc| doc.rev),
                delivered: true,
            };
            match self.put_document(&doc_id, &doc).await? {
                PutOutcome::Written => return Ok(()),
                PutOutcome::Conflict => debug!(key, attempt, "delivery receipt raced; retrying"),
            }
        }

        Err(CouchDaoError::UnexpectedStatus {
            path: doc_id,
            status: StatusCode::CONFLICT,
        })
    }

    async fn release(&self, key: &str) -> CouchResult<()> {
        let doc_id = delivery_doc_id(key);
        match self.get_document::<CouchDeliveryDocument>(&doc_id).await? {
            Some(CouchDeliveryDocument {
                delivered: false,
                rev: Some(rev),
                ..
            }) => self.delete_document(&doc_id, &rev).await,
            _ => Ok(()),
        }
    }
}

impl From<CouchDaoError> for StorageError {
    fn from(err: CouchDaoError) -> Self {
        StorageError::unavailable(err.to_string(), err)
    }
}

impl RaceStore for CouchRaceStore {
    fn insert_race(&self, race: RaceEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.insert(race).await })
    }

    fn find_race(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<RaceEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let doc_id = race_doc_id(id);
            let maybe_doc = store.get_document::<CouchRaceDocument>(&doc_id).await?;
            Ok(maybe_doc.map(CouchRaceDocument::into_entity))
        })
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
        Box::pin(async move { store.find_races(status_selector(&statuses)).await })
    }

    fn list_races_with_pending(&self) -> BoxFuture<'static, StorageResult<Vec<RaceEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_races(pending_selector()).await })
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
                .claim(&key, now, lease_until)
                .await
                .map_err(Into::into)
        })
    }

    fn complete_delivery(&self, key: String) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.complete(&key).await.map_err(Into::into) })
    }

    fn release_delivery(&self, key: String) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.release(&key).await.map_err(Into::into) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let url = store.database_url();
            let response = store
                .authorize(store.client.get(&url))
                .send()
                .await
                .map_err(|source| CouchDaoError::Transport {
                    path: url.clone(),
                    source,
                })?;

            if response.status().is_success() {
                Ok(())
            } else {
                Err(CouchDaoError::UnexpectedStatus {
                    path: url,
                    status: response.status(),
                }
                .into())
            }
        })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ensure_database().await.map_err(Into::into) })
    }
}

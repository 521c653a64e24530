use mongodb::bson::{DateTime, Document, doc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dao::models::RaceEntity;

/// Race document; `status` and `version` stay top-level through the flatten
/// so filters can address them directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoRaceDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(flatten)]
    pub race: RaceEntity,
}

impl From<RaceEntity> for MongoRaceDocument {
    fn from(race: RaceEntity) -> Self {
        Self {
            id: race.id.to_string(),
            race,
        }
    }
}

impl From<MongoRaceDocument> for RaceEntity {
    fn from(value: MongoRaceDocument) -> Self {
        value.race
    }
}

/// Delivery lease or receipt keyed by the notification dedup key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoDeliveryDocument {
    #[serde(rename = "_id")]
    pub key: String,
    #[serde(default)]
    pub delivered: bool,
    pub lease_until: DateTime,
}

pub fn doc_id(id: Uuid) -> Document {
    doc! {"_id": id.to_string()}
}

/// Races holding at least one undelivered notification.
pub fn pending_filter() -> Document {
    doc! {"pending_notifications.0": {"$exists": true}}
}

/// Filter matching the race only while it still carries `version`.
pub fn versioned_doc_id(id: Uuid, version: u64) -> Document {
    doc! {"_id": id.to_string(), "version": version as i64}
}

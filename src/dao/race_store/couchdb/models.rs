use std::time::SystemTime;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tracing::warn;
use uuid::Uuid;

use crate::{dao::models::RaceEntity, state::state_machine::RaceStatus};

pub const RACE_PREFIX: &str = "race::";
pub const DELIVERY_PREFIX: &str = "delivery::";
pub const END_SUFFIX: &str = "\u{ffff}";

/// One page of a Mango `_find` query.
#[derive(Debug, Deserialize)]
pub struct FindResponse {
    pub docs: Vec<Value>,
    #[serde(default)]
    pub bookmark: Option<String>,
}

/// Race document as stored in CouchDB; `_rev` is the database's own CAS token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchRaceDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(flatten)]
    pub race: RaceEntity,
}

impl CouchRaceDocument {
    pub fn from_entity(race: RaceEntity, rev: Option<String>) -> Self {
        Self {
            id: race_doc_id(race.id),
            rev,
            race,
        }
    }

    pub fn into_entity(self) -> RaceEntity {
        self.race
    }
}

/// Delivery lease, or receipt once `delivered` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchDeliveryDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default)]
    pub delivered: bool,
    pub lease_until: SystemTime,
}

pub fn race_doc_id(id: Uuid) -> String {
    format!("{RACE_PREFIX}{id}")
}

/// Mango selector for race documents, restricted by `filter`.
fn race_selector(mut filter: serde_json::Map<String, Value>) -> Value {
    filter.insert(
        "_id".into(),
        json!({"$gt": RACE_PREFIX, "$lt": format!("{RACE_PREFIX}{END_SUFFIX}")}),
    );
    Value::Object(filter)
}

/// Races in one of `statuses`.
pub fn status_selector(statuses: &[RaceStatus]) -> Value {
    let labels: Vec<String> = statuses.iter().map(ToString::to_string).collect();
    let mut filter = serde_json::Map::new();
    filter.insert("status".into(), json!({"$in": labels}));
    race_selector(filter)
}

/// Races holding at least one undelivered notification.
pub fn pending_selector() -> Value {
    let mut filter = serde_json::Map::new();
    filter.insert(
        "pending_notifications".into(),
        json!({"$type": "array", "$not": {"$size": 0}}),
    );
    race_selector(filter)
}

/// Decode `_find` rows, logging and skipping the ones that do not parse.
pub fn decode_rows<T>(rows: Vec<Value>) -> Vec<T>
where
    T: DeserializeOwned,
{
    rows.into_iter()
        .filter_map(|row| {
            let doc_id = row
                .get("_id")
                .and_then(Value::as_str)
                .unwrap_or("<unknown>")
                .to_string();
            match serde_json::from_value(row) {
                Ok(document) => Some(document),
                Err(err) => {
                    warn!(doc_id, error = %err, "skipping malformed CouchDB document");
                    None
                }
            }
        })
        .collect()
}

/// Delivery keys contain `:` separators; document ids are URL path segments.
pub fn delivery_doc_id(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("_{byte:02x}"));
        }
    }
    format!("{DELIVERY_PREFIX}{encoded}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_selector_stays_inside_the_race_range() {
        let selector = status_selector(&[RaceStatus::Scheduled, RaceStatus::Ending]);
        assert_eq!(selector["status"]["$in"], json!(["scheduled", "ending"]));
        assert_eq!(selector["_id"]["$gt"], json!(RACE_PREFIX));
        assert!(pending_selector()["pending_notifications"].is_object());
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let race = CouchRaceDocument::from_entity(
            crate::state::race::Race::new(
                crate::state::race::RaceDraft {
                    title: "Canal crawl".into(),
                    organizer_id: "org".into(),
                    organizer_name: "Org".into(),
                    target_progress: 10.0,
                    schedule_time: None,
                    max_participants: None,
                    organizer_joins: false,
                },
                SystemTime::UNIX_EPOCH,
            )
            .into(),
            Some("1-abc".into()),
        );
        let rows = vec![
            json!({"_id": "race::broken", "status": 42}),
            serde_json::to_value(&race).unwrap(),
        ];

        let decoded: Vec<CouchRaceDocument> = decode_rows(rows);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].id, race.id);
    }

    #[test]
    fn delivery_ids_are_path_safe() {
        let id = delivery_doc_id("race_started:3f2a:a.b@x");
        assert_eq!(id, "delivery::race_5fstarted_3a3f2a_3aa_2eb_40x");
        assert_ne!(delivery_doc_id("a.b"), delivery_doc_id("a_b"));
    }
}

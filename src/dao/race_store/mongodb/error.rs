use mongodb::error::Error as MongoError;
use thiserror::Error;
use uuid::Uuid;

pub type MongoResult<T> = std::result::Result<T, MongoDaoError>;

#[derive(Debug, Error)]
pub enum MongoDaoError {
    #[error("MongoDB setting `{var}` is not set")]
    MissingSetting { var: &'static str },
    #[error("MongoDB setting `{var}` has an invalid value `{value}`")]
    InvalidSetting { var: &'static str, value: String },
    #[error("failed to parse MongoDB connection URI `{uri}`")]
    InvalidUri {
        uri: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to build MongoDB client from options")]
    ClientConstruction {
        #[source]
        source: MongoError,
    },
    #[error("MongoDB ping failed during initial connection after {attempts} attempt(s)")]
    InitialPing {
        attempts: u32,
        #[source]
        source: MongoError,
    },
    #[error("MongoDB ping health check failed")]
    HealthPing {
        #[source]
        source: MongoError,
    },
    #[error("failed to ensure index `{index}` on collection `{collection}`")]
    EnsureIndex {
        collection: &'static str,
        index: &'static str,
        #[source]
        source: MongoError,
    },
    #[error("failed to save race `{id}`")]
    SaveRace {
        id: Uuid,
        #[source]
        source: MongoError,
    },
    #[error("failed to load race `{id}`")]
    LoadRace {
        id: Uuid,
        #[source]
        source: MongoError,
    },
    #[error("failed to list races")]
    ListRaces {
        #[source]
        source: MongoError,
    },
    #[error("failed to record delivery `{key}`")]
    Delivery {
        key: String,
        #[source]
        source: MongoError,
    },
}

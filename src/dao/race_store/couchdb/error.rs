//! Failures of the CouchDB race store.

use reqwest::StatusCode;
use thiserror::Error;

pub type CouchResult<T> = Result<T, CouchDaoError>;

#[derive(Debug, Error)]
pub enum CouchDaoError {
    #[error("CouchDB setting `{var}` is not set")]
    MissingSetting { var: &'static str },
    #[error("CouchDB setting `{var}` has an invalid value `{value}`")]
    InvalidSetting { var: &'static str, value: String },
    #[error("failed to build CouchDB HTTP client")]
    Client {
        #[source]
        source: reqwest::Error,
    },
    /// Checking for or creating the race database failed in transit.
    #[error("failed to {action} CouchDB database `{database}`")]
    Database {
        database: String,
        action: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("CouchDB answered {status} for database `{database}`")]
    DatabaseStatus {
        database: String,
        status: StatusCode,
    },
    #[error("CouchDB request to `{path}` failed")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("CouchDB answered {status} for `{path}`")]
    UnexpectedStatus { path: String, status: StatusCode },
    #[error("unreadable CouchDB response for `{path}`")]
    Decode {
        path: String,
        #[source]
        source: reqwest::Error,
    },
}

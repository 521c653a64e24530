use std::time::Duration;

use super::error::{CouchDaoError, CouchResult};

const DEFAULT_DATABASE: &str = "races";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Basic-auth pair sent with every CouchDB request.
#[derive(Debug, Clone)]
pub struct CouchCredentials {
    pub username: String,
    pub password: String,
}

/// Where the race documents live and how to reach them.
#[derive(Debug, Clone)]
pub struct CouchConfig {
    pub url: String,
    pub database: String,
    pub credentials: Option<CouchCredentials>,
    pub request_timeout: Duration,
}

impl CouchConfig {
    /// Read `COUCH_URL` (or `COUCH_BASE_URL`), `COUCH_DB`, `COUCH_USERNAME`,
    /// `COUCH_PASSWORD` and `COUCH_TIMEOUT_SECS`.
    pub fn from_env() -> CouchResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> CouchResult<Self> {
        let setting = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let url = setting("COUCH_URL")
            .or_else(|| setting("COUCH_BASE_URL"))
            .ok_or(CouchDaoError::MissingSetting { var: "COUCH_URL" })?;
        let database = setting("COUCH_DB").unwrap_or_else(|| DEFAULT_DATABASE.to_string());
        let credentials = setting("COUCH_USERNAME")
            .zip(setting("COUCH_PASSWORD"))
            .map(|(username, password)| CouchCredentials { username, password });
        let request_timeout = match setting("COUCH_TIMEOUT_SECS") {
            Some(raw) => raw
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| CouchDaoError::InvalidSetting {
                    var: "COUCH_TIMEOUT_SECS",
                    value: raw,
                })?,
            None => DEFAULT_TIMEOUT,
        };

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            database,
            credentials,
            request_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_only_the_url_is_set() {
        let config =
            CouchConfig::from_lookup(lookup(&[("COUCH_BASE_URL", "http://couch:5984/")])).unwrap();
        assert_eq!(config.url, "http://couch:5984");
        assert_eq!(config.database, "races");
        assert!(config.credentials.is_none());
        assert_eq!(config.request_timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn credentials_need_both_halves() {
        let config = CouchConfig::from_lookup(lookup(&[
            ("COUCH_URL", "http://couch:5984"),
            ("COUCH_USERNAME", "admin"),
        ]))
        .unwrap();
        assert!(config.credentials.is_none());
    }

    #[test]
    fn missing_url_and_bad_timeout_are_errors() {
        assert!(matches!(
            CouchConfig::from_lookup(lookup(&[])),
            Err(CouchDaoError::MissingSetting { .. })
        ));
        assert!(matches!(
            CouchConfig::from_lookup(lookup(&[
                ("COUCH_URL", "http://couch:5984"),
                ("COUCH_TIMEOUT_SECS", "soon"),
            ])),
            Err(CouchDaoError::InvalidSetting { .. })
        ));
    }
}

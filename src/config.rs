//! Application-level configuration loading: race timings, retry policy and scheduler cadence.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationMilliSeconds, DurationSeconds, serde_as};
use tracing::{info, warn};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "RACE_LIFECYCLE_CONFIG_PATH";

/// Default pause between two scheduler ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);
/// Default length of the pre-start countdown window.
pub const DEFAULT_COUNTDOWN_DURATION: Duration = Duration::from_secs(10);
/// Default time left to the other participants once the first one finished.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30 * 60);
/// Default remaining time at which the "minutes left" warning is sent.
pub const DEFAULT_COUNTDOWN_WARNING_LEAD: Duration = Duration::from_secs(5 * 60);
/// Default age after which an undelivered notification is sent again.
pub const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_secs(60);
/// Default progress thresholds (percent of the target) announced to participants.
pub const DEFAULT_MILESTONES: [u8; 3] = [25, 50, 75];

#[derive(Debug, Clone, Default)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// Race timing rules.
    pub race: RaceSettings,
    /// Retry policy for transactional read-modify-write cycles.
    pub transactions: TransactionSettings,
    /// Periodic scheduler settings.
    pub scheduler: SchedulerSettings,
    /// Push delivery settings.
    pub push: PushSettings,
}

/// Timing rules applied by the race state machine.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RaceSettings {
    /// Length of the COUNTDOWN window; zero goes straight to ACTIVE.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub countdown_duration: Duration,
    /// Window granted after the first finisher before the race auto-completes.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub grace_period: Duration,
    /// Remaining time at which the one-shot deadline warning fires.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub countdown_warning_lead: Duration,
    /// Percent thresholds notified once per participant.
    pub milestones: Vec<u8>,
}

impl Default for RaceSettings {
    fn default() -> Self {
        Self {
            countdown_duration: DEFAULT_COUNTDOWN_DURATION,
            grace_period: DEFAULT_GRACE_PERIOD,
            countdown_warning_lead: DEFAULT_COUNTDOWN_WARNING_LEAD,
            milestones: DEFAULT_MILESTONES.to_vec(),
        }
    }
}

/// Bounded retry policy used when a conditional write loses a race.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransactionSettings {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled on each attempt.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_backoff: Duration,
    /// Upper bound for the backoff delay.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_backoff: Duration,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
        }
    }
}

/// Scheduler cadence.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Run the internal tick loop; disable when an external cron calls `/scheduler/tick`.
    pub enabled: bool,
    /// Pause between ticks.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub tick_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

/// Push delivery retry settings.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushSettings {
    /// Send attempts per recipient within one dispatch round.
    pub attempts: u32,
    /// Pause between two attempts.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_delay: Duration,
    /// Age at which a pending notification is re-sent by the scheduler; also
    /// the lease a dispatcher holds on a delivery key.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub redelivery_delay: Duration,
    /// Failed rounds after which a pending notification is dropped.
    pub max_delivery_rounds: u32,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay: Duration::from_millis(200),
            redelivery_delay: DEFAULT_REDELIVERY_DELAY,
            max_delivery_rounds: 10,
        }
    }
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match Self::from_json(&contents) {
                Ok(app_config) => {
                    info!(
                        path = %path.display(),
                        grace_period_secs = app_config.race.grace_period.as_secs(),
                        tick_interval_secs = app_config.scheduler.tick_interval.as_secs(),
                        "loaded race configuration"
                    );
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Parse a JSON document; absent sections keep their defaults.
    pub fn from_json(contents: &str) -> serde_json::Result<Self> {
        let raw = serde_json::from_str::<RawConfig>(contents)?;
        Ok(raw.into())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    race: RaceSettings,
    transactions: TransactionSettings,
    scheduler: SchedulerSettings,
    push: PushSettings,
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        let mut race = value.race;
        race.milestones.retain(|percent| (1..100).contains(percent));
        race.milestones.sort_unstable();
        race.milestones.dedup();

        let mut transactions = value.transactions;
        transactions.max_attempts = transactions.max_attempts.max(1);

        let mut push = value.push;
        push.attempts = push.attempts.max(1);
        push.max_delivery_rounds = push.max_delivery_rounds.max(1);

        Self {
            race,
            transactions,
            scheduler: value.scheduler,
            push,
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_keeps_defaults() {
        let config = AppConfig::from_json("{}").unwrap();
        assert_eq!(config.race.grace_period, DEFAULT_GRACE_PERIOD);
        assert_eq!(config.race.milestones, DEFAULT_MILESTONES.to_vec());
        assert_eq!(config.scheduler.tick_interval, DEFAULT_TICK_INTERVAL);
        assert_eq!(config.transactions.max_attempts, 5);
        assert_eq!(config.push.redelivery_delay, DEFAULT_REDELIVERY_DELAY);
    }

    #[test]
    fn partial_sections_override_only_given_fields() {
        let config = AppConfig::from_json(
            r#"{
                "race": { "grace_period": 600, "milestones": [90, 50, 50, 0, 120] },
                "transactions": { "max_attempts": 0, "base_backoff": 5 },
                "push": { "redelivery_delay": 120, "max_delivery_rounds": 0 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.race.grace_period, Duration::from_secs(600));
        assert_eq!(config.race.countdown_duration, DEFAULT_COUNTDOWN_DURATION);
        assert_eq!(config.race.milestones, vec![50, 90]);
        assert_eq!(config.transactions.max_attempts, 1);
        assert_eq!(config.transactions.base_backoff, Duration::from_millis(5));
        assert_eq!(config.push.redelivery_delay, Duration::from_secs(120));
        assert_eq!(config.push.max_delivery_rounds, 1);
        assert_eq!(config.push.attempts, 3);
    }

    #[test]
    fn malformed_durations_are_rejected() {
        assert!(AppConfig::from_json(r#"{ "race": { "grace_period": "soon" } }"#).is_err());
    }
}

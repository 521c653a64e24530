//! Periodic evaluation of every race whose next transition depends on the clock,
//! followed by redelivery of notifications still pending on race documents.

use std::time::Duration;

use serde::Serialize;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    error::ServiceError,
    services::{
        dispatcher,
        lifecycle::{self, Advance},
    },
    state::{
        SharedState,
        state_machine::RaceStatus,
        transitions::{self, Step},
    },
};

const MIN_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of one scheduler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct TickReport {
    /// Races listed in a time-driven state.
    pub scanned: u32,
    /// Races that changed state or had their deadline warning sent.
    pub advanced: u32,
    /// Races with nothing due, including ones another writer already advanced.
    pub unchanged: u32,
    /// Races whose evaluation failed; the others were still processed.
    pub failed: u32,
    /// Pending notifications delivered by this pass.
    pub redelivered: u32,
}

/// Evaluate every race in SCHEDULED, COUNTDOWN or ENDING once, then re-send
/// overdue pending notifications.
pub async fn tick(state: &SharedState) -> Result<TickReport, ServiceError> {
    let store = state.require_race_store().await?;
    let races = store.list_races(RaceStatus::time_driven().to_vec()).await?;

    let mut report = TickReport {
        scanned: races.len() as u32,
        ..TickReport::default()
    };
    for race in races {
        match evaluate(state, race.id).await {
            Ok(advance) if advance.changed() => {
                debug!(
                    race_id = %race.id,
                    entered = ?advance.entered,
                    warned = advance.warned,
                    "race advanced"
                );
                report.advanced += 1;
            }
            Ok(_) => report.unchanged += 1,
            Err(err) => {
                warn!(race_id = %race.id, error = %err, "failed to evaluate race");
                report.failed += 1;
            }
        }
    }

    match dispatcher::redeliver(state).await {
        Ok(redelivery) => report.redelivered = redelivery.sent,
        Err(err) => warn!(error = %err, "failed to redeliver pending notifications"),
    }

    Ok(report)
}

/// Apply whatever is due on one race in its own transaction.
pub async fn evaluate(state: &SharedState, race_id: Uuid) -> Result<Advance, ServiceError> {
    let committed = transitions::read_modify_write(state, race_id, |race, ctx| {
        let advance = lifecycle::advance_due(race, ctx)?;
        Ok(if advance.changed() {
            Step::Write(advance)
        } else {
            Step::Skip(advance)
        })
    })
    .await?;
    Ok(committed.value)
}

/// Tick forever at the configured cadence.
pub async fn run(state: SharedState) {
    let period = state.config().scheduler.tick_interval.max(MIN_TICK_INTERVAL);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_secs = period.as_secs(), "race scheduler started");

    loop {
        ticker.tick().await;
        match tick(&state).await {
            Ok(report) if report.advanced > 0 || report.failed > 0 || report.redelivered > 0 => {
                info!(
                    scanned = report.scanned,
                    advanced = report.advanced,
                    unchanged = report.unchanged,
                    failed = report.failed,
                    redelivered = report.redelivered,
                    "scheduler tick"
                )
            }
            Ok(report) => debug!(scanned = report.scanned, "scheduler tick; nothing due"),
            Err(ServiceError::Degraded) => debug!("skipping scheduler tick in degraded mode"),
            Err(err) => warn!(error = %err, "scheduler tick failed"),
        }
    }
}

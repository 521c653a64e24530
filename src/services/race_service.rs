use tracing::info;
use uuid::Uuid;

use crate::{
    dto::{
        identity::Actor,
        race::{CancelRequest, CreateRaceRequest, ProgressResponse, RaceSnapshot},
        validation::parse_rfc3339,
    },
    error::ServiceError,
    services::{aggregator, lifecycle},
    state::{
        SharedState,
        notification::{Message, NotificationKind, Outbox},
        race::{Race, RaceDraft},
        state_machine::RaceEvent,
        transitions::{self, Committed, Step, TxContext},
    },
};

/// Open a new race owned by `actor`.
pub async fn create_race(
    state: &SharedState,
    actor: &Actor,
    request: CreateRaceRequest,
) -> Result<RaceSnapshot, ServiceError> {
    if !request.target_progress.is_finite() || request.target_progress <= 0.0 {
        return Err(ServiceError::InvalidInput(
            "target_progress must be above zero".into(),
        ));
    }
    let schedule_time = request
        .schedule_time
        .as_deref()
        .map(parse_rfc3339)
        .transpose()
        .map_err(|err| ServiceError::InvalidInput(format!("invalid schedule_time: {err}")))?;

    let race = Race::new(
        RaceDraft {
            title: request.title.trim().to_string(),
            organizer_id: actor.user_id.clone(),
            organizer_name: actor.display_name.clone(),
            target_progress: request.target_progress,
            schedule_time,
            max_participants: request.max_participants,
            organizer_joins: request.join,
        },
        state.now(),
    );

    let mut outbox = Outbox::new();
    outbox.send(
        race.id,
        race.organizer_id.clone(),
        Message::new(
            NotificationKind::RaceCreated,
            "Race Created Successfully! 🎉",
            format!("Your race \"{}\" is ready.", race.title),
        )
        .with("race_id", race.id.to_string()),
    );

    let race = transitions::insert(state, race, outbox).await?;
    info!(race_id = %race.id, organizer = %actor.user_id, status = %race.status, "race created");
    Ok(RaceSnapshot::from(&race))
}

/// Read the current snapshot of a race.
pub async fn get_race(state: &SharedState, race_id: Uuid) -> Result<RaceSnapshot, ServiceError> {
    let store = state.require_race_store().await?;
    let race = store
        .find_race(race_id)
        .await?
        .map(Race::from)
        .ok_or_else(|| ServiceError::NotFound(format!("race `{race_id}`")))?;
    Ok(RaceSnapshot::from(&race))
}

/// Register `actor` in the race.
pub async fn join_race(
    state: &SharedState,
    race_id: Uuid,
    actor: &Actor,
) -> Result<RaceSnapshot, ServiceError> {
    let committed = with_due_transitions(state, race_id, |race, ctx| {
        aggregator::join(race, &actor.user_id, &actor.display_name, ctx.now)?;
        lifecycle::announce_join(race, &actor.user_id, ctx);
        Ok(Step::Write(()))
    })
    .await?;

    info!(%race_id, user = %actor.user_id, "participant joined");
    Ok(RaceSnapshot::from(&committed.race))
}

/// Soft-delete `actor` from the race.
pub async fn leave_race(
    state: &SharedState,
    race_id: Uuid,
    actor: &Actor,
) -> Result<RaceSnapshot, ServiceError> {
    let committed = with_due_transitions(state, race_id, |race, ctx| {
        let (before, leader_before) = standings_of(race);
        aggregator::leave(race, &actor.user_id)?;
        aggregator::recompute(race)?;
        lifecycle::settle(race, ctx)?;
        lifecycle::announce_standings(
            race,
            &actor.user_id,
            &before,
            leader_before.as_deref(),
            None,
            ctx,
        );
        Ok(Step::Write(()))
    })
    .await?;

    info!(%race_id, user = %actor.user_id, "participant left");
    Ok(RaceSnapshot::from(&committed.race))
}

/// Record a progress report from `actor`.
pub async fn report_progress(
    state: &SharedState,
    race_id: Uuid,
    actor: &Actor,
    progress: f64,
) -> Result<ProgressResponse, ServiceError> {
    let committed = with_due_transitions(state, race_id, |race, ctx| {
        let (before, leader_before) = standings_of(race);
        let status_before = race.participants.get(&actor.user_id).map(|p| p.status);

        let report = aggregator::record_progress(
            race,
            &actor.user_id,
            progress,
            ctx.now,
            &ctx.config.race.milestones,
        )?;
        let status_after = race.participants.get(&actor.user_id).map(|p| p.status);
        if !report.accepted && status_before == status_after {
            return Ok(Step::Skip(report));
        }

        if report.completed {
            lifecycle::on_participant_completed(race, &actor.user_id, ctx)?;
        }
        aggregator::recompute(race)?;
        lifecycle::announce_standings(
            race,
            &actor.user_id,
            &before,
            leader_before.as_deref(),
            report.milestone,
            ctx,
        );
        Ok(Step::Write(report))
    })
    .await?;

    let report = committed.value;
    Ok(ProgressResponse {
        accepted: report.accepted,
        completed: report.completed,
        milestone: report.milestone,
        race: RaceSnapshot::from(&committed.race),
    })
}

/// Mark `actor` as finished regardless of the reported progress.
pub async fn complete_race(
    state: &SharedState,
    race_id: Uuid,
    actor: &Actor,
) -> Result<RaceSnapshot, ServiceError> {
    let committed = with_due_transitions(state, race_id, |race, ctx| {
        let (before, leader_before) = standings_of(race);
        aggregator::complete(race, &actor.user_id, ctx.now)?;
        lifecycle::on_participant_completed(race, &actor.user_id, ctx)?;
        aggregator::recompute(race)?;
        lifecycle::announce_standings(
            race,
            &actor.user_id,
            &before,
            leader_before.as_deref(),
            None,
            ctx,
        );
        Ok(Step::Write(()))
    })
    .await?;

    info!(%race_id, user = %actor.user_id, "participant finished");
    Ok(RaceSnapshot::from(&committed.race))
}

/// Start a scheduled race ahead of its schedule time.
pub async fn start_race(
    state: &SharedState,
    race_id: Uuid,
    actor: &Actor,
) -> Result<RaceSnapshot, ServiceError> {
    let committed = with_due_transitions(state, race_id, |race, ctx| {
        require_organizer(race, actor, "start")?;
        lifecycle::apply_event(race, RaceEvent::StartRequested, ctx)?;
        Ok(Step::Write(()))
    })
    .await?;

    info!(%race_id, status = %committed.race.status, "race started by organizer");
    Ok(RaceSnapshot::from(&committed.race))
}

/// Cancel a race that has not ended yet.
pub async fn cancel_race(
    state: &SharedState,
    race_id: Uuid,
    actor: &Actor,
    request: CancelRequest,
) -> Result<RaceSnapshot, ServiceError> {
    let reason = request
        .reason
        .map(|reason| reason.trim().to_string())
        .filter(|reason| !reason.is_empty());

    let committed = with_due_transitions(state, race_id, |race, ctx| {
        require_organizer(race, actor, "cancel")?;
        lifecycle::apply_event(
            race,
            RaceEvent::Cancel {
                reason: reason.clone(),
            },
            ctx,
        )?;
        Ok(Step::Write(()))
    })
    .await?;

    info!(%race_id, "race cancelled");
    Ok(RaceSnapshot::from(&committed.race))
}

/// Run a user action in the transaction that also applies whatever the clock
/// made due, so an action never sees a race a tick would already have moved.
///
/// When the due transitions changed the race they are committed even if the
/// action fails; the action's error is returned after that write.
async fn with_due_transitions<T, F>(
    state: &SharedState,
    race_id: Uuid,
    mut action: F,
) -> Result<Committed<T>, ServiceError>
where
    F: FnMut(&mut Race, &mut TxContext<'_>) -> Result<Step<T>, ServiceError>,
{
    let committed = transitions::read_modify_write(state, race_id, |race, ctx| {
        let advance = lifecycle::advance_due(race, ctx)?;
        if !advance.changed() {
            return Ok(match action(race, ctx)? {
                Step::Write(value) => Step::Write(Ok(value)),
                Step::Skip(value) => Step::Skip(Ok(value)),
            });
        }

        let (checkpoint, queued) = (race.clone(), ctx.outbox.len());
        match action(race, ctx) {
            Ok(Step::Write(value) | Step::Skip(value)) => Ok(Step::Write(Ok(value))),
            Err(err) => {
                *race = checkpoint;
                ctx.outbox.truncate(queued);
                Ok(Step::Write(Err(err)))
            }
        }
    })
    .await?;

    Ok(Committed {
        value: committed.value?,
        race: committed.race,
        written: committed.written,
    })
}

fn require_organizer(race: &Race, actor: &Actor, action: &str) -> Result<(), ServiceError> {
    if race.organizer_id != actor.user_id {
        return Err(ServiceError::Forbidden(format!(
            "only the organizer may {action} this race"
        )));
    }
    Ok(())
}

fn standings_of(race: &Race) -> (Vec<String>, Option<String>) {
    (
        aggregator::standings(race),
        race.top_participant.as_ref().map(|top| top.user_id.clone()),
    )
}

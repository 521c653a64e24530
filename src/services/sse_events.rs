use serde::Serialize;
use tracing::warn;

use crate::{
    dto::sse::{RaceStatusChangedEvent, ServerEvent},
    state::{SharedState, race::Race, state_machine::RaceStatus},
};

const EVENT_RACE_CREATED: &str = "race.created";
const EVENT_RACE_STATUS: &str = "race.status";

/// Broadcast a freshly created race on the public stream.
pub fn broadcast_race_created(state: &SharedState, race: &Race) {
    send_race_event(state, EVENT_RACE_CREATED, &status_payload(race, race.status));
}

/// Broadcast that a committed write moved `race` out of `previous`.
pub fn broadcast_race_status_changed(state: &SharedState, previous: RaceStatus, race: &Race) {
    if previous == race.status {
        return;
    }
    send_race_event(state, EVENT_RACE_STATUS, &status_payload(race, previous));
}

fn status_payload(race: &Race, previous: RaceStatus) -> RaceStatusChangedEvent {
    RaceStatusChangedEvent {
        race_id: race.id,
        title: race.title.clone(),
        previous,
        status: race.status,
        version: race.version,
        participant_count: race.participant_count,
    }
}

fn send_race_event(state: &SharedState, event: &str, payload: &impl Serialize) {
    match ServerEvent::json(Some(event.to_string()), payload) {
        Ok(event) => state.race_sse().broadcast(event),
        Err(err) => warn!(event, error = %err, "failed to serialize race SSE payload"),
    }
}

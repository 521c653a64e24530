use std::{fmt, time::SystemTime};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Lifecycle phases a race goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RaceStatus {
    /// Waiting for its schedule time.
    Scheduled,
    /// Short pre-start window before the race goes live.
    Countdown,
    /// Participants are racing.
    Active,
    /// Someone crossed the finish line; the deadline is running.
    Ending,
    /// Results are frozen.
    Completed,
    /// Stopped by the organizer.
    Cancelled,
}

impl RaceStatus {
    /// Terminal states accept no further mutation.
    pub fn is_terminal(self) -> bool {
        matches!(self, RaceStatus::Completed | RaceStatus::Cancelled)
    }

    /// Whether new participants may join.
    pub fn accepts_joins(self) -> bool {
        matches!(
            self,
            RaceStatus::Scheduled | RaceStatus::Countdown | RaceStatus::Active
        )
    }

    /// Whether progress reports are recorded.
    pub fn accepts_progress(self) -> bool {
        matches!(self, RaceStatus::Active | RaceStatus::Ending)
    }

    /// States whose next transition depends on the wall clock.
    pub fn time_driven() -> [RaceStatus; 3] {
        [
            RaceStatus::Scheduled,
            RaceStatus::Countdown,
            RaceStatus::Ending,
        ]
    }
}

impl fmt::Display for RaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RaceStatus::Scheduled => "scheduled",
            RaceStatus::Countdown => "countdown",
            RaceStatus::Active => "active",
            RaceStatus::Ending => "ending",
            RaceStatus::Completed => "completed",
            RaceStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Events that can move a race between states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaceEvent {
    /// The scheduler observed `now >= schedule_time`.
    ScheduleReached,
    /// The organizer started a scheduled race early.
    StartRequested,
    /// The countdown window is over.
    CountdownElapsed,
    /// A participant reached the target for the first time.
    FirstFinisher {
        /// User that crossed the line.
        user_id: String,
    },
    /// The scheduler observed `now >= deadline`.
    DeadlinePassed,
    /// Every non-left participant has completed.
    AllFinished,
    /// Explicit cancellation.
    Cancel {
        /// Optional reason shown to participants.
        reason: Option<String>,
    },
}

/// Error returned when an event cannot be applied from the current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while {from}")]
pub struct InvalidTransition {
    /// The state the race was in when the event was received.
    pub from: RaceStatus,
    /// The rejected event.
    pub event: RaceEvent,
}

/// Compute the state reached by applying `event` from `from`.
pub fn compute_transition(
    from: RaceStatus,
    event: &RaceEvent,
) -> Result<RaceStatus, InvalidTransition> {
    let next = match (from, event) {
        (RaceStatus::Scheduled, RaceEvent::ScheduleReached)
        | (RaceStatus::Scheduled, RaceEvent::StartRequested) => RaceStatus::Countdown,
        (RaceStatus::Countdown, RaceEvent::CountdownElapsed) => RaceStatus::Active,
        (RaceStatus::Active, RaceEvent::FirstFinisher { .. }) => RaceStatus::Ending,
        (RaceStatus::Ending, RaceEvent::DeadlinePassed)
        | (RaceStatus::Ending, RaceEvent::AllFinished) => RaceStatus::Completed,
        (from, RaceEvent::Cancel { .. }) if !from.is_terminal() => RaceStatus::Cancelled,
        (from, event) => {
            return Err(InvalidTransition {
                from,
                event: event.clone(),
            });
        }
    };

    Ok(next)
}

/// Wall-clock data the scheduler needs to decide a race's next transition.
#[derive(Debug, Clone, Copy)]
pub struct Timeline {
    /// Current state.
    pub status: RaceStatus,
    /// Planned start, if any.
    pub schedule_time: Option<SystemTime>,
    /// End of the countdown window, if entered.
    pub countdown_ends_at: Option<SystemTime>,
    /// Deadline of the ending window, if entered.
    pub deadline: Option<SystemTime>,
}

/// Return the time-driven event that is due at `now`, if any.
///
/// The check is level-triggered so a missed tick is caught up by the next one.
pub fn due_event(timeline: Timeline, now: SystemTime) -> Option<RaceEvent> {
    let reached = |at: Option<SystemTime>| at.is_some_and(|at| now >= at);

    match timeline.status {
        RaceStatus::Scheduled if reached(timeline.schedule_time) => {
            Some(RaceEvent::ScheduleReached)
        }
        RaceStatus::Countdown if reached(timeline.countdown_ends_at) => {
            Some(RaceEvent::CountdownElapsed)
        }
        RaceStatus::Ending if reached(timeline.deadline) => Some(RaceEvent::DeadlinePassed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn all_statuses() -> [RaceStatus; 6] {
        [
            RaceStatus::Scheduled,
            RaceStatus::Countdown,
            RaceStatus::Active,
            RaceStatus::Ending,
            RaceStatus::Completed,
            RaceStatus::Cancelled,
        ]
    }

    #[test]
    fn happy_path_reaches_completed() {
        let mut status = RaceStatus::Scheduled;
        for event in [
            RaceEvent::ScheduleReached,
            RaceEvent::CountdownElapsed,
            RaceEvent::FirstFinisher {
                user_id: "alice".into(),
            },
            RaceEvent::DeadlinePassed,
        ] {
            status = compute_transition(status, &event).unwrap();
        }
        assert_eq!(status, RaceStatus::Completed);
    }

    #[test]
    fn terminal_states_reject_every_event() {
        let events = [
            RaceEvent::ScheduleReached,
            RaceEvent::StartRequested,
            RaceEvent::CountdownElapsed,
            RaceEvent::FirstFinisher {
                user_id: "bob".into(),
            },
            RaceEvent::DeadlinePassed,
            RaceEvent::AllFinished,
            RaceEvent::Cancel { reason: None },
        ];

        for from in [RaceStatus::Completed, RaceStatus::Cancelled] {
            for event in &events {
                let err = compute_transition(from, event).unwrap_err();
                assert_eq!(err.from, from);
            }
        }
    }

    #[test]
    fn cancel_is_accepted_from_every_live_state() {
        for from in all_statuses().into_iter().filter(|s| !s.is_terminal()) {
            assert_eq!(
                compute_transition(from, &RaceEvent::Cancel { reason: None }),
                Ok(RaceStatus::Cancelled)
            );
        }
    }

    #[test]
    fn first_finisher_only_applies_while_active() {
        let event = RaceEvent::FirstFinisher {
            user_id: "carol".into(),
        };
        assert!(compute_transition(RaceStatus::Ending, &event).is_err());
        assert!(compute_transition(RaceStatus::Countdown, &event).is_err());
    }

    #[test]
    fn due_event_follows_the_clock() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let past = now - Duration::from_secs(1);
        let future = now + Duration::from_secs(1);

        let scheduled = Timeline {
            status: RaceStatus::Scheduled,
            schedule_time: Some(past),
            countdown_ends_at: None,
            deadline: None,
        };
        assert_eq!(due_event(scheduled, now), Some(RaceEvent::ScheduleReached));

        let waiting = Timeline {
            schedule_time: Some(future),
            ..scheduled
        };
        assert_eq!(due_event(waiting, now), None);

        let ending = Timeline {
            status: RaceStatus::Ending,
            schedule_time: None,
            countdown_ends_at: None,
            deadline: Some(now),
        };
        assert_eq!(due_event(ending, now), Some(RaceEvent::DeadlinePassed));

        let active = Timeline {
            status: RaceStatus::Active,
            deadline: Some(past),
            ..ending
        };
        assert_eq!(due_event(active, now), None);
    }
}

//! Side effects of race state transitions and the notifications they produce.
//!
//! [`compute_transition`] decides whether an event is legal; this module
//! stamps the timestamps, flips participant statuses and fills the outbox.

use std::time::Duration;

use crate::{
    error::ServiceError,
    services::aggregator,
    state::{
        notification::{Message, NotificationKind},
        race::{ParticipantStatus, Race},
        state_machine::{RaceEvent, RaceStatus, compute_transition, due_event},
        transitions::TxContext,
    },
};

/// What a scheduler evaluation changed on one race.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advance {
    /// States entered, in order.
    pub entered: Vec<RaceStatus>,
    /// The deadline warning was enqueued.
    pub warned: bool,
}

impl Advance {
    /// Whether anything was written to the race.
    pub fn changed(&self) -> bool {
        !self.entered.is_empty() || self.warned
    }
}

/// Apply `event` to `race`, including every follow-up transition that is
/// immediately due (zero countdown, everybody already finished).
pub fn apply_event(
    race: &mut Race,
    event: RaceEvent,
    ctx: &mut TxContext<'_>,
) -> Result<(), ServiceError> {
    let next = compute_transition(race.status, &event)?;
    race.status = next;
    let now = ctx.now;
    // A scheduled start counts the window from the planned instant so a late tick catches up.
    let countdown_from = match (&event, race.schedule_time) {
        (RaceEvent::ScheduleReached, Some(at)) => at,
        _ => now,
    };

    match (next, event) {
        (RaceStatus::Countdown, _) => {
            let countdown = ctx.config.race.countdown_duration;
            race.countdown_ends_at = Some(countdown_from + countdown);
            if countdown.is_zero() {
                apply_event(race, RaceEvent::CountdownElapsed, ctx)?;
            }
        }
        (RaceStatus::Active, _) => {
            race.started_at = Some(now);
            aggregator::activate_joined(race);
            let message = Message::new(
                NotificationKind::RaceStarted,
                "Race Started! 🚀",
                format!("\"{}\" has started. Good luck!", race.title),
            )
            .with("race_id", race.id.to_string());
            ctx.outbox.fan_out(race.id, race.counted_ids(), None, &message);
        }
        (RaceStatus::Ending, RaceEvent::FirstFinisher { user_id }) => {
            if race.first_finisher_id.is_none() {
                race.first_finisher_id = Some(user_id.clone());
            }
            let grace = ctx.config.race.grace_period;
            race.deadline = Some(now + grace);
            announce_first_finisher(race, &user_id, grace, ctx);

            if aggregator::all_finished(race) {
                apply_event(race, RaceEvent::AllFinished, ctx)?;
            }
        }
        (RaceStatus::Completed, _) => {
            race.ended_at = Some(now);
            aggregator::recompute(race)?;
            announce_results(race, ctx);
        }
        (RaceStatus::Cancelled, RaceEvent::Cancel { reason }) => {
            race.ended_at = Some(now);
            let body = match &reason {
                Some(reason) => format!("The race \"{}\" was cancelled: {reason}", race.title),
                None => format!("The race \"{}\" was cancelled", race.title),
            };
            race.cancellation_reason = reason;
            let message = Message::new(NotificationKind::RaceCancelled, "❌ Race Cancelled", body)
                .with("race_id", race.id.to_string());
            let organizer = race.organizer_id.clone();
            ctx.outbox
                .fan_out(race.id, race.counted_ids(), Some(organizer.as_str()), &message);
        }
        _ => {}
    }

    Ok(())
}

/// Apply every time-driven transition due at `ctx.now`, then the deadline warning.
pub fn advance_due(race: &mut Race, ctx: &mut TxContext<'_>) -> Result<Advance, ServiceError> {
    let mut advance = Advance::default();

    while let Some(event) = due_event(race.timeline(), ctx.now) {
        apply_event(race, event, ctx)?;
        advance.entered.push(race.status);
    }

    advance.warned = warn_deadline(race, ctx);
    Ok(advance)
}

/// Enqueue the one-shot "minutes left" warning once the deadline is close enough.
pub fn warn_deadline(race: &mut Race, ctx: &mut TxContext<'_>) -> bool {
    if race.status != RaceStatus::Ending || race.countdown_notified {
        return false;
    }
    let Some(deadline) = race.deadline else {
        return false;
    };
    let remaining = deadline.duration_since(ctx.now).unwrap_or(Duration::ZERO);
    if remaining > ctx.config.race.countdown_warning_lead {
        return false;
    }

    race.countdown_notified = true;
    let minutes = minutes_ceil(remaining);
    let message = Message::new(
        NotificationKind::DeadlineWarning,
        format!("⏰ {minutes} Minutes Left!"),
        format!("Only {minutes} minutes left to finish \"{}\"!", race.title),
    )
    .with("race_id", race.id.to_string())
    .with("minutes_left", minutes);
    ctx.outbox.fan_out(race.id, race.racing_ids(), None, &message);
    true
}

/// Follow-up once `user_id` reached the target: first finisher or last one.
pub fn on_participant_completed(
    race: &mut Race,
    user_id: &str,
    ctx: &mut TxContext<'_>,
) -> Result<(), ServiceError> {
    match race.status {
        RaceStatus::Active => apply_event(
            race,
            RaceEvent::FirstFinisher {
                user_id: user_id.to_string(),
            },
            ctx,
        ),
        RaceStatus::Ending => settle(race, ctx),
        _ => Ok(()),
    }
}

/// Complete an ENDING race once nobody is left racing.
pub fn settle(race: &mut Race, ctx: &mut TxContext<'_>) -> Result<(), ServiceError> {
    if race.status == RaceStatus::Ending && aggregator::all_finished(race) {
        apply_event(race, RaceEvent::AllFinished, ctx)?;
    }
    Ok(())
}

/// Notify the organizer that somebody joined.
pub fn announce_join(race: &Race, user_id: &str, ctx: &mut TxContext<'_>) {
    if user_id == race.organizer_id {
        return;
    }
    let name = race.display_name(user_id);
    let message = Message::new(
        NotificationKind::ParticipantJoined,
        "Someone Joined Your Race! 🎉",
        format!("{name} joined \"{}\"", race.title),
    )
    .occurrence(user_id)
    .with("race_id", race.id.to_string())
    .with("participant_id", user_id);
    ctx.outbox.send(race.id, race.organizer_id.clone(), message);
}

/// Leader change, overtakes and milestones derived from one standings update.
///
/// `before` is the standing order and `leader_before` the leader id read
/// before the report was applied; ranks must already be recomputed.
pub fn announce_standings(
    race: &Race,
    actor: &str,
    before: &[String],
    leader_before: Option<&str>,
    milestone: Option<u8>,
    ctx: &mut TxContext<'_>,
) {
    if race.status.is_terminal() {
        return;
    }
    let version = race.version;
    let after = aggregator::standings(race);
    let actor_name = race.display_name(actor);

    let overtaken = aggregator::overtaken_by(before, &after, actor);
    if let Some(first) = overtaken.first() {
        let rank = race.participants.get(actor).and_then(|p| p.rank).unwrap_or(0);
        let names: Vec<String> = overtaken.iter().map(|id| race.display_name(id)).collect();
        let message = Message::new(
            NotificationKind::Overtaking,
            "Great Overtake! 🚀",
            format!(
                "Awesome! You overtook {} and moved to rank #{rank}!",
                names.join(", ")
            ),
        )
        .occurrence(version)
        .with("race_id", race.id.to_string())
        .with("rank", rank)
        .with("overtaken_id", first.as_str());
        ctx.outbox.send(race.id, actor, message);

        let message = Message::new(
            NotificationKind::Overtaken,
            "You Were Overtaken! ⚡",
            format!("{actor_name} just overtook you! Speed up to reclaim your position!"),
        )
        .occurrence(version)
        .with("race_id", race.id.to_string())
        .with("overtaker_id", actor);
        ctx.outbox
            .fan_out(race.id, overtaken.iter().cloned(), None, &message);

        let message = Message::new(
            NotificationKind::OvertakingAlert,
            "Overtaking Alert! 🏃‍♂️",
            format!(
                "{actor_name} overtook {} and moved to rank #{rank}!",
                names.join(", ")
            ),
        )
        .occurrence(version)
        .with("race_id", race.id.to_string())
        .with("overtaker_id", actor)
        .with("overtaken_id", first.as_str())
        .with("rank", rank);
        let bystanders = race
            .racing_ids()
            .into_iter()
            .filter(|id| id != actor && !overtaken.contains(id));
        ctx.outbox.fan_out(race.id, bystanders, None, &message);
    }

    let leader_after = race.top_participant.as_ref().map(|top| top.user_id.as_str());
    if let (Some(previous), Some(leader)) = (leader_before, leader_after) {
        if previous != leader {
            let name = race.display_name(leader);
            let message = Message::new(
                NotificationKind::LeaderChanged,
                "New Leader! 👑",
                format!("{name} took the lead in \"{}\"", race.title),
            )
            .occurrence(version)
            .with("race_id", race.id.to_string())
            .with("leader_id", leader);
            ctx.outbox
                .fan_out(race.id, race.counted_ids(), Some(leader), &message);
        }
    }

    if let Some(milestone) = milestone {
        let message = Message::new(
            NotificationKind::MilestonePersonal,
            "Milestone Reached! 🎯",
            format!(
                "Great job! You've completed {milestone}% of \"{}\"!",
                race.title
            ),
        )
        .occurrence(milestone)
        .with("race_id", race.id.to_string())
        .with("milestone", milestone);
        ctx.outbox.send(race.id, actor, message);

        let message = Message::new(
            NotificationKind::MilestoneAlert,
            format!("{actor_name} Hit {milestone}%! 🎯"),
            format!("{actor_name} reached {milestone}% of \"{}\"", race.title),
        )
        .occurrence(format!("{actor}:{milestone}"))
        .with("race_id", race.id.to_string())
        .with("participant_id", actor)
        .with("milestone", milestone);
        ctx.outbox
            .fan_out(race.id, race.racing_ids(), Some(actor), &message);
    }
}

fn announce_first_finisher(race: &Race, user_id: &str, grace: Duration, ctx: &mut TxContext<'_>) {
    let message = Message::new(
        NotificationKind::FirstFinisher,
        "🏁 First to Finish!",
        format!("Amazing! You're the first to complete \"{}\"!", race.title),
    )
    .with("race_id", race.id.to_string());
    ctx.outbox.send(race.id, user_id, message);

    let name = race.display_name(user_id);
    let minutes = minutes_ceil(grace);
    let message = Message::new(
        NotificationKind::DeadlineAlert,
        "⏰ Deadline Approaching!",
        format!("{name} finished first! You have {minutes} minutes to complete the race!"),
    )
    .with("race_id", race.id.to_string())
    .with("first_finisher_id", user_id)
    .with("minutes_left", minutes);
    ctx.outbox
        .fan_out(race.id, race.racing_ids(), Some(user_id), &message);
}

fn announce_results(race: &Race, ctx: &mut TxContext<'_>) {
    for participant in race.counted() {
        let rank = participant.rank.unwrap_or(0);
        let finished = participant.status == ParticipantStatus::Completed;
        let (title, body) = match (finished, rank) {
            (true, 1) => (
                "Congratulations! 🥇".to_string(),
                format!("You won \"{}\"!", race.title),
            ),
            (true, 2) => (
                "Great Job! 🥈".to_string(),
                format!("You finished 2nd in \"{}\"!", race.title),
            ),
            (true, 3) => (
                "Excellent! 🥉".to_string(),
                format!("You finished 3rd in \"{}\"!", race.title),
            ),
            _ => (
                "Race Completed! 🏃‍♂️".to_string(),
                format!("You finished {} in \"{}\"", ordinal(rank), race.title),
            ),
        };

        let message = Message::new(NotificationKind::RaceCompleted, title, body)
            .with("race_id", race.id.to_string())
            .with("rank", rank)
            .with("finished", finished);
        ctx.outbox.send(race.id, participant.user_id.clone(), message);
    }
}

fn minutes_ceil(duration: Duration) -> u64 {
    duration.as_secs().div_ceil(60)
}

fn ordinal(rank: u32) -> String {
    let suffix = match (rank % 10, rank % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{rank}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AppConfig,
        services::testing::epoch,
        state::{notification::Outbox, race::RaceDraft},
    };

    fn scheduled_race(at: u64, users: &[&str]) -> Race {
        let mut race = Race::new(
            RaceDraft {
                title: "Evening walk".into(),
                organizer_id: "org".into(),
                organizer_name: "Org".into(),
                target_progress: 1_000.0,
                schedule_time: Some(epoch(at)),
                max_participants: None,
                organizer_joins: true,
            },
            epoch(0),
        );
        for user in users {
            aggregator::join(&mut race, user, user, epoch(1)).unwrap();
        }
        aggregator::recompute(&mut race).unwrap();
        race
    }

    fn context(config: &AppConfig, now: u64) -> TxContext<'_> {
        TxContext {
            now: epoch(now),
            config,
            outbox: Outbox::new(),
        }
    }

    #[test]
    fn missed_ticks_catch_up_in_one_evaluation() {
        let config = AppConfig::default();
        let mut race = scheduled_race(100, &["a"]);

        let mut ctx = context(&config, 10_000);
        let advance = advance_due(&mut race, &mut ctx).unwrap();

        assert_eq!(
            advance.entered,
            [RaceStatus::Countdown, RaceStatus::Active]
        );
        assert_eq!(race.participants["a"].status, ParticipantStatus::Active);
        assert_eq!(race.participants["org"].status, ParticipantStatus::Active);
        assert_eq!(race.started_at, Some(epoch(10_000)));
        assert_eq!(
            ctx.outbox
                .iter()
                .filter(|n| n.kind == NotificationKind::RaceStarted)
                .count(),
            2
        );
    }

    #[test]
    fn zero_countdown_goes_live_immediately() {
        let mut config = AppConfig::default();
        config.race.countdown_duration = Duration::ZERO;
        let mut race = scheduled_race(100, &[]);

        let mut ctx = context(&config, 50);
        apply_event(&mut race, RaceEvent::StartRequested, &mut ctx).unwrap();
        assert_eq!(race.status, RaceStatus::Active);
        assert_eq!(race.countdown_ends_at, Some(epoch(50)));
    }

    #[test]
    fn single_finisher_passes_through_ending() {
        let config = AppConfig::default();
        let mut race = scheduled_race(0, &[]);
        let mut ctx = context(&config, 100);
        advance_due(&mut race, &mut ctx).unwrap();

        aggregator::complete(&mut race, "org", epoch(100)).unwrap();
        on_participant_completed(&mut race, "org", &mut ctx).unwrap();

        assert_eq!(race.status, RaceStatus::Completed);
        assert_eq!(race.first_finisher_id.as_deref(), Some("org"));
        assert!(race.deadline.is_some());
        let kinds: Vec<_> = ctx.outbox.iter().map(|n| n.kind).collect();
        assert!(kinds.contains(&NotificationKind::FirstFinisher));
        assert!(kinds.contains(&NotificationKind::RaceCompleted));
    }

    #[test]
    fn deadline_warning_fires_once() {
        let config = AppConfig::default();
        let mut race = scheduled_race(0, &["a"]);
        let mut ctx = context(&config, 100);
        advance_due(&mut race, &mut ctx).unwrap();
        aggregator::complete(&mut race, "org", epoch(100)).unwrap();
        on_participant_completed(&mut race, "org", &mut ctx).unwrap();
        assert_eq!(race.status, RaceStatus::Ending);

        let deadline = race.deadline.unwrap();
        let mut early = context(&config, 100 + 60);
        assert!(!warn_deadline(&mut race, &mut early));

        let close = deadline - Duration::from_secs(4 * 60);
        let mut ctx = TxContext {
            now: close,
            config: &config,
            outbox: Outbox::new(),
        };
        assert!(warn_deadline(&mut race, &mut ctx));
        assert!(!warn_deadline(&mut race, &mut ctx));

        let warnings: Vec<_> = ctx
            .outbox
            .iter()
            .filter(|n| n.kind == NotificationKind::DeadlineWarning)
            .map(|n| n.recipient_id.as_str())
            .collect();
        assert_eq!(warnings, ["a"]);
    }

    #[test]
    fn cancellation_records_reason_and_skips_organizer() {
        let config = AppConfig::default();
        let mut race = scheduled_race(500, &["a", "b"]);
        let mut ctx = context(&config, 10);

        apply_event(
            &mut race,
            RaceEvent::Cancel {
                reason: Some("storm".into()),
            },
            &mut ctx,
        )
        .unwrap();

        assert_eq!(race.status, RaceStatus::Cancelled);
        assert_eq!(race.cancellation_reason.as_deref(), Some("storm"));
        let recipients: Vec<_> = ctx.outbox.iter().map(|n| n.recipient_id.as_str()).collect();
        assert_eq!(recipients, ["a", "b"]);
        assert!(ctx.outbox.iter().all(|n| n.body.ends_with("storm")));
    }

    #[test]
    fn ordinals() {
        assert_eq!(ordinal(1), "1st");
        assert_eq!(ordinal(4), "4th");
        assert_eq!(ordinal(12), "12th");
        assert_eq!(ordinal(22), "22nd");
    }
}

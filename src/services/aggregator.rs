//! Participant bookkeeping: membership changes, progress, ranks and cached counters.
//!
//! Everything here is a pure function over a [`Race`] snapshot. Callers run it
//! inside a read-modify-write so the participant mutation and the derived
//! fields land in the same conditional write.

use std::{cmp::Ordering, time::SystemTime};

use crate::{
    error::ServiceError,
    state::{
        race::{Participant, ParticipantStatus, Race, TopParticipant},
        state_machine::RaceStatus,
    },
};

/// How a join request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// A new participant record was appended.
    Joined,
    /// A previously left participant was revived in place.
    Rejoined,
}

/// Result of a progress report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressReport {
    /// The reported value moved the participant forward.
    pub accepted: bool,
    /// The participant reached the target with this report.
    pub completed: bool,
    /// Highest milestone crossed by this report, if any.
    pub milestone: Option<u8>,
}

fn ensure_mutable(race: &Race) -> Result<(), ServiceError> {
    if race.status.is_terminal() {
        return Err(ServiceError::InvalidState(format!(
            "race is {}",
            race.status
        )));
    }
    Ok(())
}

fn participant_mut<'a>(
    race: &'a mut Race,
    user_id: &str,
) -> Result<&'a mut Participant, ServiceError> {
    race.participants
        .get_mut(user_id)
        .ok_or_else(|| ServiceError::NotFound(format!("participant `{user_id}`")))
}

/// Standing order: progress desc, finishers first by arrival, then join order.
fn standing_order(a: &Participant, b: &Participant) -> Ordering {
    b.progress
        .total_cmp(&a.progress)
        .then_with(|| match (a.finish_order, b.finish_order) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.join_order.cmp(&b.join_order))
}

/// Recompute ranks, counters and the leader snapshot from scratch, then
/// verify that ranks form a permutation of `1..=N`.
pub fn recompute(race: &mut Race) -> Result<(), ServiceError> {
    let mut ordered: Vec<(String, Participant)> = race
        .counted()
        .map(|p| (p.user_id.clone(), p.clone()))
        .collect();
    ordered.sort_by(|(_, a), (_, b)| standing_order(a, b));

    for participant in race.participants.values_mut() {
        participant.rank = None;
    }
    for (index, (user_id, _)) in ordered.iter().enumerate() {
        if let Some(participant) = race.participants.get_mut(user_id) {
            participant.rank = Some(index as u32 + 1);
        }
    }

    let count_status = |race: &Race, status: ParticipantStatus| {
        race.participants
            .values()
            .filter(|p| p.status == status)
            .count() as u32
    };
    race.participant_count = ordered.len() as u32;
    race.active_participant_count = count_status(&*race, ParticipantStatus::Active);
    race.completed_participant_count = count_status(&*race, ParticipantStatus::Completed);
    race.top_participant = ordered.first().map(|(_, leader)| TopParticipant {
        user_id: leader.user_id.clone(),
        display_name: leader.display_name.clone(),
        progress: leader.progress,
    });

    verify_ranks(race)
}

/// Check the rank permutation and leader invariants on a snapshot.
pub fn verify_ranks(race: &Race) -> Result<(), ServiceError> {
    let mut ranks: Vec<u32> = Vec::with_capacity(race.participants.len());
    for participant in race.participants.values() {
        match (participant.is_counted(), participant.rank) {
            (true, Some(rank)) => ranks.push(rank),
            (true, None) => {
                return Err(ServiceError::InvariantViolation(format!(
                    "participant `{}` has no rank",
                    participant.user_id
                )));
            }
            (false, Some(_)) => {
                return Err(ServiceError::InvariantViolation(format!(
                    "participant `{}` left but kept a rank",
                    participant.user_id
                )));
            }
            (false, None) => {}
        }
    }

    ranks.sort_unstable();
    if ranks.iter().zip(1u32..).any(|(rank, expected)| *rank != expected) {
        return Err(ServiceError::InvariantViolation(format!(
            "ranks {ranks:?} are not a permutation of 1..={}",
            ranks.len()
        )));
    }

    let max_progress = race
        .counted()
        .map(|p| p.progress)
        .fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |m| m.max(p))));
    let leader_progress = race
        .counted()
        .find(|p| p.rank == Some(1))
        .map(|p| p.progress);
    if leader_progress != max_progress {
        return Err(ServiceError::InvariantViolation(
            "rank 1 does not hold the maximal progress".into(),
        ));
    }

    Ok(())
}

/// Counted participants ordered by rank.
pub fn standings(race: &Race) -> Vec<String> {
    let mut counted: Vec<&Participant> = race.counted().collect();
    counted.sort_by_key(|p| p.rank.unwrap_or(u32::MAX));
    counted.into_iter().map(|p| p.user_id.clone()).collect()
}

/// Participants that were ahead of `actor` in `before` and are behind it in `after`.
pub fn overtaken_by(before: &[String], after: &[String], actor: &str) -> Vec<String> {
    let position = |list: &[String], id: &str| list.iter().position(|entry| entry == id);
    let (Some(old), Some(new)) = (position(before, actor), position(after, actor)) else {
        return Vec::new();
    };
    if new >= old {
        return Vec::new();
    }

    before[new..old]
        .iter()
        .filter(|id| position(after, id).is_some_and(|pos| pos > new))
        .cloned()
        .collect()
}

/// Register `user_id`, or revive their record if they left earlier.
pub fn join(
    race: &mut Race,
    user_id: &str,
    display_name: &str,
    now: SystemTime,
) -> Result<JoinOutcome, ServiceError> {
    ensure_mutable(race)?;
    if !race.status.accepts_joins() {
        return Err(ServiceError::InvalidState(format!(
            "race no longer accepts participants ({})",
            race.status
        )));
    }

    let existing = race.participants.get(user_id).map(|p| p.status);
    if existing.is_some_and(|status| status != ParticipantStatus::Left) {
        return Err(ServiceError::InvalidState(format!(
            "`{user_id}` already joined this race"
        )));
    }
    if let Some(max) = race.max_participants {
        if race.counted().count() as u32 >= max {
            return Err(ServiceError::InvalidState(format!(
                "race is full ({max} participants)"
            )));
        }
    }

    let status = if race.status == RaceStatus::Active {
        ParticipantStatus::Active
    } else {
        ParticipantStatus::Joined
    };

    if existing.is_some() {
        let participant = participant_mut(race, user_id)?;
        participant.status = status;
        participant.display_name = display_name.to_string();
        participant.joined_at = now;
        return Ok(JoinOutcome::Rejoined);
    }

    let participant = race.new_participant(user_id.to_string(), display_name.to_string(), now);
    race.participants.insert(user_id.to_string(), participant);
    Ok(JoinOutcome::Joined)
}

/// Soft-delete a participant; the record stays for history.
pub fn leave(race: &mut Race, user_id: &str) -> Result<(), ServiceError> {
    ensure_mutable(race)?;
    let participant = participant_mut(race, user_id)?;
    match participant.status {
        ParticipantStatus::Left => Err(ServiceError::InvalidState(format!(
            "`{user_id}` already left this race"
        ))),
        ParticipantStatus::Completed => Err(ServiceError::InvalidState(format!(
            "`{user_id}` already finished this race"
        ))),
        ParticipantStatus::Joined | ParticipantStatus::Active => {
            participant.status = ParticipantStatus::Left;
            participant.rank = None;
            Ok(())
        }
    }
}

/// Flip every `joined` participant to `active` when the race goes live.
pub fn activate_joined(race: &mut Race) {
    for participant in race.participants.values_mut() {
        if participant.status == ParticipantStatus::Joined {
            participant.status = ParticipantStatus::Active;
        }
    }
}

/// Record a progress report. Lower or equal values are ignored; reaching the
/// target completes the participant.
pub fn record_progress(
    race: &mut Race,
    user_id: &str,
    progress: f64,
    now: SystemTime,
    milestones: &[u8],
) -> Result<ProgressReport, ServiceError> {
    ensure_mutable(race)?;
    if !progress.is_finite() || progress < 0.0 {
        return Err(ServiceError::InvalidInput(format!(
            "progress must be a finite, non-negative number (got {progress})"
        )));
    }
    if !race.status.accepts_progress() {
        return Err(ServiceError::InvalidState(format!(
            "race does not accept progress while {}",
            race.status
        )));
    }

    let target = race.target_progress;
    let next_finish = next_finish_order(race);
    let participant = participant_mut(race, user_id)?;
    if !participant.is_racing() {
        return Err(ServiceError::InvalidState(format!(
            "`{user_id}` is not racing"
        )));
    }

    participant.status = ParticipantStatus::Active;
    if progress <= participant.progress {
        return Ok(ProgressReport::default());
    }

    let previous = participant.progress;
    participant.progress = progress.min(target);
    let milestone = cross_milestones(participant, previous, target, milestones);

    let completed = progress >= target;
    if completed {
        mark_completed(participant, next_finish, now);
    }

    Ok(ProgressReport {
        accepted: true,
        completed,
        milestone,
    })
}

/// Explicitly complete a participant; progress is set to the target.
pub fn complete(race: &mut Race, user_id: &str, now: SystemTime) -> Result<(), ServiceError> {
    ensure_mutable(race)?;
    if !race.status.accepts_progress() {
        return Err(ServiceError::InvalidState(format!(
            "race cannot be finished while {}",
            race.status
        )));
    }

    let target = race.target_progress;
    let next_finish = next_finish_order(race);
    let participant = participant_mut(race, user_id)?;
    if !participant.is_racing() {
        return Err(ServiceError::InvalidState(format!(
            "`{user_id}` is not racing"
        )));
    }

    participant.progress = target;
    mark_completed(participant, next_finish, now);
    Ok(())
}

/// Whether every non-left participant has finished.
pub fn all_finished(race: &Race) -> bool {
    let mut counted = race.counted().peekable();
    counted.peek().is_some() && counted.all(|p| p.status == ParticipantStatus::Completed)
}

fn next_finish_order(race: &Race) -> u32 {
    race.participants
        .values()
        .filter_map(|p| p.finish_order)
        .max()
        .map_or(1, |max| max + 1)
}

fn mark_completed(participant: &mut Participant, finish_order: u32, now: SystemTime) {
    participant.status = ParticipantStatus::Completed;
    participant.completed_at = Some(now);
    participant.finish_order = Some(finish_order);
}

/// Record every milestone crossed between `previous` and the current progress;
/// only the highest one is reported.
fn cross_milestones(
    participant: &mut Participant,
    previous: f64,
    target: f64,
    milestones: &[u8],
) -> Option<u8> {
    let before = previous / target * 100.0;
    let after = participant.progress / target * 100.0;
    let mut highest = None;

    for &milestone in milestones {
        let threshold = f64::from(milestone);
        if before < threshold
            && after >= threshold
            && !participant.reached_milestones.contains(&milestone)
        {
            participant.reached_milestones.push(milestone);
            highest = Some(milestone);
        }
    }

    highest
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::state::race::RaceDraft;

    fn epoch(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn active_race(users: &[&str]) -> Race {
        let mut race = Race::new(
            RaceDraft {
                title: "Morning 5k".into(),
                organizer_id: "org".into(),
                organizer_name: "Organizer".into(),
                target_progress: 100.0,
                schedule_time: None,
                max_participants: None,
                organizer_joins: false,
            },
            epoch(0),
        );
        for user in users {
            join(&mut race, user, user, epoch(1)).unwrap();
        }
        recompute(&mut race).unwrap();
        race
    }

    fn rank_of(race: &Race, user: &str) -> Option<u32> {
        race.participants[user].rank
    }

    #[test]
    fn ranks_follow_progress_then_join_order() {
        let mut race = active_race(&["a", "b", "c"]);
        assert_eq!(standings(&race), ["a", "b", "c"]);

        record_progress(&mut race, "c", 40.0, epoch(2), &[]).unwrap();
        record_progress(&mut race, "b", 40.0, epoch(2), &[]).unwrap();
        recompute(&mut race).unwrap();

        assert_eq!(rank_of(&race, "b"), Some(1));
        assert_eq!(rank_of(&race, "c"), Some(2));
        assert_eq!(rank_of(&race, "a"), Some(3));
        let top = race.top_participant.as_ref().unwrap();
        assert_eq!(top.user_id, "b");
        assert_eq!(top.progress, 40.0);
    }

    #[test]
    fn finishers_rank_by_arrival() {
        let mut race = active_race(&["a", "b"]);
        record_progress(&mut race, "b", 150.0, epoch(2), &[]).unwrap();
        record_progress(&mut race, "a", 100.0, epoch(3), &[]).unwrap();
        recompute(&mut race).unwrap();

        assert_eq!(race.participants["b"].progress, 100.0);
        assert_eq!(race.participants["b"].finish_order, Some(1));
        assert_eq!(race.participants["a"].finish_order, Some(2));
        assert_eq!(standings(&race), ["b", "a"]);
        assert_eq!(race.completed_participant_count, 2);
        assert!(all_finished(&race));
    }

    #[test]
    fn leaving_mid_race_closes_rank_gaps() {
        let mut race = active_race(&["a", "b", "c"]);
        record_progress(&mut race, "a", 30.0, epoch(2), &[]).unwrap();
        record_progress(&mut race, "b", 20.0, epoch(2), &[]).unwrap();
        record_progress(&mut race, "c", 10.0, epoch(2), &[]).unwrap();
        recompute(&mut race).unwrap();
        let active_before = race.active_participant_count;

        leave(&mut race, "b").unwrap();
        recompute(&mut race).unwrap();

        assert_eq!(race.participant_count, 2);
        assert_eq!(race.active_participant_count, active_before - 1);
        assert_eq!(rank_of(&race, "a"), Some(1));
        assert_eq!(rank_of(&race, "c"), Some(2));
        assert_eq!(rank_of(&race, "b"), None);
        assert_eq!(race.participants["b"].status, ParticipantStatus::Left);
    }

    #[test]
    fn leaving_before_start_does_not_touch_active_count() {
        let mut race = active_race(&[]);
        race.status = RaceStatus::Scheduled;
        join(&mut race, "a", "A", epoch(1)).unwrap();
        join(&mut race, "b", "B", epoch(1)).unwrap();
        recompute(&mut race).unwrap();
        assert_eq!(race.active_participant_count, 0);

        leave(&mut race, "a").unwrap();
        recompute(&mut race).unwrap();
        assert_eq!(race.participant_count, 1);
        assert_eq!(race.active_participant_count, 0);
    }

    #[test]
    fn progress_never_decreases() {
        let mut race = active_race(&["a"]);
        record_progress(&mut race, "a", 50.0, epoch(2), &[]).unwrap();
        let report = record_progress(&mut race, "a", 20.0, epoch(3), &[]).unwrap();
        assert!(!report.accepted);
        assert_eq!(race.participants["a"].progress, 50.0);
    }

    #[test]
    fn invalid_progress_is_rejected() {
        let mut race = active_race(&["a"]);
        for bad in [-1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                record_progress(&mut race, "a", bad, epoch(2), &[]),
                Err(ServiceError::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn milestones_are_reported_once() {
        let mut race = active_race(&["a"]);
        let report = record_progress(&mut race, "a", 55.0, epoch(2), &[25, 50, 75]).unwrap();
        assert_eq!(report.milestone, Some(50));
        assert_eq!(race.participants["a"].reached_milestones, [25, 50]);

        let report = record_progress(&mut race, "a", 60.0, epoch(3), &[25, 50, 75]).unwrap();
        assert_eq!(report.milestone, None);
    }

    #[test]
    fn join_rules() {
        let mut race = active_race(&["a"]);
        race.max_participants = Some(2);

        assert!(matches!(
            join(&mut race, "a", "A", epoch(2)),
            Err(ServiceError::InvalidState(_))
        ));
        assert_eq!(join(&mut race, "b", "B", epoch(2)).unwrap(), JoinOutcome::Joined);
        assert_eq!(race.participants["b"].status, ParticipantStatus::Active);
        assert!(join(&mut race, "c", "C", epoch(2)).is_err());

        leave(&mut race, "b").unwrap();
        assert_eq!(
            join(&mut race, "b", "B", epoch(3)).unwrap(),
            JoinOutcome::Rejoined
        );
        assert_eq!(race.participants["b"].join_order, 2);
    }

    #[test]
    fn terminal_races_are_immutable() {
        let mut race = active_race(&["a", "b"]);
        race.status = RaceStatus::Completed;
        assert!(matches!(
            join(&mut race, "c", "C", epoch(2)),
            Err(ServiceError::InvalidState(_))
        ));
        assert!(leave(&mut race, "a").is_err());
        assert!(record_progress(&mut race, "a", 10.0, epoch(2), &[]).is_err());
        assert!(complete(&mut race, "a", epoch(2)).is_err());
    }

    #[test]
    fn broken_ranks_are_detected() {
        let mut race = active_race(&["a", "b"]);
        race.participants.get_mut("b").unwrap().rank = Some(1);
        assert!(matches!(
            verify_ranks(&race),
            Err(ServiceError::InvariantViolation(_))
        ));
    }

    #[test]
    fn overtakes_are_derived_from_standings() {
        let before = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let after = vec!["c".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(overtaken_by(&before, &after, "c"), ["a", "b"]);
        assert!(overtaken_by(&before, &after, "a").is_empty());
    }
}

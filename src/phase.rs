//! The election phase state machine.
//!
//! The authoritative phase is always derived on demand from the persisted
//! status, schedule, and auto-transition flag plus wall-clock time; it is
//! never stored. All state-mutating operations consult the derived phase
//! (and the voter/vote gating predicates below) before touching anything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::election::{ElectionStatus, Schedule};

/// The authoritative lifecycle stage of an election.
///
/// Reachable in the order draft → before_registration → registration →
/// between_phases → voting → closed; the two waiting stages are skipped
/// when the relevant dates are unset. `Closed` is terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Draft,
    BeforeRegistration,
    Registration,
    BetweenPhases,
    Voting,
    Closed,
}

impl Phase {
    /// Derive the phase from the persisted election state at `now`.
    pub fn derive(
        status: ElectionStatus,
        auto_transition: bool,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Phase {
        match status {
            // Draft and closed override the schedule unconditionally.
            ElectionStatus::Draft => Phase::Draft,
            ElectionStatus::Closed => Phase::Closed,
            _ if auto_transition => Self::derive_auto(status, schedule, now),
            _ => Self::derive_manual(status, schedule, now),
        }
    }

    /// Auto-transition mode: the schedule alone drives the phase, with
    /// `status` only consulted for organizer-activated open-ended voting.
    fn derive_auto(status: ElectionStatus, schedule: &Schedule, now: DateTime<Utc>) -> Phase {
        if let Some(voting_end) = schedule.voting_end {
            if now > voting_end {
                return Phase::Closed;
            }
        }
        if let Some(voting_start) = schedule.voting_start {
            // voting_end already known to be >= now (or unset).
            if voting_start <= now {
                return Phase::Voting;
            }
        } else if status == ElectionStatus::Voting {
            // Organizer-activated election with an open-ended voting window.
            return Phase::Voting;
        }
        // A set-but-future voting_start falls through to the registration
        // sub-logic even when the status has already been raised.
        if let Some(registration_start) = schedule.registration_start {
            if now < registration_start {
                return Phase::BeforeRegistration;
            }
            if schedule
                .registration_end
                .map_or(true, |end| now <= end)
            {
                return Phase::Registration;
            }
        }
        if let Some(registration_end) = schedule.registration_end {
            if now > registration_end {
                return Phase::BetweenPhases;
            }
        }
        // Reachable only with partially configured dates; write-time
        // validation rejects those, but fall back to the status verbatim.
        match status {
            ElectionStatus::Voting => Phase::Voting,
            _ => Phase::Registration,
        }
    }

    /// Manual mode: `status` is the ceiling the organizer raises by hand.
    /// Registration-window sub-logic applies within `Registration`; the
    /// voting-end cutoff still auto-closes the derived phase within
    /// `Voting` even though the organizer has not clicked "close".
    fn derive_manual(status: ElectionStatus, schedule: &Schedule, now: DateTime<Utc>) -> Phase {
        match status {
            ElectionStatus::Registration => {
                if let Some(start) = schedule.registration_start {
                    if now < start {
                        return Phase::BeforeRegistration;
                    }
                }
                if let Some(end) = schedule.registration_end {
                    if now > end {
                        return Phase::BetweenPhases;
                    }
                }
                Phase::Registration
            }
            ElectionStatus::Voting => {
                if let Some(end) = schedule.voting_end {
                    if now > end {
                        return Phase::Closed;
                    }
                }
                Phase::Voting
            }
            // Handled by `derive` before dispatching here.
            ElectionStatus::Draft => Phase::Draft,
            ElectionStatus::Closed => Phase::Closed,
        }
    }
}

/// Reject partially or inconsistently configured schedules at write time,
/// so the verbatim-status fallback in [`Phase::derive`] stays unreachable.
pub fn validate_schedule(schedule: &Schedule) -> Result<()> {
    if schedule.registration_end.is_some() && schedule.registration_start.is_none() {
        return Err(Error::bad_request(
            "Registration end requires a registration start",
        ));
    }
    if schedule.voting_end.is_some() && schedule.voting_start.is_none() {
        return Err(Error::bad_request("Voting end requires a voting start"));
    }
    if let (Some(start), Some(end)) = (schedule.registration_start, schedule.registration_end) {
        if end <= start {
            return Err(Error::bad_request(
                "Registration end must be after registration start",
            ));
        }
    }
    if let (Some(start), Some(end)) = (schedule.voting_start, schedule.voting_end) {
        if end <= start {
            return Err(Error::bad_request("Voting end must be after voting start"));
        }
    }
    Ok(())
}

// Mutation gating predicates. Callers supply the relevant counts; each
// predicate is a pure decision so every gate is independently testable.

/// Schedule instants may change until the derived phase is closed.
pub fn schedule_mutable(phase: Phase) -> bool {
    phase != Phase::Closed
}

/// Security level and location requirement are frozen once anyone has
/// registered.
pub fn security_mutable(voter_count: u64) -> bool {
    voter_count == 0
}

/// The vote-update flag is frozen once any vote exists.
pub fn vote_update_flag_mutable(vote_count: u64) -> bool {
    vote_count == 0
}

/// Positions and candidates may be added or edited until any vote exists.
pub fn positions_editable(vote_count: u64) -> bool {
    vote_count == 0
}

/// Positions and candidates may be removed until any voter exists.
pub fn positions_removable(voter_count: u64) -> bool {
    voter_count == 0
}

/// Regions may be added until any vote exists (same gate as editing).
pub fn regions_editable(vote_count: u64) -> bool {
    vote_count == 0
}

/// A region may be removed only while no voter is assigned to it.
pub fn region_removable(assigned_voter_count: u64) -> bool {
    assigned_voter_count == 0
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn at(offset_minutes: i64) -> DateTime<Utc> {
        // Fixed epoch so tests are deterministic.
        DateTime::parse_from_rfc3339("2026-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::minutes(offset_minutes)
    }

    fn schedule(
        reg_start: Option<i64>,
        reg_end: Option<i64>,
        vote_start: Option<i64>,
        vote_end: Option<i64>,
    ) -> Schedule {
        Schedule {
            registration_start: reg_start.map(at),
            registration_end: reg_end.map(at),
            voting_start: vote_start.map(at),
            voting_end: vote_end.map(at),
        }
    }

    #[test]
    fn draft_and_closed_override_everything() {
        let full = schedule(Some(0), Some(10), Some(20), Some(30));
        for auto in [true, false] {
            assert_eq!(
                Phase::derive(ElectionStatus::Draft, auto, &full, at(25)),
                Phase::Draft
            );
            assert_eq!(
                Phase::derive(ElectionStatus::Closed, auto, &full, at(5)),
                Phase::Closed
            );
        }
    }

    #[test]
    fn auto_walks_the_full_lifecycle() {
        let s = schedule(Some(0), Some(10), Some(20), Some(30));
        let status = ElectionStatus::Registration;
        assert_eq!(
            Phase::derive(status, true, &s, at(-5)),
            Phase::BeforeRegistration
        );
        assert_eq!(Phase::derive(status, true, &s, at(5)), Phase::Registration);
        // Boundary: registration_end is inclusive.
        assert_eq!(Phase::derive(status, true, &s, at(10)), Phase::Registration);
        assert_eq!(
            Phase::derive(status, true, &s, at(15)),
            Phase::BetweenPhases
        );
        assert_eq!(Phase::derive(status, true, &s, at(20)), Phase::Voting);
        assert_eq!(Phase::derive(status, true, &s, at(30)), Phase::Voting);
        assert_eq!(Phase::derive(status, true, &s, at(31)), Phase::Closed);
    }

    #[test]
    fn auto_closed_is_monotonic_past_voting_end() {
        // For any now > voting_end, auto mode is closed regardless of the
        // other fields.
        let schedules = [
            schedule(Some(0), Some(10), Some(20), Some(30)),
            schedule(None, None, Some(20), Some(30)),
            schedule(None, None, None, Some(30)),
        ];
        for s in &schedules {
            for status in [ElectionStatus::Registration, ElectionStatus::Voting] {
                for minutes in [31, 60, 600, 6000] {
                    assert_eq!(Phase::derive(status, true, s, at(minutes)), Phase::Closed);
                }
            }
        }
    }

    #[test]
    fn auto_open_ended_voting_window() {
        // voting_start set, voting_end unset: voting from start onwards.
        let s = schedule(Some(0), Some(10), Some(20), None);
        assert_eq!(
            Phase::derive(ElectionStatus::Registration, true, &s, at(20)),
            Phase::Voting
        );
        assert_eq!(
            Phase::derive(ElectionStatus::Registration, true, &s, at(9999)),
            Phase::Voting
        );
    }

    #[test]
    fn auto_organizer_activated_without_dates() {
        // No voting dates at all, but the organizer has flipped the status:
        // voting with an open-ended window.
        let s = schedule(Some(0), Some(10), None, None);
        assert_eq!(
            Phase::derive(ElectionStatus::Voting, true, &s, at(15)),
            Phase::Voting
        );
    }

    #[test]
    fn auto_voting_status_respects_future_voting_start() {
        // Status raised early, but voting_start is in the future: still in
        // the registration sub-logic.
        let s = schedule(Some(0), Some(10), Some(20), Some(30));
        assert_eq!(
            Phase::derive(ElectionStatus::Voting, true, &s, at(5)),
            Phase::Registration
        );
        assert_eq!(
            Phase::derive(ElectionStatus::Voting, true, &s, at(15)),
            Phase::BetweenPhases
        );
    }

    #[test]
    fn manual_status_is_a_hard_ceiling() {
        // Even inside the configured voting window, manual mode never
        // reports voting until the organizer raises the status.
        let s = schedule(Some(0), Some(10), Some(20), Some(30));
        assert_eq!(
            Phase::derive(ElectionStatus::Registration, false, &s, at(25)),
            Phase::BetweenPhases
        );
        let no_reg_end = schedule(Some(0), None, Some(20), Some(30));
        assert_eq!(
            Phase::derive(ElectionStatus::Registration, false, &no_reg_end, at(25)),
            Phase::Registration
        );
    }

    #[test]
    fn manual_registration_window_sub_logic() {
        let s = schedule(Some(0), Some(10), None, None);
        let status = ElectionStatus::Registration;
        assert_eq!(
            Phase::derive(status, false, &s, at(-1)),
            Phase::BeforeRegistration
        );
        assert_eq!(Phase::derive(status, false, &s, at(5)), Phase::Registration);
        assert_eq!(
            Phase::derive(status, false, &s, at(11)),
            Phase::BetweenPhases
        );
    }

    #[test]
    fn manual_voting_auto_closes_past_voting_end() {
        let s = schedule(None, None, Some(0), Some(30));
        assert_eq!(
            Phase::derive(ElectionStatus::Voting, false, &s, at(29)),
            Phase::Voting
        );
        assert_eq!(
            Phase::derive(ElectionStatus::Voting, false, &s, at(31)),
            Phase::Closed
        );
    }

    #[test]
    fn manual_voting_ignores_registration_dates() {
        let s = schedule(Some(100), Some(200), None, None);
        assert_eq!(
            Phase::derive(ElectionStatus::Voting, false, &s, at(0)),
            Phase::Voting
        );
    }

    #[test]
    fn empty_schedule_falls_back_to_status() {
        let s = Schedule::default();
        assert_eq!(
            Phase::derive(ElectionStatus::Registration, true, &s, at(0)),
            Phase::Registration
        );
        assert_eq!(
            Phase::derive(ElectionStatus::Registration, false, &s, at(0)),
            Phase::Registration
        );
    }

    #[test]
    fn schedule_validation_rejects_partial_windows() {
        assert!(validate_schedule(&schedule(Some(0), Some(10), None, None)).is_ok());
        assert!(validate_schedule(&schedule(None, None, Some(0), Some(10))).is_ok());
        assert!(validate_schedule(&Schedule::default()).is_ok());
        assert!(validate_schedule(&schedule(None, Some(10), None, None)).is_err());
        assert!(validate_schedule(&schedule(None, None, None, Some(10))).is_err());
        assert!(validate_schedule(&schedule(Some(10), Some(10), None, None)).is_err());
        assert!(validate_schedule(&schedule(None, None, Some(20), Some(10))).is_err());
    }

    #[test]
    fn gating_predicates() {
        assert!(schedule_mutable(Phase::Draft));
        assert!(schedule_mutable(Phase::Voting));
        assert!(!schedule_mutable(Phase::Closed));

        assert!(security_mutable(0));
        assert!(!security_mutable(1));

        assert!(vote_update_flag_mutable(0));
        assert!(!vote_update_flag_mutable(3));

        assert!(positions_editable(0));
        assert!(!positions_editable(1));
        assert!(positions_removable(0));
        assert!(!positions_removable(1));

        assert!(regions_editable(0));
        assert!(!regions_editable(1));
        assert!(region_removable(0));
        assert!(!region_removable(2));
    }
}

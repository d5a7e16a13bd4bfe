use std::ops::{Deref, DerefMut};

use chrono::{DateTime, Utc};
use mongodb::bson::{to_bson, Bson};
use rand::distributions::{Alphanumeric, DistString};
use serde::{Deserialize, Serialize};

use crate::model::mongodb::{serde_option_datetime, Id};
use crate::phase::Phase;

/// Organizer-set lifecycle status. In manual mode this is the hard ceiling
/// the organizer raises by hand; in auto-transition mode only `Draft` and
/// `Closed` gate the schedule-derived phase.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionStatus {
    Draft,
    Registration,
    Voting,
    Closed,
}

impl From<ElectionStatus> for Bson {
    fn from(status: ElectionStatus) -> Self {
        to_bson(&status).unwrap() // Infallible.
    }
}

/// How aggressively duplicate-voter checks are applied at registration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// Email uniqueness only.
    Casual,
    /// Also one registration per device fingerprint.
    Standard,
    /// As standard; reserved for stricter future checks.
    Strict,
}

impl SecurityLevel {
    /// Whether this level enforces the one-registration-per-device check.
    pub fn checks_fingerprint(self) -> bool {
        !matches!(self, Self::Casual)
    }
}

/// The four optional schedule instants driving phase derivation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default, with = "serde_option_datetime")]
    pub registration_start: Option<DateTime<Utc>>,
    #[serde(default, with = "serde_option_datetime")]
    pub registration_end: Option<DateTime<Utc>>,
    #[serde(default, with = "serde_option_datetime")]
    pub voting_start: Option<DateTime<Utc>>,
    #[serde(default, with = "serde_option_datetime")]
    pub voting_end: Option<DateTime<Utc>>,
}

/// Schedule as submitted over the API, with plain RFC3339 datetimes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub registration_start: Option<DateTime<Utc>>,
    pub registration_end: Option<DateTime<Utc>>,
    pub voting_start: Option<DateTime<Utc>>,
    pub voting_end: Option<DateTime<Utc>>,
}

impl From<ScheduleSpec> for Schedule {
    fn from(spec: ScheduleSpec) -> Self {
        Schedule {
            registration_start: spec.registration_start,
            registration_end: spec.registration_end,
            voting_start: spec.voting_start,
            voting_end: spec.voting_end,
        }
    }
}

/// A position voters elect one candidate for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub id: Id,
    pub name: String,
    pub candidates: Vec<Candidate>,
}

impl Position {
    pub fn candidate(&self, id: Id) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: Id,
    pub name: String,
}

/// An extra registration form field defined by the organizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomField {
    pub name: String,
    pub required: bool,
}

/// Core election data, as stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionCore {
    /// Owning organizer.
    pub organizer_id: Id,
    pub title: String,
    pub description: String,
    /// Public share code voters use to reach the election.
    pub share_code: String,
    pub status: ElectionStatus,
    /// Schedule-driven phases when true; organizer-driven when false.
    pub auto_transition: bool,
    #[serde(flatten)]
    pub schedule: Schedule,
    pub require_location: bool,
    pub allow_vote_update: bool,
    pub security_level: SecurityLevel,
    pub positions: Vec<Position>,
    pub custom_fields: Vec<CustomField>,
}

impl ElectionCore {
    /// Create a new election from an organizer-submitted spec.
    pub fn new(organizer_id: Id, spec: ElectionSpec) -> Self {
        Self {
            organizer_id,
            title: spec.title,
            description: spec.description,
            share_code: random_share_code(),
            status: ElectionStatus::Draft,
            auto_transition: spec.auto_transition,
            schedule: spec.schedule.into(),
            require_location: spec.require_location,
            allow_vote_update: spec.allow_vote_update,
            security_level: spec.security_level,
            positions: spec.positions.into_iter().map(Into::into).collect(),
            custom_fields: spec.custom_fields,
        }
    }

    /// The authoritative phase of this election at the given instant.
    pub fn phase_at(&self, now: DateTime<Utc>) -> Phase {
        Phase::derive(self.status, self.auto_transition, &self.schedule, now)
    }

    pub fn position(&self, id: Id) -> Option<&Position> {
        self.positions.iter().find(|p| p.id == id)
    }
}

/// An election without an ID.
pub type NewElection = ElectionCore;

/// An election from the database, with its unique ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Election {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub election: ElectionCore,
}

impl Deref for Election {
    type Target = ElectionCore;

    fn deref(&self) -> &Self::Target {
        &self.election
    }
}

impl DerefMut for Election {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.election
    }
}

/// Organizer-submitted election definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub schedule: ScheduleSpec,
    #[serde(default)]
    pub auto_transition: bool,
    #[serde(default)]
    pub require_location: bool,
    #[serde(default)]
    pub allow_vote_update: bool,
    pub security_level: SecurityLevel,
    pub positions: Vec<PositionSpec>,
    #[serde(default)]
    pub custom_fields: Vec<CustomField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSpec {
    pub name: String,
    pub candidates: Vec<String>,
}

impl From<PositionSpec> for Position {
    fn from(spec: PositionSpec) -> Self {
        Position {
            id: Id::new(),
            name: spec.name,
            candidates: spec
                .candidates
                .into_iter()
                .map(|name| Candidate {
                    id: Id::new(),
                    name,
                })
                .collect(),
        }
    }
}

const SHARE_CODE_LENGTH: usize = 8;

fn random_share_code() -> String {
    Alphanumeric
        .sample_string(&mut rand::thread_rng(), SHARE_CODE_LENGTH)
        .to_lowercase()
}

/// Example data for tests.
#[cfg(test)]
mod examples {
    use super::*;

    impl ElectionCore {
        pub fn example() -> Self {
            ElectionCore::new(
                Id::new(),
                ElectionSpec {
                    title: "Student Council 2026".to_string(),
                    description: "Annual student council election".to_string(),
                    schedule: ScheduleSpec::default(),
                    auto_transition: false,
                    require_location: false,
                    allow_vote_update: false,
                    security_level: SecurityLevel::Standard,
                    positions: vec![
                        PositionSpec {
                            name: "President".to_string(),
                            candidates: vec!["Alice".to_string(), "Bob".to_string()],
                        },
                        PositionSpec {
                            name: "Treasurer".to_string(),
                            candidates: vec!["Carol".to_string(), "Dan".to_string()],
                        },
                    ],
                    custom_fields: vec![],
                },
            )
        }
    }
}

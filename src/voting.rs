//! Registration, verification, and ballot casting.
//!
//! The pure checks (ballot validation, region matching) live here as free
//! functions so they can be tested without a database; the coordinators
//! around them do the reads and transactional writes.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use log::{debug, info};
use mongodb::{bson::doc, bson::to_bson, Client};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geo::is_in_region;
use crate::model::{
    election::Election,
    mongodb::{Coll, Id},
    region::Region,
    vote::{BallotSelection, NewVote},
    voter::{fingerprint_hmac, NewVoter, Verification, Voter},
};
use crate::phase::Phase;
use crate::Config;

/// A voter-submitted registration.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationForm {
    pub email: String,
    /// Opaque device fingerprint; required above casual security.
    pub fingerprint: Option<String>,
    pub location: Option<Coordinate>,
    #[serde(default)]
    pub field_values: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

/// What a successful registration tells the client.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationOutcome {
    pub voter_id: Id,
    pub region_id: Option<Id>,
}

/// What a successful cast tells the client.
#[derive(Debug, Clone, Serialize)]
pub struct CastOutcome {
    /// Whether this cast replaced an earlier ballot.
    pub updated: bool,
    pub votes_cast: usize,
}

/// Check a submitted ballot against the election's positions. Rejects an
/// empty ballot, unknown position or candidate ids, candidates standing for
/// a different position, and repeated positions; the error names the first
/// offending id.
pub fn validate_ballot(election: &Election, selections: &[BallotSelection]) -> Result<()> {
    if selections.is_empty() {
        return Err(Error::ballot("Ballot contains no selections"));
    }
    let mut seen = HashSet::new();
    for selection in selections {
        let position = election
            .position(selection.position)
            .ok_or_else(|| Error::ballot(format!("Unknown position {}", selection.position)))?;
        if position.candidate(selection.candidate).is_none() {
            return Err(Error::ballot(format!(
                "Candidate {} is not standing for position {}",
                selection.candidate, selection.position
            )));
        }
        if !seen.insert(selection.position) {
            return Err(Error::ballot(format!(
                "Multiple selections for position {}",
                selection.position
            )));
        }
    }
    Ok(())
}

/// The first region (in stored order) whose buffered boundary contains the
/// coordinate.
pub fn eligible_region(lat: f64, lng: f64, regions: &[Region]) -> Option<&Region> {
    regions
        .iter()
        .find(|region| is_in_region(lat, lng, &region.geometry, region.buffer_meters))
}

/// Register a voter for an election.
///
/// Checks run in a fixed order so the client always sees the most
/// fundamental failure first: phase, duplicate email, device, location,
/// then custom fields.
pub async fn register_voter(
    election: &Election,
    form: RegistrationForm,
    config: &Config,
    voters: &Coll<Voter>,
    new_voters: &Coll<NewVoter>,
    regions: &Coll<Region>,
    now: DateTime<Utc>,
) -> Result<RegistrationOutcome> {
    if election.phase_at(now) != Phase::Registration {
        return Err(Error::phase("Registration is not open"));
    }

    let email = form.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(Error::bad_request("A valid email address is required"));
    }

    let existing = voters
        .find_one(
            doc! {"election_id": election.id, "email": &email},
            None,
        )
        .await?;
    if let Some(voter) = existing {
        return Err(Error::AlreadyRegistered { voter_id: voter.id });
    }

    // One registration per device above casual security.
    let device_hmac = if election.security_level.checks_fingerprint() {
        let fingerprint = form
            .fingerprint
            .as_deref()
            .filter(|f| !f.trim().is_empty())
            .ok_or_else(|| Error::eligibility("A device fingerprint is required"))?;
        let hmac = fingerprint_hmac(fingerprint, config);
        let device_used = voters
            .find_one(
                doc! {
                    "election_id": election.id,
                    "fingerprint_hmac": to_bson(&hmac)?,
                },
                None,
            )
            .await?;
        if device_used.is_some() {
            return Err(Error::eligibility(
                "This device has already been used to register",
            ));
        }
        Some(hmac)
    } else {
        None
    };

    // Geofence check. Eligibility requires a match, so an election that
    // demands location but has no regions defined admits nobody until the
    // organizer draws one.
    let mut region_id = None;
    let mut location = None;
    if election.require_location {
        let coordinate = form
            .location
            .ok_or_else(|| Error::eligibility("A location is required to register"))?;
        let mut cursor = regions.find(doc! {"election_id": election.id}, None).await?;
        let mut election_regions = Vec::new();
        while cursor.advance().await? {
            election_regions.push(cursor.deserialize_current()?);
        }
        let matched = eligible_region(coordinate.lat, coordinate.lng, &election_regions)
            .ok_or_else(|| Error::eligibility("Your location is outside every eligible region"))?;
        region_id = Some(matched.id);
        location = Some(coordinate);
    }

    for field in &election.custom_fields {
        if field.required {
            let blank = form
                .field_values
                .get(&field.name)
                .map_or(true, |value| value.trim().is_empty());
            if blank {
                return Err(Error::eligibility(format!(
                    "The field '{}' is required",
                    field.name
                )));
            }
        }
    }

    let verification = Verification::new(now + config.verification_ttl());
    debug!(
        "Verification code for '{email}' in election {}: {}",
        election.id, verification.code
    );

    let voter = NewVoter {
        election_id: election.id,
        email: email.clone(),
        email_verified: false,
        verification: Some(verification),
        region_id,
        fingerprint_hmac: device_hmac,
        location_lat: location.map(|c| c.lat),
        location_lng: location.map(|c| c.lng),
        field_values: form.field_values,
    };
    let voter_id: Id = new_voters
        .insert_one(&voter, None)
        .await?
        .inserted_id
        .as_object_id()
        .ok_or_else(|| Error::bad_request("Invalid voter ID"))?
        .into();

    // Delivery is fire-and-forget; a voter who never receives the code
    // simply re-registers after the challenge expires.
    info!("Sending verification email to '{email}' for voter {voter_id}");

    Ok(RegistrationOutcome { voter_id, region_id })
}

/// Confirm a voter's email with the code they were sent. Idempotent for an
/// already-verified voter.
pub async fn verify_voter(
    election: &Election,
    voter_id: Id,
    submitted_code: &str,
    voters: &Coll<Voter>,
    now: DateTime<Utc>,
) -> Result<()> {
    let voter = voters
        .find_one(doc! {"_id": *voter_id, "election_id": election.id}, None)
        .await?
        .ok_or_else(|| Error::not_found(format!("Voter {voter_id}")))?;

    if voter.email_verified {
        return Ok(());
    }

    let verification = voter
        .verification
        .as_ref()
        .ok_or_else(|| Error::bad_request("No verification is pending for this voter"))?;
    if verification.expired(now) {
        return Err(Error::bad_request(
            "The verification code has expired; please register again",
        ));
    }
    if !verification.code.matches(submitted_code) {
        return Err(Error::bad_request("Incorrect verification code"));
    }

    voters
        .update_one(
            voter.id.as_doc(),
            doc! {
                "$set": {"email_verified": true},
                "$unset": {"verification": ""},
            },
            None,
        )
        .await?;
    info!("Voter {} verified for election {}", voter.id, election.id);
    Ok(())
}

/// The storage seam ballot casting runs against.
#[rocket::async_trait]
pub trait VotingStore {
    async fn find_voter(&self, election_id: Id, voter_id: Id) -> Result<Option<Voter>>;
    async fn current_ballot_size(&self, election_id: Id, voter_id: Id) -> Result<u64>;
    /// Replace the voter's ballot with `votes` as one atomic unit: a
    /// failure must leave the previous ballot intact, and no reader may
    /// observe a partially replaced state.
    async fn replace_ballot(
        &self,
        election_id: Id,
        voter_id: Id,
        votes: &[NewVote],
    ) -> Result<()>;
}

/// Production store: one MongoDB transaction per replacement. If the
/// commit fails the session drop aborts the transaction and the old
/// ballot survives untouched.
pub struct MongoVotingStore<'a> {
    pub client: &'a Client,
    pub voters: &'a Coll<Voter>,
    pub votes: &'a Coll<NewVote>,
}

#[rocket::async_trait]
impl VotingStore for MongoVotingStore<'_> {
    async fn find_voter(&self, election_id: Id, voter_id: Id) -> Result<Option<Voter>> {
        Ok(self
            .voters
            .find_one(doc! {"_id": *voter_id, "election_id": election_id}, None)
            .await?)
    }

    async fn current_ballot_size(&self, election_id: Id, voter_id: Id) -> Result<u64> {
        Ok(self
            .votes
            .count_documents(
                doc! {"election_id": election_id, "voter_id": *voter_id},
                None,
            )
            .await?)
    }

    async fn replace_ballot(
        &self,
        election_id: Id,
        voter_id: Id,
        votes: &[NewVote],
    ) -> Result<()> {
        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;
        self.votes
            .delete_many_with_session(
                doc! {"election_id": election_id, "voter_id": *voter_id},
                None,
                &mut session,
            )
            .await?;
        self.votes
            .insert_many_with_session(votes, None, &mut session)
            .await?;
        session.commit_transaction().await?;
        Ok(())
    }
}

/// Cast (or, where allowed, replace) a voter's ballot.
///
/// Checks run in a fixed order: voting phase, then voter resolution and
/// verification, then ballot validation, then the update gate. Nothing
/// touches the store before the phase gate passes.
pub async fn cast_ballot(
    election: &Election,
    voter_id: Id,
    selections: &[BallotSelection],
    store: &(impl VotingStore + Sync),
    now: DateTime<Utc>,
) -> Result<CastOutcome> {
    if election.phase_at(now) != Phase::Voting {
        return Err(Error::phase("Voting is not open"));
    }
    let voter = store
        .find_voter(election.id, voter_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("Voter {voter_id}")))?;
    if !voter.email_verified {
        return Err(Error::eligibility("Your email has not been verified"));
    }
    validate_ballot(election, selections)?;

    let existing = store.current_ballot_size(election.id, voter.id).await?;
    if existing > 0 && !election.allow_vote_update {
        return Err(Error::VoteUpdateForbidden);
    }

    let new_votes: Vec<NewVote> = selections
        .iter()
        .map(|selection| NewVote {
            election_id: election.id,
            voter_id: voter.id,
            position_id: selection.position,
            candidate_id: selection.candidate,
            cast_at: now,
        })
        .collect();
    store
        .replace_ballot(election.id, voter.id, &new_votes)
        .await?;

    let updated = existing > 0;
    info!(
        "Voter {} {} a ballot of {} selections in election {}",
        voter.id,
        if updated { "replaced" } else { "cast" },
        new_votes.len(),
        election.id
    );
    Ok(CastOutcome {
        updated,
        votes_cast: new_votes.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{RegionGeometry, EARTH_RADIUS_METERS};
    use crate::model::election::ElectionCore;
    use crate::model::region::RegionCore;

    const METERS_PER_DEGREE: f64 = EARTH_RADIUS_METERS * std::f64::consts::PI / 180.0;

    fn election() -> Election {
        Election {
            id: Id::new(),
            election: ElectionCore::example(),
        }
    }

    fn selection(position: Id, candidate: Id) -> BallotSelection {
        BallotSelection {
            position,
            candidate,
        }
    }

    #[test]
    fn full_ballot_is_valid() {
        let election = election();
        let selections: Vec<_> = election
            .positions
            .iter()
            .map(|p| selection(p.id, p.candidates[0].id))
            .collect();
        assert!(validate_ballot(&election, &selections).is_ok());
    }

    #[test]
    fn partial_ballot_is_valid() {
        // Abstaining from a position is allowed.
        let election = election();
        let president = &election.positions[0];
        let selections = vec![selection(president.id, president.candidates[1].id)];
        assert!(validate_ballot(&election, &selections).is_ok());
    }

    #[test]
    fn empty_ballot_is_rejected() {
        let election = election();
        assert!(matches!(
            validate_ballot(&election, &[]),
            Err(Error::InvalidBallot(_))
        ));
    }

    #[test]
    fn unknown_position_is_rejected() {
        let election = election();
        let candidate = election.positions[0].candidates[0].id;
        let err = validate_ballot(&election, &[selection(Id::new(), candidate)]).unwrap_err();
        assert!(matches!(err, Error::InvalidBallot(msg) if msg.contains("position")));
    }

    #[test]
    fn candidate_from_another_position_is_rejected() {
        let election = election();
        let president = election.positions[0].id;
        let treasurer_candidate = election.positions[1].candidates[0].id;
        let err =
            validate_ballot(&election, &[selection(president, treasurer_candidate)]).unwrap_err();
        assert!(matches!(err, Error::InvalidBallot(msg) if msg.contains("not standing")));
    }

    #[test]
    fn duplicate_position_is_rejected() {
        let election = election();
        let president = &election.positions[0];
        let selections = vec![
            selection(president.id, president.candidates[0].id),
            selection(president.id, president.candidates[1].id),
        ];
        let err = validate_ballot(&election, &selections).unwrap_err();
        assert!(matches!(err, Error::InvalidBallot(msg) if msg.contains("Multiple")));
    }

    fn region(name: &str, geometry: RegionGeometry, buffer_meters: f64) -> Region {
        Region {
            id: Id::new(),
            region: RegionCore {
                election_id: Id::new(),
                name: name.to_string(),
                geometry,
                buffer_meters,
            },
        }
    }

    #[test]
    fn first_matching_region_wins() {
        let size = 1000.0 / METERS_PER_DEGREE;
        let inner = region(
            "inner",
            RegionGeometry::Circle {
                center: [0.0, 0.0],
                radius_meters: 500.0,
            },
            0.0,
        );
        let outer = region(
            "outer",
            RegionGeometry::Rectangle {
                ring: vec![
                    [-size, -size],
                    [size, -size],
                    [size, size],
                    [-size, size],
                    [-size, -size],
                ],
            },
            0.0,
        );
        let regions = vec![inner, outer];
        let matched = eligible_region(0.0, 0.0, &regions).unwrap();
        assert_eq!(matched.name, "inner");

        // Outside the circle but inside the rectangle.
        let matched = eligible_region(0.0, 800.0 / METERS_PER_DEGREE, &regions).unwrap();
        assert_eq!(matched.name, "outer");

        assert!(eligible_region(0.0, 5000.0 / METERS_PER_DEGREE, &regions).is_none());
    }

    #[test]
    fn buffered_campus_circle() {
        // A 500m campus circle with a 20m GPS tolerance: 480m out is
        // eligible, 530m out is not.
        let campus = region(
            "campus",
            RegionGeometry::Circle {
                center: [73.0479, 33.6844],
                radius_meters: 500.0,
            },
            20.0,
        );
        let regions = vec![campus];
        let north = |meters: f64| 33.6844 + meters / METERS_PER_DEGREE;
        assert!(eligible_region(north(480.0), 73.0479, &regions).is_some());
        assert!(eligible_region(north(530.0), 73.0479, &regions).is_none());
    }

    #[test]
    fn each_region_uses_its_own_buffer() {
        let circle = |buffer| {
            region(
                "r",
                RegionGeometry::Circle {
                    center: [0.0, 0.0],
                    radius_meters: 100.0,
                },
                buffer,
            )
        };
        let lat = 130.0 / METERS_PER_DEGREE;
        assert!(eligible_region(lat, 0.0, &[circle(50.0)]).is_some());
        assert!(eligible_region(lat, 0.0, &[circle(0.0)]).is_none());
    }

    #[test]
    fn no_regions_means_no_match() {
        // A location-required election without regions admits nobody.
        assert!(eligible_region(33.6844, 73.0479, &[]).is_none());
    }

    use std::sync::Mutex;

    use crate::model::election::ElectionStatus;
    use crate::model::voter::VoterCore;

    /// In-memory store mirroring the transactional guarantees: replacement
    /// swaps the whole ballot under one lock, or fails without touching it.
    struct MemoryStore {
        voter: Option<Voter>,
        ballot: Mutex<Vec<NewVote>>,
        fail_replace: bool,
    }

    impl MemoryStore {
        fn with_voter(voter: Voter) -> Self {
            Self {
                voter: Some(voter),
                ballot: Mutex::new(Vec::new()),
                fail_replace: false,
            }
        }

        fn ballot(&self) -> Vec<NewVote> {
            self.ballot.lock().unwrap().clone()
        }
    }

    #[rocket::async_trait]
    impl VotingStore for MemoryStore {
        async fn find_voter(&self, election_id: Id, voter_id: Id) -> Result<Option<Voter>> {
            Ok(self
                .voter
                .clone()
                .filter(|v| v.id == voter_id && v.election_id == election_id))
        }

        async fn current_ballot_size(&self, election_id: Id, voter_id: Id) -> Result<u64> {
            Ok(self
                .ballot
                .lock()
                .unwrap()
                .iter()
                .filter(|v| v.election_id == election_id && v.voter_id == voter_id)
                .count() as u64)
        }

        async fn replace_ballot(
            &self,
            election_id: Id,
            voter_id: Id,
            votes: &[NewVote],
        ) -> Result<()> {
            if self.fail_replace {
                return Err(Error::bad_request("Replacement failed"));
            }
            let mut ballot = self.ballot.lock().unwrap();
            ballot.retain(|v| !(v.election_id == election_id && v.voter_id == voter_id));
            ballot.extend_from_slice(votes);
            Ok(())
        }
    }

    /// Store that fails the test if casting reaches it at all.
    struct UntouchableStore;

    #[rocket::async_trait]
    impl VotingStore for UntouchableStore {
        async fn find_voter(&self, _: Id, _: Id) -> Result<Option<Voter>> {
            panic!("store accessed before the phase gate");
        }

        async fn current_ballot_size(&self, _: Id, _: Id) -> Result<u64> {
            panic!("store accessed before the phase gate");
        }

        async fn replace_ballot(&self, _: Id, _: Id, _: &[NewVote]) -> Result<()> {
            panic!("store accessed before the phase gate");
        }
    }

    /// A manually activated election currently in the voting phase.
    fn voting_election(allow_vote_update: bool) -> Election {
        let mut election = election();
        election.election.status = ElectionStatus::Voting;
        election.election.allow_vote_update = allow_vote_update;
        election
    }

    fn verified_voter(election: &Election) -> Voter {
        Voter {
            id: Id::new(),
            voter: VoterCore {
                election_id: election.id,
                email: "voter@example.com".to_string(),
                email_verified: true,
                verification: None,
                region_id: None,
                fingerprint_hmac: None,
                location_lat: None,
                location_lng: None,
                field_values: HashMap::new(),
            },
        }
    }

    fn full_ballot(election: &Election) -> Vec<BallotSelection> {
        election
            .positions
            .iter()
            .map(|p| selection(p.id, p.candidates[0].id))
            .collect()
    }

    #[rocket::async_test]
    async fn closed_election_rejects_cast_before_any_lookup() {
        let mut election = election();
        election.election.status = ElectionStatus::Closed;
        let err = cast_ballot(&election, Id::new(), &[], &UntouchableStore, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PhaseViolation(_)));
    }

    #[rocket::async_test]
    async fn first_cast_records_the_ballot() {
        let election = voting_election(false);
        let voter = verified_voter(&election);
        let voter_id = voter.id;
        let store = MemoryStore::with_voter(voter);

        let selections = full_ballot(&election);
        let outcome = cast_ballot(&election, voter_id, &selections, &store, Utc::now())
            .await
            .unwrap();
        assert!(!outcome.updated);
        assert_eq!(outcome.votes_cast, 2);
        assert_eq!(store.ballot().len(), 2);
    }

    #[rocket::async_test]
    async fn recast_replaces_the_whole_ballot() {
        let election = voting_election(true);
        let voter = verified_voter(&election);
        let voter_id = voter.id;
        let store = MemoryStore::with_voter(voter);

        let first = full_ballot(&election);
        cast_ballot(&election, voter_id, &first, &store, Utc::now())
            .await
            .unwrap();

        // Recast for a single position: the old two-vote ballot must be
        // gone wholesale, not merged.
        let president = &election.positions[0];
        let second = vec![selection(president.id, president.candidates[1].id)];
        let outcome = cast_ballot(&election, voter_id, &second, &store, Utc::now())
            .await
            .unwrap();
        assert!(outcome.updated);
        assert_eq!(outcome.votes_cast, 1);

        let ballot = store.ballot();
        assert_eq!(ballot.len(), 1);
        assert_eq!(ballot[0].candidate_id, president.candidates[1].id);
    }

    #[rocket::async_test]
    async fn failed_replacement_leaves_previous_ballot_intact() {
        let election = voting_election(true);
        let voter = verified_voter(&election);
        let voter_id = voter.id;
        let mut store = MemoryStore::with_voter(voter);

        let first = full_ballot(&election);
        cast_ballot(&election, voter_id, &first, &store, Utc::now())
            .await
            .unwrap();
        let before = store.ballot();

        store.fail_replace = true;
        let president = &election.positions[0];
        let second = vec![selection(president.id, president.candidates[1].id)];
        let err = cast_ballot(&election, voter_id, &second, &store, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        assert_eq!(store.ballot(), before);
    }

    #[rocket::async_test]
    async fn recast_forbidden_when_updates_disallowed() {
        let election = voting_election(false);
        let voter = verified_voter(&election);
        let voter_id = voter.id;
        let store = MemoryStore::with_voter(voter);

        let first = full_ballot(&election);
        cast_ballot(&election, voter_id, &first, &store, Utc::now())
            .await
            .unwrap();
        let before = store.ballot();

        let err = cast_ballot(&election, voter_id, &first, &store, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VoteUpdateForbidden));
        assert_eq!(store.ballot(), before);
    }

    #[rocket::async_test]
    async fn unverified_voter_cannot_cast() {
        let election = voting_election(false);
        let mut voter = verified_voter(&election);
        voter.voter.email_verified = false;
        let voter_id = voter.id;
        let store = MemoryStore::with_voter(voter);

        let err = cast_ballot(
            &election,
            voter_id,
            &full_ballot(&election),
            &store,
            Utc::now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Eligibility(_)));
        assert!(store.ballot().is_empty());
    }

    #[rocket::async_test]
    async fn unknown_voter_in_open_election_is_not_found() {
        let election = voting_election(false);
        let voter = verified_voter(&election);
        let store = MemoryStore::with_voter(voter);

        let err = cast_ballot(
            &election,
            Id::new(),
            &full_ballot(&election),
            &store,
            Utc::now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}

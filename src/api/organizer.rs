//! Organizer endpoints: election lifecycle, configuration, tallying.
//!
//! Organizer identity arrives as an upstream-authenticated `x-organizer-id`
//! header; every election operation additionally checks ownership. Each
//! mutation ends by invalidating the election's public status cache entry.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::info;
use mongodb::{
    bson::{doc, from_document, to_bson},
    Client,
};
use rocket::{
    http::Status,
    request::{self, FromRequest, Request},
    serde::json::Json,
    Route, State,
};
use serde::{Deserialize, Serialize};

use crate::api::public::StatusCache;
use crate::error::{Error, Result};
use crate::limiter::{self, ClientIp, RateLimiter};
use crate::model::{
    election::{
        Candidate, Election, ElectionSpec, ElectionStatus, NewElection, Position, PositionSpec,
        Schedule, ScheduleSpec, SecurityLevel,
    },
    mongodb::{Coll, Id},
    region::{NewRegion, Region, RegionSpec},
    vote::Vote,
    voter::Voter,
};
use crate::phase;

pub fn routes() -> Vec<Route> {
    routes![
        create_election,
        my_elections,
        election_detail,
        update_settings,
        advance_status,
        add_position,
        remove_position,
        add_candidate,
        remove_candidate,
        add_region,
        remove_region,
        tally,
        delete_election,
    ]
}

/// An authenticated organizer. Authentication itself happens upstream;
/// this guard only requires that the forwarded identity header is present
/// and well-formed.
pub struct Organizer {
    pub id: Id,
}

pub const ORGANIZER_HEADER: &str = "x-organizer-id";

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Organizer {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        match req.headers().get_one(ORGANIZER_HEADER) {
            Some(raw) => match raw.parse::<Id>() {
                Ok(id) => request::Outcome::Success(Organizer { id }),
                Err(_) => request::Outcome::Failure((Status::Unauthorized, ())),
            },
            None => request::Outcome::Failure((Status::Unauthorized, ())),
        }
    }
}

#[post("/organizer/elections", format = "json", data = "<spec>")]
async fn create_election(
    organizer: Organizer,
    spec: Json<ElectionSpec>,
    ip: ClientIp,
    limiter: &State<RateLimiter>,
    new_elections: Coll<NewElection>,
) -> Result<Json<Election>> {
    super::rate_limit(limiter, limiter::ORGANIZER_BUCKET, &ip).await?;
    let spec = spec.into_inner();

    phase::validate_schedule(&spec.schedule.into())?;
    if spec.positions.is_empty() {
        return Err(Error::bad_request("An election needs at least one position"));
    }
    if spec.positions.iter().any(|p| p.candidates.is_empty()) {
        return Err(Error::bad_request("Every position needs at least one candidate"));
    }

    let election = NewElection::new(organizer.id, spec);
    let id: Id = new_elections
        .insert_one(&election, None)
        .await?
        .inserted_id
        .as_object_id()
        .ok_or_else(|| Error::bad_request("Invalid election ID"))?
        .into();
    info!("Organizer {} created election {id}", organizer.id);
    Ok(Json(Election { id, election }))
}

#[get("/organizer/elections")]
async fn my_elections(
    organizer: Organizer,
    elections: Coll<Election>,
) -> Result<Json<Vec<Election>>> {
    let mut cursor = elections
        .find(doc! {"organizer_id": organizer.id}, None)
        .await?;
    let mut owned = Vec::new();
    while cursor.advance().await? {
        owned.push(cursor.deserialize_current()?);
    }
    Ok(Json(owned))
}

#[get("/organizer/elections/<election_id>")]
async fn election_detail(
    organizer: Organizer,
    election_id: Id,
    elections: Coll<Election>,
) -> Result<Json<Election>> {
    let election = owned_election(&organizer, election_id, &elections).await?;
    Ok(Json(election))
}

/// Partial settings update; absent fields are left untouched.
#[derive(Debug, Deserialize)]
struct SettingsUpdate {
    title: Option<String>,
    description: Option<String>,
    schedule: Option<ScheduleSpec>,
    auto_transition: Option<bool>,
    require_location: Option<bool>,
    allow_vote_update: Option<bool>,
    security_level: Option<SecurityLevel>,
}

#[put("/organizer/elections/<election_id>/settings", format = "json", data = "<update>")]
async fn update_settings(
    organizer: Organizer,
    election_id: Id,
    update: Json<SettingsUpdate>,
    ip: ClientIp,
    limiter: &State<RateLimiter>,
    cache: &State<StatusCache>,
    elections: Coll<Election>,
    voters: Coll<Voter>,
    votes: Coll<Vote>,
) -> Result<Json<Election>> {
    super::rate_limit(limiter, limiter::ORGANIZER_BUCKET, &ip).await?;
    let election = owned_election(&organizer, election_id, &elections).await?;
    let update = update.into_inner();
    let now = Utc::now();

    let voter_count = voters
        .count_documents(doc! {"election_id": election.id}, None)
        .await?;
    let vote_count = votes
        .count_documents(doc! {"election_id": election.id}, None)
        .await?;

    let mut updated = election.clone();
    if let Some(title) = update.title {
        updated.title = title;
    }
    if let Some(description) = update.description {
        updated.description = description;
    }

    // Each gated field is only checked when it actually changes, so an
    // update echoing current values back never fails spuriously.
    if let Some(schedule) = update.schedule.map(Schedule::from) {
        if schedule != election.schedule {
            ensure_schedule_mutable(&election, now)?;
        }
        phase::validate_schedule(&schedule)?;
        updated.schedule = schedule;
    }
    if let Some(auto_transition) = update.auto_transition {
        if auto_transition != election.auto_transition {
            ensure_schedule_mutable(&election, now)?;
        }
        updated.auto_transition = auto_transition;
    }
    if let Some(security_level) = update.security_level {
        if security_level != election.security_level && !phase::security_mutable(voter_count) {
            return Err(Error::phase(
                "Security level cannot change once voters have registered",
            ));
        }
        updated.security_level = security_level;
    }
    if let Some(require_location) = update.require_location {
        if require_location != election.require_location && !phase::security_mutable(voter_count) {
            return Err(Error::phase(
                "Location requirement cannot change once voters have registered",
            ));
        }
        updated.require_location = require_location;
    }
    if let Some(allow_vote_update) = update.allow_vote_update {
        if allow_vote_update != election.allow_vote_update
            && !phase::vote_update_flag_mutable(vote_count)
        {
            return Err(Error::phase(
                "Vote update policy cannot change once votes have been cast",
            ));
        }
        updated.allow_vote_update = allow_vote_update;
    }

    elections
        .replace_one(election.id.as_doc(), &updated, None)
        .await?;
    cache.invalidate(&election.share_code).await;
    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
struct StatusUpdate {
    status: ElectionStatus,
}

/// Manually advance the organizer-set status. Transitions only ever move
/// forward; going back would re-open a window voters have already seen
/// close.
#[post("/organizer/elections/<election_id>/status", format = "json", data = "<update>")]
async fn advance_status(
    organizer: Organizer,
    election_id: Id,
    update: Json<StatusUpdate>,
    ip: ClientIp,
    limiter: &State<RateLimiter>,
    cache: &State<StatusCache>,
    elections: Coll<Election>,
) -> Result<()> {
    super::rate_limit(limiter, limiter::ORGANIZER_BUCKET, &ip).await?;
    let election = owned_election(&organizer, election_id, &elections).await?;
    let status = update.status;

    if status <= election.status {
        return Err(Error::bad_request(format!(
            "Status can only advance (currently {:?})",
            election.status
        )));
    }
    elections
        .update_one(election.id.as_doc(), doc! {"$set": {"status": status}}, None)
        .await?;
    cache.invalidate(&election.share_code).await;
    info!(
        "Election {} advanced to {status:?} by organizer {}",
        election.id, organizer.id
    );
    Ok(())
}

#[post("/organizer/elections/<election_id>/positions", format = "json", data = "<spec>")]
async fn add_position(
    organizer: Organizer,
    election_id: Id,
    spec: Json<PositionSpec>,
    ip: ClientIp,
    limiter: &State<RateLimiter>,
    cache: &State<StatusCache>,
    elections: Coll<Election>,
    votes: Coll<Vote>,
) -> Result<Json<Position>> {
    super::rate_limit(limiter, limiter::ORGANIZER_BUCKET, &ip).await?;
    let election = owned_election(&organizer, election_id, &elections).await?;

    let vote_count = votes
        .count_documents(doc! {"election_id": election.id}, None)
        .await?;
    if !phase::positions_editable(vote_count) {
        return Err(Error::phase(
            "Positions cannot change once votes have been cast",
        ));
    }
    let spec = spec.into_inner();
    if spec.candidates.is_empty() {
        return Err(Error::bad_request("Every position needs at least one candidate"));
    }

    let position: Position = spec.into();
    elections
        .update_one(
            election.id.as_doc(),
            doc! {"$push": {"positions": to_bson(&position)?}},
            None,
        )
        .await?;
    cache.invalidate(&election.share_code).await;
    Ok(Json(position))
}

#[delete("/organizer/elections/<election_id>/positions/<position_id>")]
async fn remove_position(
    organizer: Organizer,
    election_id: Id,
    position_id: Id,
    ip: ClientIp,
    limiter: &State<RateLimiter>,
    cache: &State<StatusCache>,
    elections: Coll<Election>,
    voters: Coll<Voter>,
) -> Result<()> {
    super::rate_limit(limiter, limiter::ORGANIZER_BUCKET, &ip).await?;
    let election = owned_election(&organizer, election_id, &elections).await?;

    let voter_count = voters
        .count_documents(doc! {"election_id": election.id}, None)
        .await?;
    if !phase::positions_removable(voter_count) {
        return Err(Error::phase(
            "Positions cannot be removed once voters have registered",
        ));
    }
    if election.position(position_id).is_none() {
        return Err(Error::not_found(format!("Position {position_id}")));
    }

    elections
        .update_one(
            election.id.as_doc(),
            doc! {"$pull": {"positions": {"id": *position_id}}},
            None,
        )
        .await?;
    cache.invalidate(&election.share_code).await;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct CandidateSpec {
    name: String,
}

#[post(
    "/organizer/elections/<election_id>/positions/<position_id>/candidates",
    format = "json",
    data = "<spec>"
)]
async fn add_candidate(
    organizer: Organizer,
    election_id: Id,
    position_id: Id,
    spec: Json<CandidateSpec>,
    ip: ClientIp,
    limiter: &State<RateLimiter>,
    cache: &State<StatusCache>,
    elections: Coll<Election>,
    votes: Coll<Vote>,
) -> Result<Json<Candidate>> {
    super::rate_limit(limiter, limiter::ORGANIZER_BUCKET, &ip).await?;
    let election = owned_election(&organizer, election_id, &elections).await?;

    let vote_count = votes
        .count_documents(doc! {"election_id": election.id}, None)
        .await?;
    if !phase::positions_editable(vote_count) {
        return Err(Error::phase(
            "Candidates cannot change once votes have been cast",
        ));
    }
    if election.position(position_id).is_none() {
        return Err(Error::not_found(format!("Position {position_id}")));
    }

    let candidate = Candidate {
        id: Id::new(),
        name: spec.into_inner().name,
    };
    elections
        .update_one(
            doc! {"_id": *election.id, "positions.id": *position_id},
            doc! {"$push": {"positions.$.candidates": to_bson(&candidate)?}},
            None,
        )
        .await?;
    cache.invalidate(&election.share_code).await;
    Ok(Json(candidate))
}

#[delete("/organizer/elections/<election_id>/positions/<position_id>/candidates/<candidate_id>")]
async fn remove_candidate(
    organizer: Organizer,
    election_id: Id,
    position_id: Id,
    candidate_id: Id,
    ip: ClientIp,
    limiter: &State<RateLimiter>,
    cache: &State<StatusCache>,
    elections: Coll<Election>,
    voters: Coll<Voter>,
) -> Result<()> {
    super::rate_limit(limiter, limiter::ORGANIZER_BUCKET, &ip).await?;
    let election = owned_election(&organizer, election_id, &elections).await?;

    let voter_count = voters
        .count_documents(doc! {"election_id": election.id}, None)
        .await?;
    if !phase::positions_removable(voter_count) {
        return Err(Error::phase(
            "Candidates cannot be removed once voters have registered",
        ));
    }
    let position = election
        .position(position_id)
        .ok_or_else(|| Error::not_found(format!("Position {position_id}")))?;
    if position.candidate(candidate_id).is_none() {
        return Err(Error::not_found(format!("Candidate {candidate_id}")));
    }
    if position.candidates.len() == 1 {
        return Err(Error::bad_request(
            "Every position needs at least one candidate",
        ));
    }

    elections
        .update_one(
            doc! {"_id": *election.id, "positions.id": *position_id},
            doc! {"$pull": {"positions.$.candidates": {"id": *candidate_id}}},
            None,
        )
        .await?;
    cache.invalidate(&election.share_code).await;
    Ok(())
}

#[post("/organizer/elections/<election_id>/regions", format = "json", data = "<spec>")]
async fn add_region(
    organizer: Organizer,
    election_id: Id,
    spec: Json<RegionSpec>,
    ip: ClientIp,
    limiter: &State<RateLimiter>,
    cache: &State<StatusCache>,
    elections: Coll<Election>,
    votes: Coll<Vote>,
    new_regions: Coll<NewRegion>,
) -> Result<Json<Region>> {
    super::rate_limit(limiter, limiter::ORGANIZER_BUCKET, &ip).await?;
    let election = owned_election(&organizer, election_id, &elections).await?;

    let vote_count = votes
        .count_documents(doc! {"election_id": election.id}, None)
        .await?;
    if !phase::regions_editable(vote_count) {
        return Err(Error::phase(
            "Regions cannot change once votes have been cast",
        ));
    }

    let region = spec
        .into_inner()
        .into_region(election.id)
        .map_err(Error::bad_request)?;
    let id: Id = new_regions
        .insert_one(&region, None)
        .await?
        .inserted_id
        .as_object_id()
        .ok_or_else(|| Error::bad_request("Invalid region ID"))?
        .into();
    cache.invalidate(&election.share_code).await;
    Ok(Json(Region { id, region }))
}

#[delete("/organizer/elections/<election_id>/regions/<region_id>")]
async fn remove_region(
    organizer: Organizer,
    election_id: Id,
    region_id: Id,
    ip: ClientIp,
    limiter: &State<RateLimiter>,
    cache: &State<StatusCache>,
    elections: Coll<Election>,
    voters: Coll<Voter>,
    regions: Coll<Region>,
) -> Result<()> {
    super::rate_limit(limiter, limiter::ORGANIZER_BUCKET, &ip).await?;
    let election = owned_election(&organizer, election_id, &elections).await?;

    let assigned = voters
        .count_documents(
            doc! {"election_id": election.id, "region_id": *region_id},
            None,
        )
        .await?;
    if !phase::region_removable(assigned) {
        return Err(Error::phase(
            "A region with assigned voters cannot be removed",
        ));
    }

    let deleted = regions
        .delete_one(
            doc! {"_id": *region_id, "election_id": election.id},
            None,
        )
        .await?;
    if deleted.deleted_count == 0 {
        return Err(Error::not_found(format!("Region {region_id}")));
    }
    cache.invalidate(&election.share_code).await;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct Tally {
    pub voters: u64,
    /// Distinct voters with a ballot on record.
    pub ballots: u64,
    pub positions: Vec<PositionTally>,
    pub regions: Vec<RegionTally>,
}

#[derive(Debug, Serialize)]
pub struct PositionTally {
    pub position_id: Id,
    pub name: String,
    pub candidates: Vec<CandidateTally>,
}

#[derive(Debug, Serialize)]
pub struct CandidateTally {
    pub candidate_id: Id,
    pub name: String,
    pub votes: u64,
}

#[derive(Debug, Serialize)]
pub struct RegionTally {
    pub region_id: Option<Id>,
    pub name: String,
    pub ballots: u64,
}

/// One `$group` row of the per-candidate count pipeline.
#[derive(Debug, Deserialize)]
struct CandidateCount {
    #[serde(rename = "_id")]
    key: CandidateKey,
    count: u64,
}

#[derive(Debug, Deserialize)]
struct CandidateKey {
    position: Id,
    candidate: Id,
}

/// One `$group` row of the per-region ballot count pipeline.
#[derive(Debug, Deserialize)]
struct RegionCount {
    #[serde(rename = "_id")]
    region_id: Option<Id>,
    count: u64,
}

/// Current standings: votes per candidate per position (zero-filled from
/// the election definition) and ballots per region. Counting is pushed
/// down to the database; candidates with no votes still appear.
#[get("/organizer/elections/<election_id>/tally")]
async fn tally(
    organizer: Organizer,
    election_id: Id,
    elections: Coll<Election>,
    voters: Coll<Voter>,
    votes: Coll<Vote>,
    regions: Coll<Region>,
) -> Result<Json<Tally>> {
    let election = owned_election(&organizer, election_id, &elections).await?;

    let candidate_pipeline = vec![
        doc! {"$match": {"election_id": election.id}},
        doc! {"$group": {
            "_id": {"position": "$position_id", "candidate": "$candidate_id"},
            "count": {"$sum": 1},
        }},
    ];
    let mut counts: HashMap<(Id, Id), u64> = HashMap::new();
    let mut cursor = votes.aggregate(candidate_pipeline, None).await?;
    while cursor.advance().await? {
        let row: CandidateCount = from_document(cursor.deserialize_current()?)?;
        counts.insert((row.key.position, row.key.candidate), row.count);
    }

    let positions = election
        .positions
        .iter()
        .map(|position| PositionTally {
            position_id: position.id,
            name: position.name.clone(),
            candidates: position
                .candidates
                .iter()
                .map(|candidate| CandidateTally {
                    candidate_id: candidate.id,
                    name: candidate.name.clone(),
                    votes: counts
                        .get(&(position.id, candidate.id))
                        .copied()
                        .unwrap_or(0),
                })
                .collect(),
        })
        .collect();

    // Ballots per region: one row per casting voter, resolved to the
    // region they were assigned at registration.
    let region_pipeline = vec![
        doc! {"$match": {"election_id": election.id}},
        doc! {"$group": {"_id": "$voter_id"}},
        doc! {"$lookup": {
            "from": "voters",
            "localField": "_id",
            "foreignField": "_id",
            "as": "voter",
        }},
        doc! {"$unwind": "$voter"},
        doc! {"$group": {"_id": "$voter.region_id", "count": {"$sum": 1}}},
    ];
    let mut region_ballots: HashMap<Option<Id>, u64> = HashMap::new();
    let mut ballots = 0;
    let mut cursor = votes.aggregate(region_pipeline, None).await?;
    while cursor.advance().await? {
        let row: RegionCount = from_document(cursor.deserialize_current()?)?;
        ballots += row.count;
        region_ballots.insert(row.region_id, row.count);
    }

    let mut region_tallies = Vec::new();
    let mut cursor = regions.find(doc! {"election_id": election.id}, None).await?;
    while cursor.advance().await? {
        let region: Region = cursor.deserialize_current()?;
        region_tallies.push(RegionTally {
            region_id: Some(region.id),
            name: region.name.clone(),
            ballots: region_ballots.get(&Some(region.id)).copied().unwrap_or(0),
        });
    }
    if let Some(unassigned) = region_ballots.get(&None) {
        region_tallies.push(RegionTally {
            region_id: None,
            name: "Unassigned".to_string(),
            ballots: *unassigned,
        });
    }

    let voter_count = voters
        .count_documents(doc! {"election_id": election.id}, None)
        .await?;

    Ok(Json(Tally {
        voters: voter_count,
        ballots,
        positions,
        regions: region_tallies,
    }))
}

/// Delete an election and everything hanging off it. The cascade runs in
/// one transaction so a failure partway leaves the election fully intact.
#[delete("/organizer/elections/<election_id>")]
async fn delete_election(
    organizer: Organizer,
    election_id: Id,
    ip: ClientIp,
    limiter: &State<RateLimiter>,
    cache: &State<StatusCache>,
    client: &State<Client>,
    elections: Coll<Election>,
    voters: Coll<Voter>,
    votes: Coll<Vote>,
    regions: Coll<Region>,
) -> Result<()> {
    super::rate_limit(limiter, limiter::ORGANIZER_BUCKET, &ip).await?;
    let election = owned_election(&organizer, election_id, &elections).await?;
    let scope = doc! {"election_id": election.id};

    let mut session = client.start_session(None).await?;
    session.start_transaction(None).await?;
    votes
        .delete_many_with_session(scope.clone(), None, &mut session)
        .await?;
    voters
        .delete_many_with_session(scope.clone(), None, &mut session)
        .await?;
    regions
        .delete_many_with_session(scope, None, &mut session)
        .await?;
    elections
        .delete_one_with_session(election.id.as_doc(), None, &mut session)
        .await?;
    session.commit_transaction().await?;

    cache.invalidate_prefix(&election.share_code).await;
    info!(
        "Election {} deleted by organizer {}",
        election.id, organizer.id
    );
    Ok(())
}

fn ensure_schedule_mutable(election: &Election, now: DateTime<Utc>) -> Result<()> {
    if phase::schedule_mutable(election.phase_at(now)) {
        Ok(())
    } else {
        Err(Error::phase(
            "The schedule cannot change after the election has closed",
        ))
    }
}

/// Load an election if and only if the caller owns it. Missing and
/// not-owned are indistinguishable to the caller.
async fn owned_election(
    organizer: &Organizer,
    election_id: Id,
    elections: &Coll<Election>,
) -> Result<Election> {
    elections
        .find_one(
            doc! {"_id": *election_id, "organizer_id": organizer.id},
            None,
        )
        .await?
        .ok_or_else(|| Error::not_found(format!("Election {election_id}")))
}

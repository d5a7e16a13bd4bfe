//! The public election status endpoint.

use chrono::{DateTime, Utc};
use mongodb::bson::doc;
use rocket::{serde::json::Json, Route, State};
use serde::Serialize;

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::model::{
    election::{CustomField, Election, Position, SecurityLevel},
    mongodb::{Coll, Id},
};
use crate::phase::Phase;
use crate::Config;

pub fn routes() -> Vec<Route> {
    routes![election_status]
}

/// Cached public views, keyed by share code. Organizer mutations
/// invalidate the affected key, so the TTL only bounds staleness against
/// pure time passing (schedule boundaries crossing).
pub type StatusCache = Cache<ElectionView>;

/// Everything a voter-facing client needs to render an election,
/// including the position and candidate ids ballots refer to.
#[derive(Debug, Clone, Serialize)]
pub struct ElectionView {
    pub id: Id,
    pub title: String,
    pub description: String,
    pub share_code: String,
    pub phase: Phase,
    pub registration_start: Option<DateTime<Utc>>,
    pub registration_end: Option<DateTime<Utc>>,
    pub voting_start: Option<DateTime<Utc>>,
    pub voting_end: Option<DateTime<Utc>>,
    pub require_location: bool,
    pub allow_vote_update: bool,
    pub security_level: SecurityLevel,
    pub positions: Vec<Position>,
    pub custom_fields: Vec<CustomField>,
}

impl ElectionView {
    pub fn new(election: &Election, now: DateTime<Utc>) -> Self {
        Self {
            id: election.id,
            title: election.title.clone(),
            description: election.description.clone(),
            share_code: election.share_code.clone(),
            phase: election.phase_at(now),
            registration_start: election.schedule.registration_start,
            registration_end: election.schedule.registration_end,
            voting_start: election.schedule.voting_start,
            voting_end: election.schedule.voting_end,
            require_location: election.require_location,
            allow_vote_update: election.allow_vote_update,
            security_level: election.security_level,
            positions: election.positions.clone(),
            custom_fields: election.custom_fields.clone(),
        }
    }
}

#[get("/elections/<share_code>")]
async fn election_status(
    share_code: &str,
    elections: Coll<Election>,
    cache: &State<StatusCache>,
    config: &State<Config>,
) -> Result<Json<ElectionView>> {
    let view = cache
        .get_or_load(share_code, config.status_cache_ttl(), || async {
            let election = elections
                .find_one(doc! {"share_code": share_code}, None)
                .await?
                .ok_or_else(|| Error::not_found(format!("Election '{share_code}'")))?;
            let view = ElectionView::new(&election, Utc::now());
            // Drafts are invisible until the organizer publishes.
            if view.phase == Phase::Draft {
                return Err(Error::not_found(format!("Election '{share_code}'")));
            }
            Ok(view)
        })
        .await?;
    Ok(Json(view))
}

//! Voter-facing endpoints: register, verify, cast. All three are
//! rate-limited by client IP.

use chrono::Utc;
use mongodb::{bson::doc, Client};
use rocket::{serde::json::Json, Route, State};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::limiter::{self, ClientIp, RateLimiter};
use crate::model::{
    election::Election,
    mongodb::{Coll, Id},
    region::Region,
    vote::{BallotSelection, NewVote},
    voter::{NewVoter, Voter},
};
use crate::voting::{self, CastOutcome, MongoVotingStore, RegistrationForm, RegistrationOutcome};
use crate::Config;

pub fn routes() -> Vec<Route> {
    routes![register, verify, cast]
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    voter_id: Id,
    code: String,
}

#[derive(Debug, Deserialize)]
struct CastRequest {
    voter_id: Id,
    selections: Vec<BallotSelection>,
}

#[post("/elections/<share_code>/register", format = "json", data = "<form>")]
async fn register(
    share_code: &str,
    form: Json<RegistrationForm>,
    ip: ClientIp,
    limiter: &State<RateLimiter>,
    config: &State<Config>,
    elections: Coll<Election>,
    voters: Coll<Voter>,
    new_voters: Coll<NewVoter>,
    regions: Coll<Region>,
) -> Result<Json<RegistrationOutcome>> {
    super::rate_limit(limiter, limiter::REGISTER_BUCKET, &ip).await?;
    let election = election_by_share_code(share_code, &elections).await?;
    let outcome = voting::register_voter(
        &election,
        form.into_inner(),
        config,
        &voters,
        &new_voters,
        &regions,
        Utc::now(),
    )
    .await?;
    Ok(Json(outcome))
}

#[post("/elections/<share_code>/verify", format = "json", data = "<request>")]
async fn verify(
    share_code: &str,
    request: Json<VerifyRequest>,
    ip: ClientIp,
    limiter: &State<RateLimiter>,
    elections: Coll<Election>,
    voters: Coll<Voter>,
) -> Result<()> {
    super::rate_limit(limiter, limiter::VERIFY_BUCKET, &ip).await?;
    let election = election_by_share_code(share_code, &elections).await?;
    voting::verify_voter(
        &election,
        request.voter_id,
        &request.code,
        &voters,
        Utc::now(),
    )
    .await
}

#[post("/elections/<share_code>/votes", format = "json", data = "<request>")]
async fn cast(
    share_code: &str,
    request: Json<CastRequest>,
    ip: ClientIp,
    limiter: &State<RateLimiter>,
    client: &State<Client>,
    elections: Coll<Election>,
    voters: Coll<Voter>,
    votes: Coll<NewVote>,
) -> Result<Json<CastOutcome>> {
    super::rate_limit(limiter, limiter::CAST_BUCKET, &ip).await?;
    let election = election_by_share_code(share_code, &elections).await?;
    let store = MongoVotingStore {
        client: client.inner(),
        voters: &voters,
        votes: &votes,
    };
    let outcome = voting::cast_ballot(
        &election,
        request.voter_id,
        &request.selections,
        &store,
        Utc::now(),
    )
    .await?;
    Ok(Json(outcome))
}

async fn election_by_share_code(
    share_code: &str,
    elections: &Coll<Election>,
) -> Result<Election> {
    elections
        .find_one(doc! {"share_code": share_code}, None)
        .await?
        .ok_or_else(|| Error::not_found(format!("Election '{share_code}'")))
}

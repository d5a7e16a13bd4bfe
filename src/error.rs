use std::io::Cursor;

use log::warn;
use rocket::{
    http::{ContentType, Status},
    response::Responder,
    serde::json::json,
    Response,
};
use thiserror::Error;

use crate::model::mongodb::Id;

pub type Result<T> = std::result::Result<T, Error>;

/// The request-level error taxonomy. Every variant is fatal to its own
/// request only, and no variant may leave a partial write behind.
#[derive(Debug, Error)]
pub enum Error {
    /// Persistence failure. Transactional work has already been rolled back
    /// by the time this surfaces.
    #[error(transparent)]
    Db(#[from] mongodb::error::Error),
    #[error(transparent)]
    OidParse(#[from] mongodb::bson::oid::Error),
    /// A document that should match our schema did not.
    #[error(transparent)]
    BsonDeserialize(#[from] mongodb::bson::de::Error),
    #[error(transparent)]
    BsonSerialize(#[from] mongodb::bson::ser::Error),
    /// The action is not permitted in the election's current phase.
    #[error("Phase violation: {0}")]
    PhaseViolation(String),
    /// The voter does not satisfy an eligibility requirement; the client may
    /// retry with corrected input.
    #[error("Not eligible: {0}")]
    Eligibility(String),
    /// The submitted ballot references unknown or duplicated ids; indicates
    /// stale or tampered client state.
    #[error("Invalid ballot: {0}")]
    InvalidBallot(String),
    /// The email is already registered for this election. Carries the
    /// existing voter id so the client can resume verification instead of
    /// re-registering.
    #[error("Already registered as voter {voter_id}")]
    AlreadyRegistered { voter_id: Id },
    /// A repeat cast was submitted but the election forbids vote updates.
    #[error("Vote updates are not allowed for this election")]
    VoteUpdateForbidden,
    /// Too many requests from this client; retry after the indicated delay.
    #[error("Rate limit exceeded, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    pub fn phase(msg: impl Into<String>) -> Self {
        Self::PhaseViolation(msg.into())
    }

    pub fn eligibility(msg: impl Into<String>) -> Self {
        Self::Eligibility(msg.into())
    }

    pub fn ballot(msg: impl Into<String>) -> Self {
        Self::InvalidBallot(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(format!("{} not found", msg.into()))
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for Error {
    fn respond_to(self, _: &'r rocket::Request<'_>) -> rocket::response::Result<'o> {
        warn!("{self}");
        match self {
            // Deny with a machine-readable retry hint; the only kind a
            // well-behaved client retries automatically.
            Self::RateLimited { retry_after } => Response::build()
                .status(Status::TooManyRequests)
                .raw_header("Retry-After", retry_after.to_string())
                .ok(),
            // Conflict with a recovery payload: the client should resume
            // verification for the existing voter rather than re-register.
            Self::AlreadyRegistered { voter_id } => {
                let body = json!({
                    "reason": "already_registered",
                    "voter_id": voter_id.to_string(),
                })
                .to_string();
                Response::build()
                    .status(Status::Conflict)
                    .header(ContentType::JSON)
                    .sized_body(body.len(), Cursor::new(body))
                    .ok()
            }
            Self::Db(_) | Self::BsonDeserialize(_) | Self::BsonSerialize(_) => {
                Err(Status::InternalServerError)
            }
            Self::OidParse(_) | Self::InvalidBallot(_) | Self::BadRequest(_) => {
                Err(Status::BadRequest)
            }
            Self::PhaseViolation(_) => Err(Status::Forbidden),
            Self::Eligibility(_) => Err(Status::UnprocessableEntity),
            Self::VoteUpdateForbidden => Err(Status::Conflict),
            Self::Unauthorized(_) => Err(Status::Unauthorized),
            Self::NotFound(_) => Err(Status::NotFound),
        }
    }
}

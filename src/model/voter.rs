use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::ops::{Deref, DerefMut};

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use rand::distributions::{Distribution, Uniform};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::model::mongodb::Id;
use crate::Config;

pub type HmacSha256 = Hmac<Sha256>;

/// Core voter data, as stored in the database. Created at registration;
/// mutated only to flip verification state; never moved between regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoterCore {
    /// Owning election.
    pub election_id: Id,
    /// Unique per election (enforced by index).
    pub email: String,
    pub email_verified: bool,
    /// Pending verification challenge; nulled once used.
    pub verification: Option<Verification>,
    /// The region this voter matched at registration. Assigned once,
    /// never reassigned.
    pub region_id: Option<Id>,
    /// HMAC of the registering device's fingerprint; the raw fingerprint
    /// is never stored.
    pub fingerprint_hmac: Option<Vec<u8>>,
    /// Audit copy of the coordinate used at registration.
    pub location_lat: Option<f64>,
    pub location_lng: Option<f64>,
    /// Organizer-defined custom field values.
    #[serde(default)]
    pub field_values: HashMap<String, String>,
}

/// A voter without an ID.
pub type NewVoter = VoterCore;

/// A voter from the database, with its unique ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Voter {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub voter: VoterCore,
}

impl Deref for Voter {
    type Target = VoterCore;

    fn deref(&self) -> &Self::Target {
        &self.voter
    }
}

impl DerefMut for Voter {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.voter
    }
}

/// A pending email verification challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub code: VerificationCode,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub expires: DateTime<Utc>,
}

impl Verification {
    pub fn new(expires: DateTime<Utc>) -> Self {
        Self {
            code: VerificationCode::random(),
            expires,
        }
    }

    /// Whether the challenge has expired. The expiry instant itself is
    /// still valid.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires
    }
}

pub const CODE_LENGTH: usize = 6;

/// A one-time emailed verification code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerificationCode(String);

impl VerificationCode {
    /// Generate a random code.
    pub fn random() -> Self {
        let digit_dist = Uniform::from(0..=9u32);
        let mut rng = rand::thread_rng();
        let code = (0..CODE_LENGTH)
            .map(|_| char::from_digit(digit_dist.sample(&mut rng), 10).unwrap())
            .collect();
        Self(code)
    }

    /// Constant-shape comparison against a submitted code string.
    pub fn matches(&self, submitted: &str) -> bool {
        self.0 == submitted.trim()
    }
}

impl Display for VerificationCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hash a device fingerprint for storage and lookup. Fingerprints are
/// compared by HMAC only; the raw value never reaches the database.
pub fn fingerprint_hmac(fingerprint: &str, config: &Config) -> Vec<u8> {
    let mut hmac = HmacSha256::new_from_slice(config.fingerprint_secret())
        .expect("HMAC can take key of any size");
    hmac.update(fingerprint.as_bytes());
    hmac.finalize().into_bytes().to_vec()
}

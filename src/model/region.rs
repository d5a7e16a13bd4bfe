use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::geo::RegionGeometry;
use crate::model::mongodb::Id;

/// Core region data, as stored in the database. Immutable once any voter
/// has been assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionCore {
    /// Owning election.
    pub election_id: Id,
    pub name: String,
    pub geometry: RegionGeometry,
    /// Tolerance added outward from the strict boundary, in metres.
    /// Non-negative; validated at write time.
    pub buffer_meters: f64,
}

/// A region without an ID.
pub type NewRegion = RegionCore;

/// A region from the database, with its unique ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub region: RegionCore,
}

impl Deref for Region {
    type Target = RegionCore;

    fn deref(&self) -> &Self::Target {
        &self.region
    }
}

/// Organizer-submitted region definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionSpec {
    pub name: String,
    pub geometry: RegionGeometry,
    #[serde(default)]
    pub buffer_meters: f64,
}

impl RegionSpec {
    /// Validate and attach to an election.
    pub fn into_region(self, election_id: Id) -> Result<RegionCore, String> {
        if self.buffer_meters < 0.0 {
            return Err("Buffer distance must not be negative".to_string());
        }
        if let Err(reason) = self.geometry.validate() {
            return Err(reason);
        }
        Ok(RegionCore {
            election_id,
            name: self.name,
            geometry: self.geometry,
            buffer_meters: self.buffer_meters,
        })
    }
}

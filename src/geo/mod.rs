//! Geofence engine: spherical distance math and region membership.

pub mod fence;
pub mod math;

pub use fence::{is_in_region, RegionGeometry};
pub use math::{haversine_meters, point_to_segment_meters, EARTH_RADIUS_METERS};

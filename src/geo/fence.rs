//! Region membership testing.

use serde::{Deserialize, Serialize};

use super::math::{haversine_meters, point_to_segment_meters};

/// An organizer-drawn region boundary. Coordinates cross the wire
/// longitude-first (`[lng, lat]`), matching GeoJSON ordering; rings are
/// closed (first point repeated as the last).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RegionGeometry {
    Circle {
        /// `[lng, lat]` of the centre.
        center: [f64; 2],
        #[serde(rename = "radiusMeters")]
        radius_meters: f64,
    },
    Polygon {
        ring: Vec<[f64; 2]>,
    },
    /// An axis-aligned rectangle, stored as its closed 5-point ring.
    Rectangle {
        ring: Vec<[f64; 2]>,
    },
}

impl RegionGeometry {
    /// Write-time validation; the membership test itself assumes valid
    /// geometry and simply never matches degenerate rings.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Circle { radius_meters, .. } => {
                if *radius_meters <= 0.0 {
                    return Err("Circle radius must be positive".to_string());
                }
            }
            Self::Polygon { ring } => {
                if open_ring(ring).len() < 3 {
                    return Err("Polygon ring needs at least 3 distinct points".to_string());
                }
            }
            Self::Rectangle { ring } => {
                if ring.len() != 5 || ring.first() != ring.last() {
                    return Err(
                        "Rectangle ring must be 4 corners with the first repeated".to_string()
                    );
                }
            }
        }
        Ok(())
    }
}

/// Whether the coordinate lies inside the region boundary, extended
/// outward by `buffer_meters`.
///
/// Circles use great-circle distance against radius + buffer (boundary
/// inclusive). Rings use planar ray casting for strict containment, and
/// when a buffer is set, a point within `buffer_meters` of any edge also
/// matches. A zero buffer is the strict test only.
pub fn is_in_region(lat: f64, lng: f64, geometry: &RegionGeometry, buffer_meters: f64) -> bool {
    match geometry {
        RegionGeometry::Circle {
            center,
            radius_meters,
        } => haversine_meters(lat, lng, center[1], center[0]) <= radius_meters + buffer_meters,
        RegionGeometry::Polygon { ring } | RegionGeometry::Rectangle { ring } => {
            let points = open_ring(ring);
            if points.len() < 3 {
                // Degenerate rings never match.
                return false;
            }
            if point_in_ring(lat, lng, points) {
                return true;
            }
            buffer_meters > 0.0 && min_edge_distance(lat, lng, points) <= buffer_meters
        }
    }
}

/// Strip the closing duplicate point, if present.
fn open_ring(ring: &[[f64; 2]]) -> &[[f64; 2]] {
    match ring {
        [head @ .., last] if ring.len() > 1 && ring.first() == Some(last) => head,
        _ => ring,
    }
}

/// Standard even-odd ray casting over an open ring, treated as planar.
/// x = longitude, y = latitude.
fn point_in_ring(lat: f64, lng: f64, points: &[[f64; 2]]) -> bool {
    let mut inside = false;
    let mut j = points.len() - 1;
    for i in 0..points.len() {
        let [xi, yi] = points[i];
        let [xj, yj] = points[j];
        let crosses =
            ((yi > lat) != (yj > lat)) && (lng < (xj - xi) * (lat - yi) / (yj - yi) + xi);
        if crosses {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Minimum distance from the point to any edge of the ring, in metres.
fn min_edge_distance(lat: f64, lng: f64, points: &[[f64; 2]]) -> f64 {
    let mut min = f64::INFINITY;
    let mut j = points.len() - 1;
    for i in 0..points.len() {
        let [a_lng, a_lat] = points[j];
        let [b_lng, b_lat] = points[i];
        let d = point_to_segment_meters(lat, lng, a_lat, a_lng, b_lat, b_lng);
        if d < min {
            min = d;
        }
        j = i;
    }
    min
}

//! Spherical-earth distance primitives.
//!
//! Accurate to well under a metre at the metres-to-kilometres scales
//! regions and buffers are drawn at, which is all the geofence needs.

/// Mean earth radius in metres.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Great-circle distance between two coordinates, in metres.
pub fn haversine_meters(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_METERS * c
}

/// Minimum distance from a point to the segment between `a` and `b`, in
/// metres.
///
/// The parametric position of the closest point is recovered from the three
/// pairwise haversine distances via the law of cosines, clamped to the
/// segment, and the projected point is linearly interpolated in coordinate
/// space. This approximates planar projection on the sphere; fine at
/// region scales.
pub fn point_to_segment_meters(
    lat: f64,
    lng: f64,
    a_lat: f64,
    a_lng: f64,
    b_lat: f64,
    b_lng: f64,
) -> f64 {
    let pa = haversine_meters(lat, lng, a_lat, a_lng);
    let pb = haversine_meters(lat, lng, b_lat, b_lng);
    let ab = haversine_meters(a_lat, a_lng, b_lat, b_lng);

    // Degenerate segment: both endpoints coincide.
    if ab == 0.0 {
        return pa;
    }

    let t = ((pa.powi(2) - pb.powi(2) + ab.powi(2)) / (2.0 * ab.powi(2))).clamp(0.0, 1.0);
    let proj_lat = a_lat + t * (b_lat - a_lat);
    let proj_lng = a_lng + t * (b_lng - a_lng);
    haversine_meters(lat, lng, proj_lat, proj_lng)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Metres per degree of latitude (and of longitude on the equator).
    pub const METERS_PER_DEGREE: f64 = EARTH_RADIUS_METERS * std::f64::consts::PI / 180.0;

    #[test]
    fn haversine_zero_for_identical_points() {
        assert_eq!(haversine_meters(33.6844, 73.0479, 33.6844, 73.0479), 0.0);
    }

    #[test]
    fn haversine_along_the_equator() {
        // One degree of longitude on the equator.
        let d = haversine_meters(0.0, 0.0, 0.0, 1.0);
        assert!((d - METERS_PER_DEGREE).abs() < 1.0, "got {d}");
    }

    #[test]
    fn haversine_known_city_pair() {
        // London to Paris, roughly 343.5 km.
        let d = haversine_meters(51.5074, -0.1278, 48.8566, 2.3522);
        assert!((d - 343_500.0).abs() < 1_000.0, "got {d}");
    }

    #[test]
    fn haversine_is_symmetric() {
        let d1 = haversine_meters(10.0, 20.0, -30.0, 40.0);
        let d2 = haversine_meters(-30.0, 40.0, 10.0, 20.0);
        assert!((d1 - d2).abs() < 1e-9);
    }

    #[test]
    fn segment_distance_perpendicular_case() {
        // Segment along the equator from lng 0 to lng 0.01; point 100m
        // north of its midpoint.
        let north = 100.0 / METERS_PER_DEGREE;
        let d = point_to_segment_meters(north, 0.005, 0.0, 0.0, 0.0, 0.01);
        assert!((d - 100.0).abs() < 1.0, "got {d}");
    }

    #[test]
    fn segment_distance_clamps_to_endpoints() {
        // Point beyond the `b` end: closest point is `b` itself.
        let d = point_to_segment_meters(0.0, 0.02, 0.0, 0.0, 0.0, 0.01);
        let expected = haversine_meters(0.0, 0.02, 0.0, 0.01);
        assert!((d - expected).abs() < 0.01, "got {d}");
    }

    #[test]
    fn segment_distance_degenerate_segment() {
        let d = point_to_segment_meters(0.0, 0.01, 0.0, 0.0, 0.0, 0.0);
        let expected = haversine_meters(0.0, 0.01, 0.0, 0.0);
        assert!((d - expected).abs() < 1e-6);
    }
}

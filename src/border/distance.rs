//! Great-circle distance and the propagation-delay plausibility check.

use crate::lookup::geo::Coordinates;

/// Mean Earth radius (IUGG)
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Speed of light in vacuum, km per millisecond
pub const LIGHT_KM_PER_MS: f64 = 299.792458;

/// Refractive index of optical fiber
pub const FIBER_REFRACTIVE_INDEX: f64 = 1.448;

/// Signal speed in fiber, km per millisecond (about 207)
pub const FIBER_KM_PER_MS: f64 = LIGHT_KM_PER_MS / FIBER_REFRACTIVE_INDEX;

/// Haversine distance in kilometers
pub fn distance_km(a: Coordinates, b: Coordinates) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlng = (b.lng - a.lng).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Shortest possible one-way time over `km` of fiber
pub fn min_one_way_ms(km: f64) -> f64 {
    km / FIBER_KM_PER_MS
}

/// Whether `rtt_ms` is too small for a device at `candidate` to have been
/// measured from `reference`. A violation discredits the candidate
/// location, not the measurement.
pub fn is_violation(candidate: Coordinates, reference: Coordinates, rtt_ms: f64) -> bool {
    2.0 * min_one_way_ms(distance_km(candidate, reference)) > rtt_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_known_pairs() {
        let frankfurt = Coordinates::new(50.1109, 8.6821);
        let amsterdam = Coordinates::new(52.3676, 4.9041);
        let d = distance_km(frankfurt, amsterdam);
        assert!((d - 364.0).abs() < 5.0, "got {}", d);

        assert_eq!(distance_km(frankfurt, frankfurt), 0.0);

        // Antipodes
        let d = distance_km(Coordinates::new(0.0, 0.0), Coordinates::new(0.0, 180.0));
        assert!((d - std::f64::consts::PI * EARTH_RADIUS_KM).abs() < 1e-6);
    }

    #[test]
    fn test_fiber_speed() {
        assert!((FIBER_KM_PER_MS - 207.04).abs() < 0.01);
    }

    #[test]
    fn test_violation_at_1000_km() {
        // One degree of longitude at the equator is ~111.2 km
        let a = Coordinates::new(0.0, 0.0);
        let b = Coordinates::new(0.0, 1000.0 / 111.195);
        assert!((distance_km(a, b) - 1000.0).abs() < 1.0);

        assert!(is_violation(a, b, 1.0));
        assert!(!is_violation(a, b, 20.0));
    }

    #[test]
    fn test_same_place_never_violates() {
        let a = Coordinates::new(39.04, -77.49);
        assert!(!is_violation(a, a, 0.0));
    }
}

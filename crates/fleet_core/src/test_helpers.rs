//! Test helpers for common test setup and utilities.
//!
//! Shared builders for tests and benchmarks: canonical points around the
//! Berlin Mitte test area, ping/request constructors, and a seeded random
//! fleet generator for scale tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::types::{
    DriverId, GeoPoint, LocationPing, PassengerId, PositionSource, TripRequest, VehicleType,
};

/// Canonical test pickup point (Berlin Mitte).
pub fn test_point() -> GeoPoint {
    GeoPoint::new(52.520, 13.405)
}

/// A point roughly `east_m` meters east of the canonical test point.
pub fn point_east_of(origin: GeoPoint, east_m: f64) -> GeoPoint {
    // ~67.6 m per 0.001 deg of longitude at this latitude.
    GeoPoint::new(origin.lat, origin.lng + east_m / 67_600.0)
}

/// A well-formed GPS ping.
pub fn ping(driver: &str, at: GeoPoint, timestamp_ms: u64) -> LocationPing {
    LocationPing {
        driver_id: DriverId::new(driver),
        location: at,
        speed_kmh: 30.0,
        heading_deg: 90.0,
        accuracy_m: 5.0,
        source: PositionSource::Gps,
        timestamp_ms,
    }
}

/// A car trip request between two points.
pub fn trip_request(passenger: &str, pickup: GeoPoint, dropoff: GeoPoint) -> TripRequest {
    TripRequest {
        passenger_id: PassengerId::new(passenger),
        pickup,
        dropoff,
        vehicle_type: VehicleType::Car,
        booking_ref: None,
    }
}

/// Deterministic fleet of pings scattered within ~`spread_m` meters of
/// `center`. Same seed, same fleet.
pub fn seeded_fleet(center: GeoPoint, count: usize, spread_m: f64, seed: u64) -> Vec<LocationPing> {
    let mut rng = StdRng::seed_from_u64(seed);
    let lat_spread = spread_m / 111_000.0;
    let lng_spread = spread_m / 67_600.0;
    (0..count)
        .map(|i| {
            let at = GeoPoint::new(
                center.lat + rng.gen_range(-lat_spread..=lat_spread),
                center.lng + rng.gen_range(-lng_spread..=lng_spread),
            );
            let mut p = ping(&format!("driver-{i}"), at, 1_000 + i as u64);
            p.speed_kmh = rng.gen_range(5.0..60.0);
            p.heading_deg = rng.gen_range(0.0..360.0);
            p
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::distance_m_between_points;

    #[test]
    fn point_east_of_moves_roughly_the_right_distance() {
        let origin = test_point();
        let moved = point_east_of(origin, 500.0);
        let d = distance_m_between_points(origin, moved);
        assert!((d - 500.0).abs() < 25.0, "moved {d}m");
    }

    #[test]
    fn seeded_fleet_is_reproducible_and_in_bounds() {
        let a = seeded_fleet(test_point(), 50, 2_000.0, 42);
        let b = seeded_fleet(test_point(), 50, 2_000.0, 42);
        assert_eq!(a.len(), 50);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.driver_id, y.driver_id);
            assert_eq!(x.location, y.location);
        }
        for p in &a {
            assert!(p.location.is_valid());
            // Corner of the square can exceed the axis spread by sqrt(2).
            assert!(distance_m_between_points(test_point(), p.location) <= 2_000.0 * 1.5);
        }
    }
}

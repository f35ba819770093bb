//! Driver matching: expanding-radius candidate search ranked by ETA.
//!
//! The search tries the initial radius, doubling until either a radius
//! produces at least one eligible candidate or the maximum is exhausted.
//! Candidates are ranked ascending by pickup ETA, with ties broken by
//! shorter straight-line distance, then by the freshest position update.
//!
//! "No driver available" is a normal outcome, surfaced as
//! [`FleetError::NoCandidate`] so callers can tell it apart from internal
//! errors by matching on the variant.

use std::sync::Arc;

use tracing::debug;

use crate::error::{FleetError, Result};
use crate::eta::EtaEngine;
use crate::geo_index::{GeoIndex, NearbyDriver, QueryFilter};
use crate::types::{DriverId, GeoPoint, VehicleType};

/// One ranked candidate for a pickup.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub driver_id: DriverId,
    /// ETA from the driver's position to the pickup point, in minutes.
    pub eta_minutes: f64,
    /// Route distance from driver to pickup.
    pub distance_km: f64,
    /// Straight-line distance used as the first tie-break.
    pub straight_line_m: f64,
    /// Timestamp of the driver's last position update (second tie-break;
    /// fresher data wins).
    pub position_updated_at_ms: u64,
    /// True when the candidate's ETA came from the straight-line fallback.
    pub eta_degraded: bool,
}

/// Parameters for one driver search.
#[derive(Debug, Clone)]
pub struct MatchQuery {
    pub pickup: GeoPoint,
    pub vehicle_type: Option<VehicleType>,
    /// Cap for the expanding radius.
    pub max_radius_m: f64,
    /// ETA is computed for at most this many nearest candidates.
    pub max_candidates: usize,
}

pub struct MatchingEngine {
    geo: Arc<GeoIndex>,
    eta: Arc<EtaEngine>,
    initial_radius_m: f64,
}

impl MatchingEngine {
    pub fn new(geo: Arc<GeoIndex>, eta: Arc<EtaEngine>, initial_radius_m: f64) -> Self {
        Self {
            geo,
            eta,
            initial_radius_m,
        }
    }

    /// Find the best available driver for a pickup, or
    /// [`FleetError::NoCandidate`] when the expanding search exhausts the
    /// maximum radius. The scan reads a point-in-time snapshot of the geo
    /// index; no lock is held across the ranking computation.
    pub fn find_driver(&self, query: &MatchQuery, now_ms: u64) -> Result<MatchCandidate> {
        if !query.pickup.is_valid() {
            return Err(FleetError::TransientInput {
                reason: "pickup point outside coordinate range".to_string(),
            });
        }

        let filter = QueryFilter::available(query.vehicle_type);
        let mut radius = self.initial_radius_m.min(query.max_radius_m);

        loop {
            let eligible = self
                .geo
                .query_nearby(query.pickup, radius, filter, now_ms)
                .collect_sorted();

            if !eligible.is_empty() {
                debug!(
                    radius_m = radius,
                    candidates = eligible.len(),
                    "eligible drivers found"
                );
                return Ok(self.rank(query, &eligible));
            }

            if radius >= query.max_radius_m {
                debug!(searched_radius_m = radius, "no eligible drivers");
                return Err(FleetError::NoCandidate {
                    searched_radius_m: radius,
                });
            }
            radius = (radius * 2.0).min(query.max_radius_m);
        }
    }

    /// Rank candidates by (ETA, straight-line distance, freshest update)
    /// and return the best. `eligible` is non-empty and distance-sorted, so
    /// capping at `max_candidates` keeps the nearest drivers.
    fn rank(&self, query: &MatchQuery, eligible: &[NearbyDriver]) -> MatchCandidate {
        let mut candidates: Vec<MatchCandidate> = eligible
            .iter()
            .take(query.max_candidates.max(1))
            .map(|nearby| {
                let estimate = self
                    .eta
                    .estimate_route(nearby.position.location, query.pickup);
                MatchCandidate {
                    driver_id: nearby.position.driver_id.clone(),
                    eta_minutes: estimate.eta_minutes,
                    distance_km: estimate.distance_km,
                    straight_line_m: nearby.distance_m,
                    position_updated_at_ms: nearby.position.updated_at_ms,
                    eta_degraded: estimate.degraded,
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.eta_minutes
                .total_cmp(&b.eta_minutes)
                .then_with(|| a.straight_line_m.total_cmp(&b.straight_line_m))
                .then_with(|| b.position_updated_at_ms.cmp(&a.position_updated_at_ms))
        });

        // Non-empty by construction.
        candidates.swap_remove(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GeoIndexConfig, RoadSpeedConfig};
    use crate::road_speed::RoadSpeedModel;
    use crate::routing::H3GridRouteProvider;
    use crate::types::{LocationPing, PositionSource, TripId};
    use h3o::Resolution;

    fn setup() -> (MatchingEngine, Arc<GeoIndex>) {
        let geo = Arc::new(GeoIndex::new(&GeoIndexConfig::default()));
        let speeds = Arc::new(RoadSpeedModel::new(
            RoadSpeedConfig::default(),
            Resolution::Nine,
        ));
        let eta = Arc::new(EtaEngine::new(
            Box::new(H3GridRouteProvider::default()),
            speeds,
        ));
        let matching = MatchingEngine::new(Arc::clone(&geo), eta, 500.0);
        (matching, geo)
    }

    fn ping(driver: &str, lat: f64, lng: f64, ts: u64) -> LocationPing {
        LocationPing {
            driver_id: DriverId::new(driver),
            location: GeoPoint::new(lat, lng),
            speed_kmh: 30.0,
            heading_deg: 0.0,
            accuracy_m: 5.0,
            source: PositionSource::Gps,
            timestamp_ms: ts,
        }
    }

    fn query(pickup: GeoPoint) -> MatchQuery {
        MatchQuery {
            pickup,
            vehicle_type: None,
            max_radius_m: 4_000.0,
            max_candidates: 8,
        }
    }

    #[test]
    fn matches_driver_at_pickup() {
        let (matching, geo) = setup();
        let pickup = GeoPoint::new(52.52, 13.405);
        geo.upsert(&ping("d1", 52.52, 13.405, 1_000));

        let candidate = matching.find_driver(&query(pickup), 1_000).expect("match");
        assert_eq!(candidate.driver_id, DriverId::new("d1"));
        assert!(candidate.eta_minutes < 1.0);
        assert!(!candidate.eta_degraded);
    }

    #[test]
    fn nearest_eta_wins() {
        let (matching, geo) = setup();
        let pickup = GeoPoint::new(52.52, 13.405);
        // ~150m and ~1.4km away.
        geo.upsert(&ping("near", 52.52, 13.4072, 1_000));
        geo.upsert(&ping("far", 52.52, 13.4255, 1_000));

        let candidate = matching.find_driver(&query(pickup), 1_000).expect("match");
        assert_eq!(candidate.driver_id, DriverId::new("near"));
    }

    #[test]
    fn freshness_breaks_exact_ties() {
        let (matching, geo) = setup();
        let pickup = GeoPoint::new(52.52, 13.405);
        // Same spot, different update times.
        geo.upsert(&ping("old", 52.5205, 13.4055, 1_000));
        geo.upsert(&ping("fresh", 52.5205, 13.4055, 9_000));

        let candidate = matching.find_driver(&query(pickup), 9_000).expect("match");
        assert_eq!(candidate.driver_id, DriverId::new("fresh"));
    }

    #[test]
    fn radius_expands_until_driver_found() {
        let (matching, geo) = setup();
        let pickup = GeoPoint::new(52.52, 13.405);
        // ~1.9km away: outside 500m and 1000m, inside 2000m.
        geo.upsert(&ping("d1", 52.52, 13.433, 1_000));

        let candidate = matching.find_driver(&query(pickup), 1_000).expect("match");
        assert_eq!(candidate.driver_id, DriverId::new("d1"));
    }

    #[test]
    fn no_candidate_is_a_distinct_outcome() {
        let (matching, geo) = setup();
        let pickup = GeoPoint::new(52.52, 13.405);
        // ~7km away: beyond the 4km cap.
        geo.upsert(&ping("d1", 52.52, 13.508, 1_000));

        match matching.find_driver(&query(pickup), 1_000) {
            Err(FleetError::NoCandidate { searched_radius_m }) => {
                assert!((searched_radius_m - 4_000.0).abs() < 1e-9);
            }
            other => panic!("expected NoCandidate, got {other:?}"),
        }
    }

    #[test]
    fn claimed_and_offline_drivers_are_not_candidates() {
        let (matching, geo) = setup();
        let pickup = GeoPoint::new(52.52, 13.405);
        geo.upsert(&ping("claimed", 52.52, 13.4055, 1_000));
        geo.upsert(&ping("offline", 52.52, 13.4057, 1_000));
        geo.claim(&DriverId::new("claimed"), TripId(9)).expect("claim");
        geo.mark_offline(&DriverId::new("offline"));

        match matching.find_driver(&query(pickup), 1_000) {
            Err(FleetError::NoCandidate { .. }) => {}
            other => panic!("expected NoCandidate, got {other:?}"),
        }
    }

    #[test]
    fn vehicle_type_must_match() {
        let (matching, geo) = setup();
        let pickup = GeoPoint::new(52.52, 13.405);
        geo.set_vehicle_type(&DriverId::new("moto"), VehicleType::Motorcycle);
        geo.upsert(&ping("moto", 52.52, 13.4055, 1_000));

        let mut q = query(pickup);
        q.vehicle_type = Some(VehicleType::Van);
        assert!(matches!(
            matching.find_driver(&q, 1_000),
            Err(FleetError::NoCandidate { .. })
        ));

        q.vehicle_type = Some(VehicleType::Motorcycle);
        let candidate = matching.find_driver(&q, 1_000).expect("match");
        assert_eq!(candidate.driver_id, DriverId::new("moto"));
    }
}

//! Traffic-aware ETA computation.
//!
//! A route is decomposed into its cell legs; each leg is traversed at the
//! live speed of the road segment covering it (falling back to the segment
//! baseline, then the global default for unknown roads). When the route
//! provider fails or times out, the engine degrades to a straight-line
//! estimate at the global default speed instead of stalling — the result is
//! flagged so downstream consumers know the ETA is coarse.

use std::sync::Arc;

use tracing::warn;

use crate::road_speed::RoadSpeedModel;
use crate::routing::{RouteFailure, RouteProvider};
use crate::spatial::{distance_km_between_cells, distance_km_between_points};
use crate::types::GeoPoint;

/// A distance/time estimate for one origin/destination pair.
#[derive(Debug, Clone)]
pub struct RouteEstimate {
    pub distance_km: f64,
    pub eta_minutes: f64,
    /// Route geometry; two points (origin, destination) when degraded.
    pub points: Vec<GeoPoint>,
    /// True when the routing dependency failed and this is a straight-line
    /// fallback at the global default speed.
    pub degraded: bool,
}

pub struct EtaEngine {
    provider: Box<dyn RouteProvider>,
    speeds: Arc<RoadSpeedModel>,
}

impl EtaEngine {
    pub fn new(provider: Box<dyn RouteProvider>, speeds: Arc<RoadSpeedModel>) -> Self {
        Self { provider, speeds }
    }

    /// Estimate distance and traffic-aware travel time between two points.
    /// Never fails: routing errors degrade to the straight-line fallback.
    pub fn estimate_route(&self, from: GeoPoint, to: GeoPoint) -> RouteEstimate {
        match self.provider.route(from, to) {
            Ok(route) => {
                let mut hours = 0.0;
                for pair in route.cells.windows(2) {
                    let leg_km = distance_km_between_cells(pair[0], pair[1]);
                    if leg_km <= 0.0 {
                        continue;
                    }
                    let leg_point: GeoPoint = h3o::LatLng::from(pair[1]).into();
                    let speed = self.speeds.speed_near(leg_point).kmh.max(1.0);
                    hours += leg_km / speed;
                }
                let mut distance_km = route.distance_km;
                // A route whose endpoints share a cell collapses to a single
                // cell and zero leg distance, even for points most of a hex
                // apart. Floor it with the straight-line distance at the
                // local speed.
                if distance_km <= 0.0 {
                    distance_km = distance_km_between_points(from, to);
                    let speed = self.speeds.speed_near(from).kmh.max(1.0);
                    hours = distance_km / speed;
                }
                RouteEstimate {
                    distance_km,
                    eta_minutes: hours * 60.0,
                    points: route.points,
                    degraded: false,
                }
            }
            Err(failure) => {
                warn!(%failure, "route provider failed, using straight-line fallback");
                self.fallback_estimate(from, to, failure)
            }
        }
    }

    fn fallback_estimate(
        &self,
        from: GeoPoint,
        to: GeoPoint,
        _failure: RouteFailure,
    ) -> RouteEstimate {
        let distance_km = distance_km_between_points(from, to);
        let speed = self.speeds.global_default_kmh().max(1.0);
        RouteEstimate {
            distance_km,
            eta_minutes: (distance_km / speed) * 60.0,
            points: vec![from, to],
            degraded: true,
        }
    }
}

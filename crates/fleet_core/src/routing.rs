//! Pluggable route providers: trait abstraction for routing backends.
//!
//! Two implementations, selectable at engine construction:
//!
//! - **`H3GridRouteProvider`**: H3 grid-path + haversine legs, always available.
//! - **`OsrmRouteProvider`** (feature `osrm`): calls an OSRM HTTP endpoint
//!   with a bounded client timeout.
//!
//! [`CachedRouteProvider`] wraps either with an LRU keyed on the
//! origin/destination cell pair. Besides saving work, the cache is what
//! keeps a trip's route stable across ETA recomputations: the same cell
//! pair always resolves to the identical route, so an ETA can only move
//! because segment speeds moved.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use h3o::{CellIndex, Resolution};
use lru::LruCache;
use thiserror::Error;

use crate::spatial::{distance_km_between_cells, distance_km_between_points, grid_path_cells_cached};
use crate::types::GeoPoint;

/// Why a route query produced nothing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteFailure {
    /// The backend did not answer within its bounded timeout.
    #[error("routing backend timed out")]
    Timeout,
    /// The backend answered but found no route (or the input was not
    /// routable at all).
    #[error("no route found")]
    NoRoute,
}

/// Result of a route query between two points.
#[derive(Debug, Clone)]
pub struct RouteResult {
    /// Route geometry, ordered from origin to destination.
    pub points: Vec<GeoPoint>,
    /// Road-network distance in kilometers.
    pub distance_km: f64,
    /// Free-flow travel time in seconds, as reported by the backend.
    pub duration_secs: f64,
    /// H3 cells along the route, used for per-leg ETA decomposition.
    pub cells: Vec<CellIndex>,
}

/// Trait for routing backends. Implementations must be `Send + Sync` so a
/// provider can be shared behind the engine.
pub trait RouteProvider: Send + Sync {
    fn route(&self, from: GeoPoint, to: GeoPoint) -> Result<RouteResult, RouteFailure>;
}

// ---------------------------------------------------------------------------
// H3 Grid provider (always available)
// ---------------------------------------------------------------------------

/// Routes along the H3 hexagonal grid using cached grid paths, with leg
/// distances summed by haversine. Zero external dependencies.
pub struct H3GridRouteProvider {
    resolution: Resolution,
}

impl H3GridRouteProvider {
    pub fn new(resolution: Resolution) -> Self {
        Self { resolution }
    }
}

impl Default for H3GridRouteProvider {
    fn default() -> Self {
        Self::new(Resolution::Nine)
    }
}

impl RouteProvider for H3GridRouteProvider {
    fn route(&self, from: GeoPoint, to: GeoPoint) -> Result<RouteResult, RouteFailure> {
        let from_cell = from.cell(self.resolution).ok_or(RouteFailure::NoRoute)?;
        let to_cell = to.cell(self.resolution).ok_or(RouteFailure::NoRoute)?;
        let cells = grid_path_cells_cached(from_cell, to_cell).ok_or(RouteFailure::NoRoute)?;

        let points: Vec<GeoPoint> = cells.iter().map(|c| h3o::LatLng::from(*c).into()).collect();
        let distance_km: f64 = cells
            .windows(2)
            .map(|pair| distance_km_between_cells(pair[0], pair[1]))
            .sum();

        // Free-flow estimate at 40 km/h average city speed.
        let duration_secs = if distance_km > 0.0 {
            (distance_km / 40.0) * 3600.0
        } else {
            0.0
        };

        Ok(RouteResult {
            points,
            distance_km,
            duration_secs,
            cells,
        })
    }
}

// ---------------------------------------------------------------------------
// OSRM provider (behind `osrm` feature)
// ---------------------------------------------------------------------------

#[cfg(feature = "osrm")]
pub mod osrm {
    use super::*;
    use serde::Deserialize;
    use std::time::Duration;

    /// Routes via an OSRM HTTP endpoint. The client carries a hard 5s
    /// timeout so a dead backend degrades rather than stalls the caller.
    pub struct OsrmRouteProvider {
        client: reqwest::blocking::Client,
        endpoint: String,
        resolution: Resolution,
    }

    impl OsrmRouteProvider {
        pub fn new(endpoint: &str, resolution: Resolution) -> Result<Self, RouteFailure> {
            let client = reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .map_err(|_| RouteFailure::NoRoute)?;
            Ok(Self {
                client,
                endpoint: endpoint.trim_end_matches('/').to_string(),
                resolution,
            })
        }
    }

    #[derive(Deserialize)]
    struct OsrmResponse {
        code: String,
        routes: Option<Vec<OsrmRoute>>,
    }

    #[derive(Deserialize)]
    struct OsrmRoute {
        distance: f64, // meters
        duration: f64, // seconds
        geometry: OsrmGeometry,
    }

    #[derive(Deserialize)]
    struct OsrmGeometry {
        coordinates: Vec<Vec<f64>>, // [lng, lat]
    }

    impl RouteProvider for OsrmRouteProvider {
        fn route(&self, from: GeoPoint, to: GeoPoint) -> Result<RouteResult, RouteFailure> {
            let url = format!(
                "{}/route/v1/driving/{},{};{},{}?overview=full&geometries=geojson",
                self.endpoint, from.lng, from.lat, to.lng, to.lat,
            );

            let response = self.client.get(&url).send().map_err(|e| {
                if e.is_timeout() {
                    RouteFailure::Timeout
                } else {
                    RouteFailure::NoRoute
                }
            })?;
            let parsed: OsrmResponse = response.json().map_err(|_| RouteFailure::NoRoute)?;

            if parsed.code != "Ok" {
                return Err(RouteFailure::NoRoute);
            }
            let route = parsed
                .routes
                .and_then(|rs| rs.into_iter().next())
                .ok_or(RouteFailure::NoRoute)?;

            let points: Vec<GeoPoint> = route
                .geometry
                .coordinates
                .iter()
                .filter(|c| c.len() >= 2)
                .map(|c| GeoPoint::new(c[1], c[0]))
                .collect();

            // Snap waypoints to cells, deduplicating consecutive repeats.
            let mut cells: Vec<CellIndex> = Vec::with_capacity(points.len());
            for point in &points {
                if let Some(cell) = point.cell(self.resolution) {
                    if cells.last() != Some(&cell) {
                        cells.push(cell);
                    }
                }
            }

            Ok(RouteResult {
                points,
                distance_km: route.distance / 1000.0,
                duration_secs: route.duration,
                cells,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Caching wrapper
// ---------------------------------------------------------------------------

/// LRU-cached wrapper around any [`RouteProvider`].
///
/// Cache key is the (origin cell, destination cell) pair, so recomputations
/// for a driver who has not left their cell reuse the identical route. On
/// inner failure the optional H3 grid fallback is tried before giving up.
pub struct CachedRouteProvider {
    inner: Box<dyn RouteProvider>,
    cache: Mutex<LruCache<(u64, u64), RouteResult>>,
    resolution: Resolution,
    fallback_to_grid: bool,
}

impl CachedRouteProvider {
    pub fn new(
        inner: Box<dyn RouteProvider>,
        capacity: usize,
        resolution: Resolution,
        fallback_to_grid: bool,
    ) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("cache capacity must be > 0"),
            )),
            resolution,
            fallback_to_grid,
        }
    }

    fn cache_key(&self, from: GeoPoint, to: GeoPoint) -> Option<(u64, u64)> {
        let from_cell = from.cell(self.resolution)?;
        let to_cell = to.cell(self.resolution)?;
        Some((u64::from(from_cell), u64::from(to_cell)))
    }
}

impl RouteProvider for CachedRouteProvider {
    fn route(&self, from: GeoPoint, to: GeoPoint) -> Result<RouteResult, RouteFailure> {
        let key = self.cache_key(from, to).ok_or(RouteFailure::NoRoute)?;

        if let Ok(mut cache) = self.cache.lock() {
            if let Some(cached) = cache.get(&key) {
                return Ok(cached.clone());
            }
        }

        let result = self.inner.route(from, to).or_else(|failure| {
            if self.fallback_to_grid {
                H3GridRouteProvider::new(self.resolution).route(from, to)
            } else {
                Err(failure)
            }
        })?;

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, result.clone());
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn grid_route_connects_endpoints() {
        let provider = H3GridRouteProvider::default();
        let from = GeoPoint::new(52.52, 13.405);
        let to = GeoPoint::new(52.53, 13.42);
        let route = provider.route(from, to).expect("route");

        assert!(route.cells.len() >= 2);
        assert!(route.distance_km > 0.0);
        assert!(route.duration_secs > 0.0);
        assert_eq!(route.points.len(), route.cells.len());
        // Leg-summed distance is at least the straight line.
        let straight = distance_km_between_points(from, to);
        assert!(route.distance_km >= straight * 0.9);
    }

    #[test]
    fn same_cell_route_is_trivial() {
        let provider = H3GridRouteProvider::default();
        let point = GeoPoint::new(52.52, 13.405);
        let route = provider.route(point, point).expect("route");
        assert_eq!(route.cells.len(), 1);
        assert!(route.distance_km.abs() < 1e-9);
    }

    struct CountingProvider {
        calls: std::sync::Arc<AtomicUsize>,
    }

    impl RouteProvider for CountingProvider {
        fn route(&self, from: GeoPoint, to: GeoPoint) -> Result<RouteResult, RouteFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            H3GridRouteProvider::default().route(from, to)
        }
    }

    #[test]
    fn cached_provider_reuses_routes_per_cell_pair() {
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let inner = Box::new(CountingProvider {
            calls: std::sync::Arc::clone(&calls),
        });
        let cached = CachedRouteProvider::new(inner, 16, Resolution::Nine, false);

        let from = GeoPoint::new(52.52, 13.405);
        let to = GeoPoint::new(52.53, 13.42);
        let first = cached.route(from, to).expect("route");
        // A second query from a point in the same cell must hit the cache.
        let nudged = GeoPoint::new(from.lat + 0.0001, from.lng);
        let second = cached.route(nudged, to).expect("route");

        assert_eq!(first.cells, second.cells);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct FailingProvider;

    impl RouteProvider for FailingProvider {
        fn route(&self, _from: GeoPoint, _to: GeoPoint) -> Result<RouteResult, RouteFailure> {
            Err(RouteFailure::Timeout)
        }
    }

    #[test]
    fn cached_provider_falls_back_to_grid() {
        let cached = CachedRouteProvider::new(Box::new(FailingProvider), 16, Resolution::Nine, true);
        let route = cached
            .route(GeoPoint::new(52.52, 13.405), GeoPoint::new(52.53, 13.42))
            .expect("fallback route");
        assert!(route.distance_km > 0.0);
    }

    #[test]
    fn failure_propagates_without_fallback() {
        let cached =
            CachedRouteProvider::new(Box::new(FailingProvider), 16, Resolution::Nine, false);
        let err = cached
            .route(GeoPoint::new(52.52, 13.405), GeoPoint::new(52.53, 13.42))
            .expect_err("failure");
        assert_eq!(err, RouteFailure::Timeout);
    }
}

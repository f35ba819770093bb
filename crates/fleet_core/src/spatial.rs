//! Spatial primitives: haversine distances, H3 helpers, and global caches.
//!
//! This module provides:
//!
//! - **Distance calculations**: haversine between points and between H3 cells
//! - **Polyline distance**: point-to-road-segment distance for snap matching
//! - **Radius helpers**: convert a meter radius into an H3 grid-disk `k`
//! - **Caches**: LRU caches for cell distances and grid disks
//!
//! Default resolution is 9 (~240m cell size), sized for city-scale queries.

use std::num::NonZeroUsize;
use std::sync::{Mutex, OnceLock};

use h3o::{CellIndex, LatLng, Resolution};
use lru::LruCache;

use crate::types::GeoPoint;

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance in kilometers between two points.
pub fn distance_km_between_points(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lon1) = (a.lat.to_radians(), a.lng.to_radians());
    let (lat2, lon2) = (b.lat.to_radians(), b.lng.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// Haversine distance in meters between two points.
pub fn distance_m_between_points(a: GeoPoint, b: GeoPoint) -> f64 {
    distance_km_between_points(a, b) * 1000.0
}

/// Uncached cell-center distance (internal use).
fn distance_km_between_cells_uncached(a: CellIndex, b: CellIndex) -> f64 {
    let a: LatLng = a.into();
    let b: LatLng = b.into();
    distance_km_between_points(a.into(), b.into())
}

/// Global distance cache (50,000 entries, ~800KB memory).
fn get_distance_cache() -> &'static Mutex<LruCache<(CellIndex, CellIndex), f64>> {
    static CACHE: OnceLock<Mutex<LruCache<(CellIndex, CellIndex), f64>>> = OnceLock::new();
    CACHE.get_or_init(|| {
        Mutex::new(LruCache::new(
            NonZeroUsize::new(50_000).expect("cache size must be non-zero"),
        ))
    })
}

/// Calculate distance between two H3 cells with LRU caching.
///
/// Uses a symmetric key (smaller cell first) to maximize cache hits for
/// repeated pairs during ranking and ETA recomputation.
pub fn distance_km_between_cells(a: CellIndex, b: CellIndex) -> f64 {
    let key = if a < b { (a, b) } else { (b, a) };

    let mut cache = match get_distance_cache().lock() {
        Ok(guard) => guard,
        // Fallback: compute without cache if mutex poisoned
        Err(_) => return distance_km_between_cells_uncached(key.0, key.1),
    };

    *cache.get_or_insert(key, || distance_km_between_cells_uncached(key.0, key.1))
}

/// Grid disk cache for radius queries.
struct GridDiskCache {
    cache: Mutex<LruCache<(CellIndex, u32), Vec<CellIndex>>>,
}

impl GridDiskCache {
    fn new() -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(1_000).expect("cache size must be non-zero"),
            )),
        }
    }

    fn get_or_compute(&self, origin: CellIndex, k: u32) -> Vec<CellIndex> {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            // Fallback: compute without cache if mutex poisoned
            Err(_) => return origin.grid_disk::<Vec<_>>(k),
        };
        cache
            .get_or_insert((origin, k), || origin.grid_disk::<Vec<_>>(k))
            .clone()
    }
}

static GRID_DISK_CACHE: OnceLock<GridDiskCache> = OnceLock::new();

/// Get grid disk with caching.
pub fn grid_disk_cached(origin: CellIndex, k: u32) -> Vec<CellIndex> {
    GRID_DISK_CACHE
        .get_or_init(GridDiskCache::new)
        .get_or_compute(origin, k)
}

/// Path cache for grid routing.
/// Only caches successful paths; failures are not cached (will retry, which is fine).
struct PathCache {
    cache: Mutex<LruCache<(CellIndex, CellIndex), Vec<CellIndex>>>,
}

impl PathCache {
    fn new() -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(5_000).expect("cache size must be non-zero"),
            )),
        }
    }

    fn get_or_compute(&self, from: CellIndex, to: CellIndex) -> Option<Vec<CellIndex>> {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            // Fallback: compute without cache if mutex poisoned
            Err(_) => return Self::compute_path(from, to),
        };

        if let Some(cached) = cache.get(&(from, to)) {
            return Some(cached.clone());
        }

        let path = Self::compute_path(from, to);
        if let Some(cells) = &path {
            cache.put((from, to), cells.clone());
        }
        path
    }

    fn compute_path(from: CellIndex, to: CellIndex) -> Option<Vec<CellIndex>> {
        from.grid_path_cells(to).ok().and_then(|path| {
            let cells: Vec<CellIndex> = path.filter_map(|cell| cell.ok()).collect();
            if cells.is_empty() {
                None
            } else {
                Some(cells)
            }
        })
    }
}

static PATH_CACHE: OnceLock<PathCache> = OnceLock::new();

/// Get grid path with caching. Directional key so routes stay stable per
/// origin/destination pair.
pub fn grid_path_cells_cached(from: CellIndex, to: CellIndex) -> Option<Vec<CellIndex>> {
    PATH_CACHE
        .get_or_init(PathCache::new)
        .get_or_compute(from, to)
}

/// Average hexagon edge length in meters for the resolutions the index
/// supports in practice.
pub fn hex_edge_len_m(resolution: Resolution) -> f64 {
    match resolution {
        Resolution::Seven => 1_220.6,
        Resolution::Eight => 461.4,
        Resolution::Nine => 174.4,
        Resolution::Ten => 65.9,
        Resolution::Eleven => 24.9,
        _ => 174.4,
    }
}

/// Number of grid-disk rings needed to cover a meter radius at a resolution.
///
/// Over-covers on purpose: callers re-filter by exact haversine distance, so
/// an extra ring costs a little scanning but never drops a driver at the
/// radius boundary.
pub fn rings_for_radius(radius_m: f64, resolution: Resolution) -> u32 {
    // Center-to-center spacing between neighbor hexes is sqrt(3) * edge.
    let spacing_m = hex_edge_len_m(resolution) * 3.0_f64.sqrt();
    if radius_m <= 0.0 {
        return 0;
    }
    (radius_m / spacing_m).ceil() as u32 + 1
}

/// Distance in meters from a point to the polyline segment `(a, b)`.
///
/// Uses an equirectangular projection around the point, which is accurate to
/// well under a meter at the sub-kilometer scales snap matching cares about.
pub fn point_to_segment_distance_m(point: GeoPoint, a: GeoPoint, b: GeoPoint) -> f64 {
    let lat0 = point.lat.to_radians();
    let meters_per_deg_lat = 111_132.0;
    let meters_per_deg_lng = 111_320.0 * lat0.cos();

    let px = (point.lng - a.lng) * meters_per_deg_lng;
    let py = (point.lat - a.lat) * meters_per_deg_lat;
    let bx = (b.lng - a.lng) * meters_per_deg_lng;
    let by = (b.lat - a.lat) * meters_per_deg_lat;

    let seg_len_sq = bx * bx + by * by;
    let t = if seg_len_sq <= f64::EPSILON {
        0.0
    } else {
        ((px * bx + py * by) / seg_len_sq).clamp(0.0, 1.0)
    };

    let dx = px - t * bx;
    let dy = py - t * by;
    (dx * dx + dy * dy).sqrt()
}

/// Minimum distance in meters from a point to a polyline (>= 2 points).
pub fn point_to_polyline_distance_m(point: GeoPoint, polyline: &[GeoPoint]) -> f64 {
    polyline
        .windows(2)
        .map(|pair| point_to_segment_distance_m(point, pair[0], pair[1]))
        .fold(f64::INFINITY, f64::min)
}

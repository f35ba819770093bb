//! Engine configuration.
//!
//! Every tunable named in the design notes lives here with a serde default,
//! so a partial config file (or none at all) yields a working engine. The
//! numeric defaults are operational starting points, not contracts.

use h3o::Resolution;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub geo: GeoIndexConfig,
    #[serde(default)]
    pub road_speed: RoadSpeedConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub trips: TripConfig,
}

/// Geo index tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoIndexConfig {
    /// H3 resolution for the driver cell index. Resolution 9 is ~240m hexes,
    /// suitable for city-scale radius queries.
    #[serde(default = "default_resolution", with = "resolution_serde")]
    pub resolution: Resolution,
    /// A position older than this is treated as offline even if the online
    /// flag was never cleared.
    #[serde(default = "default_staleness_ttl_ms")]
    pub staleness_ttl_ms: u64,
}

impl Default for GeoIndexConfig {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            staleness_ttl_ms: default_staleness_ttl_ms(),
        }
    }
}

/// Road-speed model tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoadSpeedConfig {
    /// Weight given to a new sample in the exponential weighted average.
    #[serde(default = "default_ewma_weight")]
    pub ewma_weight: f64,
    /// Maximum distance from a segment polyline for a ping to count as a
    /// speed sample on that segment.
    #[serde(default = "default_snap_distance_m")]
    pub snap_distance_m: f64,
    /// Segments with no samples inside this window decay back toward
    /// baseline on each sweep.
    #[serde(default = "default_decay_window_ms")]
    pub decay_window_ms: u64,
    /// Fraction of the (baseline - current) gap closed per decay sweep.
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f64,
    /// Speed assumed for roads the model knows nothing about.
    #[serde(default = "default_global_speed_kmh")]
    pub global_default_kmh: f64,
}

impl Default for RoadSpeedConfig {
    fn default() -> Self {
        Self {
            ewma_weight: default_ewma_weight(),
            snap_distance_m: default_snap_distance_m(),
            decay_window_ms: default_decay_window_ms(),
            decay_factor: default_decay_factor(),
            global_default_kmh: default_global_speed_kmh(),
        }
    }
}

/// Matching engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// First search radius; doubled on each empty pass.
    #[serde(default = "default_initial_radius_m")]
    pub initial_radius_m: f64,
    /// Cap for the expanding search when the request does not set one.
    #[serde(default = "default_max_radius_m")]
    pub max_radius_m: f64,
    /// ETA is computed for at most this many nearest candidates.
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    /// Bounded retries when a claim compare-and-set race is lost.
    #[serde(default = "default_claim_retries")]
    pub claim_retries: u32,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            initial_radius_m: default_initial_radius_m(),
            max_radius_m: default_max_radius_m(),
            max_candidates: default_max_candidates(),
            claim_retries: default_claim_retries(),
        }
    }
}

/// Trip lifecycle tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripConfig {
    /// Driver within this distance of the pickup point starts the trip.
    #[serde(default = "default_pickup_proximity_m")]
    pub pickup_proximity_m: f64,
    /// Driver within this distance of the dropoff point completes the trip.
    #[serde(default = "default_dropoff_proximity_m")]
    pub dropoff_proximity_m: f64,
    /// Re-match attempts after a driver cancels before the trip is failed
    /// with a user-facing "no driver available".
    #[serde(default = "default_reassign_retries")]
    pub reassign_retries: u32,
    /// Minimum interval between periodic ETA recomputations per trip.
    #[serde(default = "default_eta_refresh_interval_ms")]
    pub eta_refresh_interval_ms: u64,
}

impl Default for TripConfig {
    fn default() -> Self {
        Self {
            pickup_proximity_m: default_pickup_proximity_m(),
            dropoff_proximity_m: default_dropoff_proximity_m(),
            reassign_retries: default_reassign_retries(),
            eta_refresh_interval_ms: default_eta_refresh_interval_ms(),
        }
    }
}

fn default_resolution() -> Resolution {
    Resolution::Nine
}

fn default_staleness_ttl_ms() -> u64 {
    90_000
}

fn default_ewma_weight() -> f64 {
    0.3
}

fn default_snap_distance_m() -> f64 {
    50.0
}

fn default_decay_window_ms() -> u64 {
    15 * 60 * 1000
}

fn default_decay_factor() -> f64 {
    0.5
}

fn default_global_speed_kmh() -> f64 {
    30.0
}

fn default_initial_radius_m() -> f64 {
    500.0
}

fn default_max_radius_m() -> f64 {
    4_000.0
}

fn default_max_candidates() -> usize {
    8
}

fn default_claim_retries() -> u32 {
    3
}

fn default_pickup_proximity_m() -> f64 {
    50.0
}

fn default_dropoff_proximity_m() -> f64 {
    50.0
}

fn default_reassign_retries() -> u32 {
    3
}

fn default_eta_refresh_interval_ms() -> u64 {
    10_000
}

/// Serde helper: (de)serialize `Resolution` as its u8 value.
mod resolution_serde {
    use h3o::Resolution;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(res: &Resolution, ser: S) -> Result<S::Ok, S::Error> {
        u8::from(*res).serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Resolution, D::Error> {
        let raw = u8::deserialize(de)?;
        Resolution::try_from(raw).map_err(serde::de::Error::custom)
    }
}

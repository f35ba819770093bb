use thiserror::Error;

use crate::types::{DriverId, TripId};

/// Error taxonomy for the tracking core.
///
/// Only [`FleetError::InvariantViolation`] indicates a bug worth alerting on.
/// `NoCandidate` and `ClaimConflict` are expected operational outcomes that
/// callers are meant to match on and recover from.
#[derive(Error, Debug)]
pub enum FleetError {
    /// Malformed input that was dropped. Never surfaced for pings (those are
    /// logged and swallowed); used for invalid trip requests.
    #[error("invalid input: {reason}")]
    TransientInput { reason: String },

    /// Matching found zero eligible drivers inside the maximum radius.
    /// A legitimate business outcome, not a failure.
    #[error("no driver available within {searched_radius_m:.0}m")]
    NoCandidate { searched_radius_m: f64 },

    /// Lost the compare-and-set race for a driver claim. The caller retries
    /// matching against a fresh snapshot, bounded by the configured limit.
    #[error("driver {driver} already claimed by {holder}")]
    ClaimConflict { driver: DriverId, holder: TripId },

    /// Routing dependency unresponsive; the caller fell back to a
    /// straight-line estimate and the trip proceeds with a degraded ETA.
    #[error("routing dependency unavailable: {0}")]
    DependencyTimeout(String),

    /// A trip was found in an impossible state transition. Fatal for that
    /// trip: it is forced to a safe terminal state and logged in full.
    #[error("{trip}: invariant violation: {detail}")]
    InvariantViolation { trip: TripId, detail: String },

    #[error("unknown trip: {0}")]
    TripNotFound(TripId),

    #[error("unknown driver: {0}")]
    DriverNotFound(DriverId),
}

pub type Result<T> = std::result::Result<T, FleetError>;

//! Core identifiers and inbound payload types.
//!
//! All statuses and categories are closed enums; there are no free-form
//! status strings anywhere in the engine. Timestamps are epoch milliseconds
//! (`u64`) supplied by the caller, so tests never depend on the wall clock.

use std::fmt;

use h3o::{CellIndex, LatLng, Resolution};
use serde::{Deserialize, Serialize};

/// Unique driver identifier, assigned by the account service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DriverId(pub String);

impl DriverId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique passenger identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PassengerId(pub String);

impl PassengerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PassengerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique road segment identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub String);

impl SegmentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trip identifier, allocated by the trip store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TripId(pub u64);

impl fmt::Display for TripId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trip-{}", self.0)
    }
}

/// How a position fix was obtained. Accuracy degrades down the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSource {
    Gps,
    CellTower,
    Ip,
}

/// Vehicle categories a passenger can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VehicleType {
    Motorcycle,
    Auto,
    Car,
    Van,
}

/// Who initiated a cancellation or completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorRole {
    Passenger,
    Driver,
    System,
}

/// A geographic point in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Convert to an `h3o` lat/lng. `None` for out-of-range coordinates.
    pub fn latlng(&self) -> Option<LatLng> {
        LatLng::new(self.lat, self.lng).ok()
    }

    /// Snap to the H3 cell containing this point at the given resolution.
    pub fn cell(&self, resolution: Resolution) -> Option<CellIndex> {
        self.latlng().map(|ll| ll.to_cell(resolution))
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

impl From<LatLng> for GeoPoint {
    fn from(ll: LatLng) -> Self {
        Self {
            lat: ll.lat(),
            lng: ll.lng(),
        }
    }
}

/// One driver location ping, delivered at a client-controlled cadence
/// (typically every 5–15 seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationPing {
    pub driver_id: DriverId,
    pub location: GeoPoint,
    /// Reported speed in km/h. Must be >= 0.
    pub speed_kmh: f64,
    /// Heading in degrees. Normalized into [0, 360) on ingestion.
    pub heading_deg: f64,
    /// Accuracy radius in meters. Must be > 0.
    pub accuracy_m: f64,
    pub source: PositionSource,
    pub timestamp_ms: u64,
}

impl LocationPing {
    /// Heading folded into [0, 360). Wraps negative and >360 values.
    pub fn normalized_heading(&self) -> f64 {
        let h = self.heading_deg % 360.0;
        if h < 0.0 {
            h + 360.0
        } else {
            h
        }
    }
}

/// An inbound trip request from a passenger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripRequest {
    pub passenger_id: PassengerId,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub vehicle_type: VehicleType,
    /// Optional booking reference from the booking service.
    pub booking_ref: Option<String>,
}

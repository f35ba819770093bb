//! Completed-trip records and operation counters.
//!
//! A [`CompletedTripRecord`] is cut once, at the COMPLETED transition, and
//! carries everything settlement and analytics need, including derived KPIs.
//! [`Counters`] are cheap atomic tallies of the operational conditions worth
//! watching (dropped pings, claim conflicts, degraded ETAs) without pulling
//! in a metrics backend.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::trips::{Trip, TripStatus};
use crate::types::{DriverId, GeoPoint, PassengerId, TripId};

/// Immutable record of one completed trip.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedTripRecord {
    pub trip_id: TripId,
    pub booking_ref: Option<String>,
    pub passenger_id: PassengerId,
    pub driver_id: DriverId,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub distance_km: f64,
    /// ETA frozen at the first assignment.
    pub original_eta_minutes: f64,
    pub search_retries: u32,
    pub eta_degraded: bool,
    pub created_at_ms: u64,
    pub assigned_at_ms: u64,
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
}

impl CompletedTripRecord {
    /// Cut a record from a trip. `None` unless the trip is COMPLETED with
    /// its driver and all lifecycle timestamps in place.
    pub fn from_trip(trip: &Trip) -> Option<Self> {
        if trip.status != TripStatus::Completed {
            return None;
        }
        Some(Self {
            trip_id: trip.id,
            booking_ref: trip.booking_ref.clone(),
            passenger_id: trip.passenger_id.clone(),
            driver_id: trip.driver_id.clone()?,
            pickup: trip.pickup,
            dropoff: trip.dropoff,
            distance_km: trip.distance_km,
            original_eta_minutes: trip.original_eta_minutes?,
            search_retries: trip.search_retries,
            eta_degraded: trip.eta_degraded,
            created_at_ms: trip.created_at_ms,
            assigned_at_ms: trip.assigned_at_ms?,
            started_at_ms: trip.started_at_ms?,
            ended_at_ms: trip.ended_at_ms?,
        })
    }

    /// Seconds from trip request to driver assignment.
    pub fn time_to_match_secs(&self) -> f64 {
        self.assigned_at_ms.saturating_sub(self.created_at_ms) as f64 / 1000.0
    }

    /// Seconds from assignment to pickup.
    pub fn time_to_pickup_secs(&self) -> f64 {
        self.started_at_ms.saturating_sub(self.assigned_at_ms) as f64 / 1000.0
    }

    /// Seconds from pickup to dropoff.
    pub fn trip_duration_secs(&self) -> f64 {
        self.ended_at_ms.saturating_sub(self.started_at_ms) as f64 / 1000.0
    }

    /// Actual minutes to pickup minus the frozen original ETA. Positive
    /// means the prediction was optimistic.
    pub fn eta_drift_minutes(&self) -> f64 {
        self.time_to_pickup_secs() / 60.0 - self.original_eta_minutes
    }
}

/// Atomic tallies of expected operational conditions.
#[derive(Debug, Default)]
pub struct Counters {
    pub pings_dropped_stale: AtomicU64,
    pub pings_rejected: AtomicU64,
    pub samples_recorded: AtomicU64,
    pub claim_conflicts: AtomicU64,
    pub degraded_etas: AtomicU64,
    pub searches_no_candidate: AtomicU64,
    pub trips_completed: AtomicU64,
    pub trips_cancelled: AtomicU64,
}

/// Point-in-time copy of [`Counters`], serializable for logging/export.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub pings_dropped_stale: u64,
    pub pings_rejected: u64,
    pub samples_recorded: u64,
    pub claim_conflicts: u64,
    pub degraded_etas: u64,
    pub searches_no_candidate: u64,
    pub trips_completed: u64,
    pub trips_cancelled: u64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            pings_dropped_stale: self.pings_dropped_stale.load(Ordering::Relaxed),
            pings_rejected: self.pings_rejected.load(Ordering::Relaxed),
            samples_recorded: self.samples_recorded.load(Ordering::Relaxed),
            claim_conflicts: self.claim_conflicts.load(Ordering::Relaxed),
            degraded_etas: self.degraded_etas.load(Ordering::Relaxed),
            searches_no_candidate: self.searches_no_candidate.load(Ordering::Relaxed),
            trips_completed: self.trips_completed.load(Ordering::Relaxed),
            trips_cancelled: self.trips_cancelled.load(Ordering::Relaxed),
        }
    }
}

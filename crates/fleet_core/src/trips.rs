//! Trip lifecycle state machine and store.
//!
//! Each trip moves SEARCHING -> DRIVER_ASSIGNED -> EN_ROUTE_PICKUP ->
//! TRIP_ACTIVE -> COMPLETED, with CANCELLED reachable from every
//! non-terminal state. Transitions for one trip run under the trip's
//! DashMap entry lock, so a single trip has a single writer and out-of-order
//! events cannot interleave. Terminal states are sinks: the first terminal
//! transition wins and later terminal requests are idempotent no-ops.
//!
//! Trips are never deleted. Terminal trips stay in the store as immutable
//! history for settlement and analytics.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, error};

use crate::error::{FleetError, Result};
use crate::eta::RouteEstimate;
use crate::types::{ActorRole, DriverId, GeoPoint, PassengerId, TripId, TripRequest, VehicleType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripStatus {
    Searching,
    DriverAssigned,
    EnRoutePickup,
    TripActive,
    Completed,
    Cancelled,
}

impl TripStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TripStatus::Completed | TripStatus::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct Trip {
    pub id: TripId,
    pub booking_ref: Option<String>,
    pub passenger_id: PassengerId,
    pub driver_id: Option<DriverId>,
    pub vehicle_type: VehicleType,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub route_points: Vec<GeoPoint>,
    pub distance_km: f64,
    pub eta_minutes: f64,
    /// Frozen at the first assignment and never rewritten, including across
    /// reassignments after a driver cancel. Drift of `eta_minutes` against
    /// this value measures prediction quality.
    pub original_eta_minutes: Option<f64>,
    pub eta_degraded: bool,
    pub status: TripStatus,
    pub search_retries: u32,
    pub created_at_ms: u64,
    pub assigned_at_ms: Option<u64>,
    pub started_at_ms: Option<u64>,
    pub ended_at_ms: Option<u64>,
}

/// A committed status change, in the shape outbound consumers want.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub trip_id: TripId,
    pub old_status: TripStatus,
    pub new_status: TripStatus,
    pub eta_minutes: f64,
    pub distance_km: f64,
}

pub struct TripStore {
    trips: DashMap<TripId, Trip>,
    next_id: AtomicU64,
}

impl Default for TripStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TripStore {
    pub fn new() -> Self {
        Self {
            trips: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a trip in SEARCHING from a rider request.
    pub fn create(&self, request: &TripRequest, now_ms: u64) -> Trip {
        let id = TripId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let trip = Trip {
            id,
            booking_ref: request.booking_ref.clone(),
            passenger_id: request.passenger_id.clone(),
            driver_id: None,
            vehicle_type: request.vehicle_type,
            pickup: request.pickup,
            dropoff: request.dropoff,
            route_points: Vec::new(),
            distance_km: 0.0,
            eta_minutes: 0.0,
            original_eta_minutes: None,
            eta_degraded: false,
            status: TripStatus::Searching,
            search_retries: 0,
            created_at_ms: now_ms,
            assigned_at_ms: None,
            started_at_ms: None,
            ended_at_ms: None,
        };
        self.trips.insert(id, trip.clone());
        trip
    }

    pub fn get(&self, id: TripId) -> Option<Trip> {
        self.trips.get(&id).map(|t| t.clone())
    }

    pub fn len(&self) -> usize {
        self.trips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trips.is_empty()
    }

    /// Snapshot of trips in a non-terminal state with a driver attached,
    /// for the periodic ETA refresh.
    pub fn active_with_driver(&self) -> Vec<Trip> {
        self.trips
            .iter()
            .filter(|t| !t.status.is_terminal() && t.driver_id.is_some())
            .map(|t| t.clone())
            .collect()
    }

    /// SEARCHING -> DRIVER_ASSIGNED. Records the driver and the pickup
    /// estimate; freezes `original_eta_minutes` if this is the first
    /// assignment. The caller must already hold the driver's geo claim.
    ///
    /// A trip that left SEARCHING while the caller was matching (concurrent
    /// assignment or a cancellation landing mid-search) is a lost race, not
    /// a bug: the error is benign and the trip's state is untouched. The
    /// caller must release the claim it holds.
    pub fn assign(
        &self,
        id: TripId,
        driver: &DriverId,
        pickup_estimate: &RouteEstimate,
        now_ms: u64,
    ) -> Result<Transition> {
        let mut trip = self.trips.get_mut(&id).ok_or(FleetError::TripNotFound(id))?;
        if trip.status != TripStatus::Searching {
            debug!(trip = %id, status = ?trip.status, "assignment raced, trip left SEARCHING");
            return Err(FleetError::TransientInput {
                reason: format!("{} is no longer searching for a driver", trip.id),
            });
        }
        let old = trip.status;
        trip.driver_id = Some(driver.clone());
        trip.eta_minutes = pickup_estimate.eta_minutes;
        trip.distance_km = pickup_estimate.distance_km;
        trip.route_points = pickup_estimate.points.clone();
        trip.eta_degraded = pickup_estimate.degraded;
        if trip.original_eta_minutes.is_none() {
            trip.original_eta_minutes = Some(pickup_estimate.eta_minutes);
        }
        trip.status = TripStatus::DriverAssigned;
        trip.assigned_at_ms = Some(now_ms);
        Ok(self.committed(&trip, old))
    }

    /// DRIVER_ASSIGNED -> EN_ROUTE_PICKUP, on the driver's first location
    /// update after assignment. Any other state is a no-op.
    pub fn mark_en_route(&self, id: TripId) -> Result<Option<Transition>> {
        let mut trip = self.trips.get_mut(&id).ok_or(FleetError::TripNotFound(id))?;
        if trip.status != TripStatus::DriverAssigned {
            return Ok(None);
        }
        let old = trip.status;
        trip.status = TripStatus::EnRoutePickup;
        Ok(Some(self.committed(&trip, old)))
    }

    /// -> TRIP_ACTIVE, on pickup proximity or an explicit start event. An
    /// explicit start can arrive before the driver's first post-assignment
    /// ping, so DRIVER_ASSIGNED is accepted alongside EN_ROUTE_PICKUP.
    pub fn start(&self, id: TripId, now_ms: u64) -> Result<Option<Transition>> {
        let mut trip = self.trips.get_mut(&id).ok_or(FleetError::TripNotFound(id))?;
        match trip.status {
            TripStatus::TripActive => Ok(None),
            TripStatus::DriverAssigned | TripStatus::EnRoutePickup => {
                let old = trip.status;
                trip.status = TripStatus::TripActive;
                trip.started_at_ms = Some(now_ms);
                Ok(Some(self.committed(&trip, old)))
            }
            status if status.is_terminal() => Ok(None),
            _ => Err(self.invariant_violation(&mut trip, "start before assignment")),
        }
    }

    /// TRIP_ACTIVE -> COMPLETED. Completing an already-terminal trip is an
    /// idempotent no-op (last terminal transition wins, the loser does
    /// nothing). Completing a trip that never became active is an invariant
    /// violation and forces CANCELLED.
    pub fn complete(&self, id: TripId, now_ms: u64) -> Result<Option<Transition>> {
        let mut trip = self.trips.get_mut(&id).ok_or(FleetError::TripNotFound(id))?;
        match trip.status {
            TripStatus::TripActive => {
                let old = trip.status;
                trip.status = TripStatus::Completed;
                trip.ended_at_ms = Some(now_ms);
                Ok(Some(self.committed(&trip, old)))
            }
            status if status.is_terminal() => {
                debug!(trip = %id, ?status, "completion on terminal trip ignored");
                Ok(None)
            }
            _ => Err(self.invariant_violation(&mut trip, "completion before TRIP_ACTIVE")),
        }
    }

    /// Any non-terminal state -> CANCELLED. Idempotent on terminal trips.
    pub fn cancel(
        &self,
        id: TripId,
        actor: ActorRole,
        now_ms: u64,
    ) -> Result<Option<Transition>> {
        let mut trip = self.trips.get_mut(&id).ok_or(FleetError::TripNotFound(id))?;
        if trip.status.is_terminal() {
            debug!(trip = %id, ?actor, "cancellation on terminal trip ignored");
            return Ok(None);
        }
        let old = trip.status;
        debug!(trip = %id, ?actor, from = ?old, "trip cancelled");
        trip.status = TripStatus::Cancelled;
        trip.ended_at_ms = Some(now_ms);
        Ok(Some(self.committed(&trip, old)))
    }

    /// Driver-cancel recovery: DRIVER_ASSIGNED / EN_ROUTE_PICKUP back to
    /// SEARCHING with the retry counter bumped. Returns the transition and
    /// the driver whose claim the caller must now release. The frozen
    /// original ETA is kept.
    ///
    /// `None` when a concurrent start or terminal transition won the race;
    /// the winner's state stands and there is nothing to undo.
    pub fn revert_to_searching(&self, id: TripId) -> Result<Option<(Transition, DriverId)>> {
        let mut trip = self.trips.get_mut(&id).ok_or(FleetError::TripNotFound(id))?;
        if !matches!(
            trip.status,
            TripStatus::DriverAssigned | TripStatus::EnRoutePickup
        ) {
            debug!(trip = %id, status = ?trip.status, "revert raced, trip left the assignment phase");
            return Ok(None);
        }
        let Some(driver) = trip.driver_id.take() else {
            return Ok(None);
        };
        let old = trip.status;
        trip.status = TripStatus::Searching;
        trip.assigned_at_ms = None;
        trip.search_retries += 1;
        Ok(Some((self.committed(&trip, old), driver)))
    }

    /// Bump the retry counter after a search that found no candidate.
    /// Returns the new count.
    pub fn record_search_failure(&self, id: TripId) -> Result<u32> {
        let mut trip = self.trips.get_mut(&id).ok_or(FleetError::TripNotFound(id))?;
        trip.search_retries += 1;
        Ok(trip.search_retries)
    }

    /// Refresh the live estimate for an active trip. No status change, so
    /// no transition is emitted; the frozen original ETA is untouched.
    pub fn update_estimate(&self, id: TripId, estimate: &RouteEstimate) -> Result<()> {
        let mut trip = self.trips.get_mut(&id).ok_or(FleetError::TripNotFound(id))?;
        if trip.status.is_terminal() {
            return Ok(());
        }
        trip.eta_minutes = estimate.eta_minutes;
        trip.distance_km = estimate.distance_km;
        trip.route_points = estimate.points.clone();
        trip.eta_degraded = estimate.degraded;
        Ok(())
    }

    fn committed(&self, trip: &Trip, old: TripStatus) -> Transition {
        debug!(trip = %trip.id, from = ?old, to = ?trip.status, "trip transition");
        Transition {
            trip_id: trip.id,
            old_status: old,
            new_status: trip.status,
            eta_minutes: trip.eta_minutes,
            distance_km: trip.distance_km,
        }
    }

    /// An impossible transition was requested. Log the full state and force
    /// the trip to CANCELLED so it is never left inconsistent.
    fn invariant_violation(&self, trip: &mut Trip, detail: &str) -> FleetError {
        error!(
            trip = %trip.id,
            status = ?trip.status,
            driver = ?trip.driver_id,
            detail,
            "trip state invariant violated, forcing CANCELLED"
        );
        if !trip.status.is_terminal() {
            trip.status = TripStatus::Cancelled;
        }
        FleetError::InvariantViolation {
            trip: trip.id,
            detail: detail.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PassengerId;

    fn request() -> TripRequest {
        TripRequest {
            passenger_id: PassengerId::new("p1"),
            pickup: GeoPoint::new(52.52, 13.405),
            dropoff: GeoPoint::new(52.53, 13.42),
            vehicle_type: VehicleType::Car,
            booking_ref: Some("bk-17".to_string()),
        }
    }

    fn estimate(eta: f64) -> RouteEstimate {
        RouteEstimate {
            distance_km: 2.0,
            eta_minutes: eta,
            points: vec![GeoPoint::new(52.52, 13.405), GeoPoint::new(52.53, 13.42)],
            degraded: false,
        }
    }

    #[test]
    fn create_starts_in_searching() {
        let store = TripStore::new();
        let trip = store.create(&request(), 1_000);
        assert_eq!(trip.status, TripStatus::Searching);
        assert_eq!(trip.search_retries, 0);
        assert_eq!(trip.original_eta_minutes, None);
        assert_eq!(trip.booking_ref.as_deref(), Some("bk-17"));
        assert_eq!(store.get(trip.id).expect("stored").id, trip.id);
    }

    #[test]
    fn trip_ids_are_unique() {
        let store = TripStore::new();
        let a = store.create(&request(), 1_000);
        let b = store.create(&request(), 1_000);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn full_lifecycle_to_completed() {
        let store = TripStore::new();
        let trip = store.create(&request(), 1_000);
        let driver = DriverId::new("d1");

        let t = store.assign(trip.id, &driver, &estimate(5.0), 2_000).expect("assign");
        assert_eq!(t.old_status, TripStatus::Searching);
        assert_eq!(t.new_status, TripStatus::DriverAssigned);

        let t = store.mark_en_route(trip.id).expect("en route").expect("transition");
        assert_eq!(t.new_status, TripStatus::EnRoutePickup);

        let t = store.start(trip.id, 3_000).expect("start").expect("transition");
        assert_eq!(t.new_status, TripStatus::TripActive);

        let t = store.complete(trip.id, 9_000).expect("complete").expect("transition");
        assert_eq!(t.new_status, TripStatus::Completed);

        let final_trip = store.get(trip.id).expect("trip");
        assert_eq!(final_trip.assigned_at_ms, Some(2_000));
        assert_eq!(final_trip.started_at_ms, Some(3_000));
        assert_eq!(final_trip.ended_at_ms, Some(9_000));
    }

    #[test]
    fn original_eta_frozen_across_reassignment() {
        let store = TripStore::new();
        let trip = store.create(&request(), 1_000);

        store
            .assign(trip.id, &DriverId::new("d1"), &estimate(5.0), 2_000)
            .expect("assign");
        assert_eq!(store.get(trip.id).expect("trip").original_eta_minutes, Some(5.0));

        // Driver cancels; a different driver with a different ETA takes over.
        let (_, released) = store
            .revert_to_searching(trip.id)
            .expect("revert")
            .expect("reverted");
        assert_eq!(released, DriverId::new("d1"));
        store
            .assign(trip.id, &DriverId::new("d2"), &estimate(11.0), 3_000)
            .expect("reassign");

        let reassigned = store.get(trip.id).expect("trip");
        assert_eq!(reassigned.original_eta_minutes, Some(5.0));
        assert!((reassigned.eta_minutes - 11.0).abs() < 1e-9);
        assert_eq!(reassigned.search_retries, 1);
        assert_eq!(reassigned.driver_id, Some(DriverId::new("d2")));
    }

    #[test]
    fn terminal_states_are_sinks() {
        let store = TripStore::new();
        let trip = store.create(&request(), 1_000);
        store
            .assign(trip.id, &DriverId::new("d1"), &estimate(5.0), 2_000)
            .expect("assign");
        store.start(trip.id, 3_000).expect("start");
        store.complete(trip.id, 9_000).expect("complete");

        // Late events after the terminal transition all no-op.
        assert_eq!(store.cancel(trip.id, ActorRole::Passenger, 9_500).expect("cancel"), None);
        assert_eq!(store.complete(trip.id, 9_600).expect("complete"), None);
        assert_eq!(store.start(trip.id, 9_700).expect("start"), None);
        assert_eq!(store.mark_en_route(trip.id).expect("en route"), None);
        assert_eq!(store.get(trip.id).expect("trip").status, TripStatus::Completed);
        assert_eq!(store.get(trip.id).expect("trip").ended_at_ms, Some(9_000));
    }

    #[test]
    fn cancel_reachable_from_every_non_terminal_state() {
        let store = TripStore::new();
        let driver = DriverId::new("d1");

        for advance in 0..4 {
            let trip = store.create(&request(), 1_000);
            if advance >= 1 {
                store.assign(trip.id, &driver, &estimate(5.0), 2_000).expect("assign");
            }
            if advance >= 2 {
                store.mark_en_route(trip.id).expect("en route");
            }
            if advance >= 3 {
                store.start(trip.id, 3_000).expect("start");
            }
            let t = store
                .cancel(trip.id, ActorRole::System, 4_000)
                .expect("cancel")
                .expect("transition");
            assert_eq!(t.new_status, TripStatus::Cancelled);
        }
    }

    #[test]
    fn assignment_racing_a_cancel_loses_quietly() {
        let store = TripStore::new();
        let trip = store.create(&request(), 1_000);
        // Passenger cancels while the search is still ranking candidates.
        store.cancel(trip.id, ActorRole::Passenger, 1_500).expect("cancel");

        match store.assign(trip.id, &DriverId::new("d1"), &estimate(5.0), 2_000) {
            Err(FleetError::TransientInput { .. }) => {}
            other => panic!("expected benign race loss, got {other:?}"),
        }
        // The cancellation stands; the trip is not touched by the loser.
        let after = store.get(trip.id).expect("trip");
        assert_eq!(after.status, TripStatus::Cancelled);
        assert_eq!(after.driver_id, None);
        assert_eq!(after.original_eta_minutes, None);
    }

    #[test]
    fn second_assignment_cannot_disturb_the_first() {
        let store = TripStore::new();
        let trip = store.create(&request(), 1_000);
        store
            .assign(trip.id, &DriverId::new("d1"), &estimate(5.0), 2_000)
            .expect("assign");

        // A concurrent search that claimed another driver arrives late.
        assert!(matches!(
            store.assign(trip.id, &DriverId::new("d2"), &estimate(3.0), 2_001),
            Err(FleetError::TransientInput { .. })
        ));
        let after = store.get(trip.id).expect("trip");
        assert_eq!(after.status, TripStatus::DriverAssigned);
        assert_eq!(after.driver_id, Some(DriverId::new("d1")));
        assert_eq!(after.original_eta_minutes, Some(5.0));
    }

    #[test]
    fn revert_loses_quietly_to_start_and_completion() {
        let store = TripStore::new();
        let trip = store.create(&request(), 1_000);
        store
            .assign(trip.id, &DriverId::new("d1"), &estimate(5.0), 2_000)
            .expect("assign");
        store.start(trip.id, 3_000).expect("start");

        // Driver cancel raced the pickup confirmation and lost.
        assert_eq!(store.revert_to_searching(trip.id).expect("revert"), None);
        assert_eq!(store.get(trip.id).expect("trip").status, TripStatus::TripActive);

        store.complete(trip.id, 9_000).expect("complete");
        assert_eq!(store.revert_to_searching(trip.id).expect("revert"), None);
        assert_eq!(store.get(trip.id).expect("trip").status, TripStatus::Completed);
    }

    #[test]
    fn impossible_completion_forces_cancelled() {
        let store = TripStore::new();
        let trip = store.create(&request(), 1_000);

        // Completion before any assignment is a bug in the caller.
        match store.complete(trip.id, 2_000) {
            Err(FleetError::InvariantViolation { trip: id, .. }) => assert_eq!(id, trip.id),
            other => panic!("expected invariant violation, got {other:?}"),
        }
        assert_eq!(store.get(trip.id).expect("trip").status, TripStatus::Cancelled);
    }

    #[test]
    fn search_failure_counter_increments() {
        let store = TripStore::new();
        let trip = store.create(&request(), 1_000);
        assert_eq!(store.record_search_failure(trip.id).expect("count"), 1);
        assert_eq!(store.record_search_failure(trip.id).expect("count"), 2);
        assert_eq!(store.get(trip.id).expect("trip").status, TripStatus::Searching);
    }

    #[test]
    fn update_estimate_keeps_frozen_eta() {
        let store = TripStore::new();
        let trip = store.create(&request(), 1_000);
        store
            .assign(trip.id, &DriverId::new("d1"), &estimate(5.0), 2_000)
            .expect("assign");

        store.update_estimate(trip.id, &estimate(8.5)).expect("update");
        let updated = store.get(trip.id).expect("trip");
        assert!((updated.eta_minutes - 8.5).abs() < 1e-9);
        assert_eq!(updated.original_eta_minutes, Some(5.0));
    }

    #[test]
    fn unknown_trip_is_an_error() {
        let store = TripStore::new();
        assert!(matches!(
            store.complete(TripId(404), 1_000),
            Err(FleetError::TripNotFound(TripId(404)))
        ));
    }

    #[test]
    fn active_with_driver_excludes_terminal_and_searching() {
        let store = TripStore::new();
        let searching = store.create(&request(), 1_000);
        let assigned = store.create(&request(), 1_000);
        let done = store.create(&request(), 1_000);

        store
            .assign(assigned.id, &DriverId::new("d1"), &estimate(5.0), 2_000)
            .expect("assign");
        store
            .assign(done.id, &DriverId::new("d2"), &estimate(5.0), 2_000)
            .expect("assign");
        store.start(done.id, 3_000).expect("start");
        store.complete(done.id, 4_000).expect("complete");

        let active = store.active_with_driver();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, assigned.id);
        assert_ne!(active[0].id, searching.id);
    }
}

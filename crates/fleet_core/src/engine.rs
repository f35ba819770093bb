//! Engine facade wiring the geo index, road-speed model, ETA engine,
//! matching, and trip store together.
//!
//! All inbound traffic (pings, trip requests, lifecycle events) and the
//! periodic `tick` enter here. Outbound traffic leaves through the
//! [`EventSink`]. Timestamps are caller-supplied epoch milliseconds
//! throughout; the engine never reads the wall clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{FleetError, Result};
use crate::eta::EtaEngine;
use crate::events::{EventSink, FleetEvent, NullSink};
use crate::geo_index::{GeoIndex, UpsertOutcome};
use crate::matching::{MatchQuery, MatchingEngine};
use crate::road_speed::{RoadCondition, RoadSpeedModel};
use crate::routing::{CachedRouteProvider, H3GridRouteProvider, RouteProvider};
use crate::spatial::distance_m_between_points;
use crate::telemetry::{CompletedTripRecord, CounterSnapshot, Counters};
use crate::trips::{Transition, Trip, TripStatus, TripStore};
use crate::types::{ActorRole, DriverId, GeoPoint, LocationPing, SegmentId, TripId, TripRequest, VehicleType};

pub struct FleetEngine {
    config: EngineConfig,
    geo: Arc<GeoIndex>,
    speeds: Arc<RoadSpeedModel>,
    eta: Arc<EtaEngine>,
    matching: MatchingEngine,
    trips: TripStore,
    sink: Arc<dyn EventSink>,
    counters: Counters,
    last_eta_refresh_ms: AtomicU64,
}

impl FleetEngine {
    /// Engine with the cached H3 grid router and no event consumers.
    pub fn new(config: EngineConfig) -> Self {
        let resolution = config.geo.resolution;
        let provider = Box::new(CachedRouteProvider::new(
            Box::new(H3GridRouteProvider::new(resolution)),
            4096,
            resolution,
            true,
        ));
        Self::with_parts(config, provider, Arc::new(NullSink))
    }

    /// Engine with an explicit route provider and event sink.
    pub fn with_parts(
        config: EngineConfig,
        provider: Box<dyn RouteProvider>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let geo = Arc::new(GeoIndex::new(&config.geo));
        let speeds = Arc::new(RoadSpeedModel::new(
            config.road_speed.clone(),
            config.geo.resolution,
        ));
        let eta = Arc::new(EtaEngine::new(provider, Arc::clone(&speeds)));
        let matching = MatchingEngine::new(
            Arc::clone(&geo),
            Arc::clone(&eta),
            config.matching.initial_radius_m,
        );
        Self {
            config,
            geo,
            speeds,
            eta,
            matching,
            trips: TripStore::new(),
            sink,
            counters: Counters::new(),
            last_eta_refresh_ms: AtomicU64::new(0),
        }
    }

    pub fn geo(&self) -> &GeoIndex {
        &self.geo
    }

    pub fn speeds(&self) -> &RoadSpeedModel {
        &self.speeds
    }

    pub fn trip(&self, id: TripId) -> Option<Trip> {
        self.trips.get(id)
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Register a driver's vehicle type from the account service.
    pub fn register_driver(&self, driver: &DriverId, vehicle_type: VehicleType) {
        self.geo.set_vehicle_type(driver, vehicle_type);
    }

    /// Register a road segment from the map service.
    pub fn add_segment(
        &self,
        id: SegmentId,
        polyline: Vec<GeoPoint>,
        baseline_kmh: f64,
    ) -> Result<()> {
        self.speeds.insert_segment(id, polyline, baseline_kmh)
    }

    /// Ingest one driver ping: update the geo index, feed the road-speed
    /// model, and advance the driver's trip if the ping implies progress.
    /// Malformed and out-of-order pings are counted and dropped, never
    /// surfaced as failures.
    pub fn ingest_ping(&self, ping: &LocationPing) -> UpsertOutcome {
        let outcome = self.geo.upsert(ping);
        match outcome {
            UpsertOutcome::Rejected => {
                Counters::incr(&self.counters.pings_rejected);
                return outcome;
            }
            UpsertOutcome::DroppedStale => {
                Counters::incr(&self.counters.pings_dropped_stale);
                return outcome;
            }
            UpsertOutcome::Applied { .. } => {}
        }

        if self
            .speeds
            .snap_sample(ping.location, ping.speed_kmh, ping.timestamp_ms)
            .is_some()
        {
            Counters::incr(&self.counters.samples_recorded);
        }

        if let Some(trip_id) = self.geo.position(&ping.driver_id).and_then(|p| p.trip) {
            self.progress_trip(trip_id, ping.location, ping.timestamp_ms);
        }
        outcome
    }

    /// Create a trip for a rider request and attempt assignment once. The
    /// returned trip's status tells the caller how the search went: a trip
    /// with no eligible driver stays SEARCHING with its retry counter
    /// bumped.
    pub fn request_trip(&self, request: &TripRequest, now_ms: u64) -> Result<Trip> {
        if !request.pickup.is_valid() || !request.dropoff.is_valid() {
            return Err(FleetError::TransientInput {
                reason: "trip request with out-of-range coordinates".to_string(),
            });
        }
        let trip = self.trips.create(request, now_ms);
        info!(trip = %trip.id, passenger = %request.passenger_id, "trip requested");

        match self.try_assign(trip.id, now_ms) {
            Ok(_)
            | Err(FleetError::NoCandidate { .. })
            | Err(FleetError::ClaimConflict { .. })
            // Assignment raced a cancellation; the trip's status carries
            // the outcome.
            | Err(FleetError::TransientInput { .. }) => {}
            Err(other) => return Err(other),
        }
        self.trips.get(trip.id).ok_or(FleetError::TripNotFound(trip.id))
    }

    /// Run the matching engine for a SEARCHING trip and claim the winner.
    /// A lost claim race is retried against a fresh snapshot up to the
    /// configured bound; exhausted searches surface
    /// [`FleetError::NoCandidate`].
    pub fn try_assign(&self, trip_id: TripId, now_ms: u64) -> Result<Transition> {
        let trip = self.trips.get(trip_id).ok_or(FleetError::TripNotFound(trip_id))?;
        if trip.status != TripStatus::Searching {
            return Err(FleetError::TransientInput {
                reason: format!("{} is not searching for a driver", trip.id),
            });
        }

        let query = MatchQuery {
            pickup: trip.pickup,
            vehicle_type: Some(trip.vehicle_type),
            max_radius_m: self.config.matching.max_radius_m,
            max_candidates: self.config.matching.max_candidates,
        };

        let mut attempts = 0;
        loop {
            let candidate = match self.matching.find_driver(&query, now_ms) {
                Ok(candidate) => candidate,
                Err(err @ FleetError::NoCandidate { .. }) => {
                    Counters::incr(&self.counters.searches_no_candidate);
                    self.trips.record_search_failure(trip_id)?;
                    return Err(err);
                }
                Err(other) => return Err(other),
            };

            match self.geo.claim(&candidate.driver_id, trip_id) {
                Ok(()) => {
                    // Recompute through the cached provider so the stored
                    // route is the one the candidate was ranked with.
                    let driver_at = self
                        .geo
                        .position(&candidate.driver_id)
                        .map(|p| p.location)
                        .unwrap_or(trip.pickup);
                    let estimate = self.eta.estimate_route(driver_at, trip.pickup);
                    if estimate.degraded {
                        Counters::incr(&self.counters.degraded_etas);
                    }
                    // The trip can leave SEARCHING (cancel, concurrent
                    // assignment) while this search holds the claim; on any
                    // failure the claim must be handed back or the driver
                    // stays unmatchable forever.
                    let transition = match self
                        .trips
                        .assign(trip_id, &candidate.driver_id, &estimate, now_ms)
                    {
                        Ok(transition) => transition,
                        Err(err) => {
                            self.geo.release(&candidate.driver_id, trip_id);
                            debug!(trip = %trip_id, driver = %candidate.driver_id, %err, "assignment raced, claim released");
                            return Err(err);
                        }
                    };
                    info!(
                        trip = %trip_id,
                        driver = %candidate.driver_id,
                        eta_minutes = estimate.eta_minutes,
                        "driver assigned"
                    );
                    self.publish_transition(transition);
                    return Ok(transition);
                }
                Err(err @ FleetError::ClaimConflict { .. }) => {
                    Counters::incr(&self.counters.claim_conflicts);
                    attempts += 1;
                    if attempts > self.config.matching.claim_retries {
                        warn!(trip = %trip_id, "claim retries exhausted");
                        return Err(err);
                    }
                    debug!(trip = %trip_id, attempt = attempts, "claim lost, re-querying");
                }
                // Driver vanished between snapshot and claim; re-query.
                Err(FleetError::DriverNotFound(_)) => {
                    attempts += 1;
                    if attempts > self.config.matching.claim_retries {
                        return Err(FleetError::NoCandidate {
                            searched_radius_m: self.config.matching.max_radius_m,
                        });
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Explicit "trip started" from an external collaborator (e.g. driver
    /// app confirmation), as an alternative to pickup proximity.
    pub fn start_trip(&self, trip_id: TripId, now_ms: u64) -> Result<Option<Transition>> {
        let started = self.trips.start(trip_id, now_ms)?;
        if let Some(transition) = started {
            self.refresh_trip_estimate(trip_id);
            self.publish_transition(transition);
        }
        Ok(started)
    }

    /// Explicit completion from an external collaborator, as an alternative
    /// to dropoff proximity.
    pub fn complete_trip(&self, trip_id: TripId, now_ms: u64) -> Result<Option<Transition>> {
        self.finish_completed(trip_id, now_ms)
    }

    /// Cancellation by passenger, driver, or system. A driver cancel during
    /// the assignment phase reverts the trip to SEARCHING and re-runs
    /// matching, bounded by the reassignment retry budget; past the budget
    /// the trip is cancelled for good. Cancelling a terminal trip is an
    /// idempotent no-op.
    pub fn cancel_trip(
        &self,
        trip_id: TripId,
        actor: ActorRole,
        now_ms: u64,
    ) -> Result<Option<Transition>> {
        let trip = self.trips.get(trip_id).ok_or(FleetError::TripNotFound(trip_id))?;

        let driver_backs_out = actor == ActorRole::Driver
            && matches!(
                trip.status,
                TripStatus::DriverAssigned | TripStatus::EnRoutePickup
            );

        if driver_backs_out && trip.search_retries < self.config.trips.reassign_retries {
            // The store re-checks the phase under the trip lock: a start or
            // completion that raced this cancel wins, and the losing side
            // is a quiet no-op with the claim left where it belongs.
            let Some((reverted, driver)) = self.trips.revert_to_searching(trip_id)? else {
                return Ok(None);
            };
            self.geo.release(&driver, trip_id);
            info!(trip = %trip_id, "driver cancelled, re-matching");
            self.publish_transition(reverted);

            // On NoCandidate the trip stays SEARCHING; the caller may retry
            // until the budget runs out.
            return self.try_assign(trip_id, now_ms).map(Some);
        }

        let cancelled = self.trips.cancel(trip_id, actor, now_ms)?;
        if let Some(transition) = cancelled {
            if let Some(driver) = &trip.driver_id {
                self.geo.release(driver, trip_id);
            }
            Counters::incr(&self.counters.trips_cancelled);
            self.publish_transition(transition);
        }
        Ok(cancelled)
    }

    /// Periodic maintenance: flag stale drivers offline, decay idle road
    /// segments, and refresh ETAs for active trips on the configured
    /// interval. Also publishes a road-condition snapshot per refresh.
    pub fn tick(&self, now_ms: u64) {
        self.geo.sweep_stale(now_ms);
        self.speeds.decay_idle(now_ms);

        let last = self.last_eta_refresh_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < self.config.trips.eta_refresh_interval_ms {
            return;
        }
        self.last_eta_refresh_ms.store(now_ms, Ordering::Relaxed);

        for trip in self.trips.active_with_driver() {
            self.refresh_trip_estimate(trip.id);
        }
        self.sink
            .publish(FleetEvent::RoadConditions(self.road_conditions()));
    }

    /// Condition snapshot for client-facing map overlays.
    pub fn road_conditions(&self) -> Vec<RoadCondition> {
        self.speeds.conditions()
    }

    /// Recompute an active trip's estimate from the driver's current
    /// position: to the pickup before the trip starts, to the dropoff after.
    fn refresh_trip_estimate(&self, trip_id: TripId) {
        let Some(trip) = self.trips.get(trip_id) else {
            return;
        };
        let Some(driver) = &trip.driver_id else {
            return;
        };
        let Some(position) = self.geo.position(driver) else {
            return;
        };
        let target = match trip.status {
            TripStatus::DriverAssigned | TripStatus::EnRoutePickup => trip.pickup,
            TripStatus::TripActive => trip.dropoff,
            _ => return,
        };
        let estimate = self.eta.estimate_route(position.location, target);
        if estimate.degraded {
            Counters::incr(&self.counters.degraded_etas);
        }
        if let Err(err) = self.trips.update_estimate(trip_id, &estimate) {
            debug!(trip = %trip_id, %err, "estimate refresh skipped");
        }
    }

    /// Advance a trip from a claimed driver's ping. One ping can cross two
    /// boundaries (first post-assignment ping already inside the pickup
    /// zone), so the checks run in lifecycle order.
    fn progress_trip(&self, trip_id: TripId, at: GeoPoint, now_ms: u64) {
        let Some(trip) = self.trips.get(trip_id) else {
            return;
        };
        match trip.status {
            TripStatus::DriverAssigned => {
                if let Ok(Some(transition)) = self.trips.mark_en_route(trip_id) {
                    self.refresh_trip_estimate(trip_id);
                    self.publish_transition(transition);
                }
                self.check_pickup_arrival(&trip, at, now_ms);
            }
            TripStatus::EnRoutePickup => self.check_pickup_arrival(&trip, at, now_ms),
            TripStatus::TripActive => {
                if distance_m_between_points(at, trip.dropoff)
                    <= self.config.trips.dropoff_proximity_m
                {
                    // Proximity errors are already logged by the store.
                    let _ = self.finish_completed(trip_id, now_ms);
                } else {
                    self.refresh_trip_estimate(trip_id);
                }
            }
            _ => {}
        }
    }

    fn check_pickup_arrival(&self, trip: &Trip, at: GeoPoint, now_ms: u64) {
        if distance_m_between_points(at, trip.pickup) > self.config.trips.pickup_proximity_m {
            self.refresh_trip_estimate(trip.id);
            return;
        }
        if let Ok(Some(transition)) = self.trips.start(trip.id, now_ms) {
            self.refresh_trip_estimate(trip.id);
            self.publish_transition(transition);
        }
    }

    /// Commit COMPLETED, release the driver, and emit the final record.
    fn finish_completed(&self, trip_id: TripId, now_ms: u64) -> Result<Option<Transition>> {
        let completed = self.trips.complete(trip_id, now_ms)?;
        let Some(transition) = completed else {
            return Ok(None);
        };

        let Some(trip) = self.trips.get(trip_id) else {
            return Ok(completed);
        };
        if let Some(driver) = &trip.driver_id {
            self.geo.release(driver, trip_id);
        }
        Counters::incr(&self.counters.trips_completed);
        self.publish_transition(transition);
        if let Some(record) = CompletedTripRecord::from_trip(&trip) {
            info!(
                trip = %trip_id,
                duration_secs = record.trip_duration_secs(),
                eta_drift_minutes = record.eta_drift_minutes(),
                "trip completed"
            );
            self.sink.publish(FleetEvent::TripCompleted(record));
        }
        Ok(completed)
    }

    fn publish_transition(&self, transition: Transition) {
        self.sink
            .publish(FleetEvent::TripStatusChanged(transition.into()));
    }
}

//! Outbound events for external collaborators.
//!
//! The engine publishes every committed trip transition and every completed
//! trip record through an [`EventSink`]. Notification dispatch, payment
//! settlement, and map-overlay services subscribe outside this crate;
//! [`NullSink`] is the default, [`CollectingSink`] backs tests.

use std::sync::Mutex;

use serde::Serialize;

use crate::road_speed::RoadCondition;
use crate::telemetry::CompletedTripRecord;
use crate::trips::{Transition, TripStatus};
use crate::types::TripId;

/// A trip status change, for notification dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct TripStatusChanged {
    pub trip_id: TripId,
    pub old_status: TripStatus,
    pub new_status: TripStatus,
    pub eta_minutes: f64,
    pub distance_km: f64,
}

impl From<Transition> for TripStatusChanged {
    fn from(t: Transition) -> Self {
        Self {
            trip_id: t.trip_id,
            old_status: t.old_status,
            new_status: t.new_status,
            eta_minutes: t.eta_minutes,
            distance_km: t.distance_km,
        }
    }
}

#[derive(Debug, Clone)]
pub enum FleetEvent {
    TripStatusChanged(TripStatusChanged),
    /// Emitted once, at the COMPLETED transition, for settlement and
    /// analytics.
    TripCompleted(CompletedTripRecord),
    /// Road condition snapshot for client map overlays.
    RoadConditions(Vec<RoadCondition>),
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: FleetEvent);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: FleetEvent) {}
}

/// Buffers events in order for assertions.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<FleetEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FleetEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn status_changes(&self) -> Vec<TripStatusChanged> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                FleetEvent::TripStatusChanged(change) => Some(change),
                _ => None,
            })
            .collect()
    }

    pub fn completed_trips(&self) -> Vec<CompletedTripRecord> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                FleetEvent::TripCompleted(record) => Some(record),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn publish(&self, event: FleetEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(old: TripStatus, new: TripStatus) -> FleetEvent {
        FleetEvent::TripStatusChanged(TripStatusChanged {
            trip_id: TripId(1),
            old_status: old,
            new_status: new,
            eta_minutes: 4.2,
            distance_km: 2.1,
        })
    }

    #[test]
    fn collecting_sink_preserves_order() {
        let sink = CollectingSink::new();
        sink.publish(change(TripStatus::Searching, TripStatus::DriverAssigned));
        sink.publish(change(TripStatus::DriverAssigned, TripStatus::EnRoutePickup));

        let changes = sink.status_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].new_status, TripStatus::DriverAssigned);
        assert_eq!(changes[1].new_status, TripStatus::EnRoutePickup);
    }

    #[test]
    fn status_change_serializes_for_dispatch() {
        let event = TripStatusChanged {
            trip_id: TripId(7),
            old_status: TripStatus::TripActive,
            new_status: TripStatus::Completed,
            eta_minutes: 0.0,
            distance_km: 3.4,
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["new_status"], "COMPLETED");
        assert_eq!(json["trip_id"], 7);
    }
}

//! Live driver position index.
//!
//! Positions live in a [`DashMap`] keyed by driver id, so concurrent pings
//! for different drivers never block each other while updates to the same
//! driver are serialized by the entry lock. A secondary H3 cell index powers
//! radius queries. The cell index may lag a position update by a moment;
//! queries always re-read the position map and re-filter by exact distance,
//! so a stale cell entry can only cost a wasted lookup, never a wrong result.
//!
//! The driver claim used by trip assignment is a compare-and-set on the
//! `trip` field, performed under the same entry lock.

use std::collections::{HashSet, VecDeque};

use dashmap::DashMap;
use h3o::{CellIndex, Resolution};
use tracing::debug;

use crate::config::GeoIndexConfig;
use crate::error::{FleetError, Result};
use crate::spatial::{distance_m_between_points, grid_disk_cached, rings_for_radius};
use crate::types::{DriverId, GeoPoint, LocationPing, PositionSource, TripId, VehicleType};

/// Current known state of one driver. At most one record exists per driver;
/// updates are upsert-by-driver-id with last-write-wins by timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverPosition {
    pub driver_id: DriverId,
    pub location: GeoPoint,
    pub speed_kmh: f64,
    /// Normalized into [0, 360).
    pub heading_deg: f64,
    pub accuracy_m: f64,
    pub source: PositionSource,
    pub online: bool,
    pub vehicle_type: VehicleType,
    /// Exclusive claim: the trip this driver is currently assigned to.
    pub trip: Option<TripId>,
    pub updated_at_ms: u64,
}

/// Result of an upsert. Dropped and rejected pings are logged, never errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Applied { cell: CellIndex },
    /// Timestamp older than the stored position; state unchanged.
    DroppedStale,
    /// Malformed ping (bad coordinates, negative speed, zero accuracy).
    Rejected,
}

/// Eligibility filters for radius queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryFilter {
    /// Require the online flag and a fresh (non-stale) position.
    pub online_only: bool,
    pub vehicle_type: Option<VehicleType>,
    /// Skip drivers already claimed by a trip.
    pub exclude_assigned: bool,
}

impl QueryFilter {
    /// The filter the matching engine uses: online, unassigned, and
    /// optionally restricted to a vehicle type.
    pub fn available(vehicle_type: Option<VehicleType>) -> Self {
        Self {
            online_only: true,
            vehicle_type,
            exclude_assigned: true,
        }
    }
}

/// A driver returned from a radius query, with its exact distance to the
/// query center.
#[derive(Debug, Clone)]
pub struct NearbyDriver {
    pub position: DriverPosition,
    pub distance_m: f64,
}

pub struct GeoIndex {
    resolution: Resolution,
    staleness_ttl_ms: u64,
    positions: DashMap<DriverId, DriverPosition>,
    cells: DashMap<CellIndex, Vec<DriverId>>,
    vehicle_types: DashMap<DriverId, VehicleType>,
}

impl GeoIndex {
    pub fn new(config: &GeoIndexConfig) -> Self {
        Self {
            resolution: config.resolution,
            staleness_ttl_ms: config.staleness_ttl_ms,
            positions: DashMap::new(),
            cells: DashMap::new(),
            vehicle_types: DashMap::new(),
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Record a driver's vehicle type (from the account service). Pings from
    /// drivers without a registered type default to [`VehicleType::Car`].
    pub fn set_vehicle_type(&self, driver: &DriverId, vehicle_type: VehicleType) {
        self.vehicle_types.insert(driver.clone(), vehicle_type);
        if let Some(mut pos) = self.positions.get_mut(driver) {
            pos.vehicle_type = vehicle_type;
        }
    }

    /// Upsert a driver position from a ping. Idempotent per driver:
    /// last-write-wins by timestamp, and a ping older than the stored
    /// position is dropped without touching state.
    pub fn upsert(&self, ping: &LocationPing) -> UpsertOutcome {
        if !ping.location.is_valid()
            || !ping.speed_kmh.is_finite()
            || ping.speed_kmh < 0.0
            || !ping.accuracy_m.is_finite()
            || ping.accuracy_m <= 0.0
            || !ping.heading_deg.is_finite()
        {
            debug!(driver = %ping.driver_id, "rejected malformed ping");
            return UpsertOutcome::Rejected;
        }

        // Checked by is_valid above.
        let Some(cell) = ping.location.cell(self.resolution) else {
            debug!(driver = %ping.driver_id, "rejected ping outside coordinate range");
            return UpsertOutcome::Rejected;
        };

        let vehicle_type = self
            .vehicle_types
            .get(&ping.driver_id)
            .map(|v| *v)
            .unwrap_or(VehicleType::Car);

        let old_cell = match self.positions.entry(ping.driver_id.clone()) {
            dashmap::Entry::Occupied(mut entry) => {
                let pos = entry.get_mut();
                if ping.timestamp_ms < pos.updated_at_ms {
                    debug!(
                        driver = %ping.driver_id,
                        ping_ts = ping.timestamp_ms,
                        stored_ts = pos.updated_at_ms,
                        "dropped out-of-order ping"
                    );
                    return UpsertOutcome::DroppedStale;
                }
                let old_cell = pos.location.cell(self.resolution);
                pos.location = ping.location;
                pos.speed_kmh = ping.speed_kmh;
                pos.heading_deg = ping.normalized_heading();
                pos.accuracy_m = ping.accuracy_m;
                pos.source = ping.source;
                pos.online = true;
                pos.vehicle_type = vehicle_type;
                pos.updated_at_ms = ping.timestamp_ms;
                old_cell
            }
            dashmap::Entry::Vacant(entry) => {
                entry.insert(DriverPosition {
                    driver_id: ping.driver_id.clone(),
                    location: ping.location,
                    speed_kmh: ping.speed_kmh,
                    heading_deg: ping.normalized_heading(),
                    accuracy_m: ping.accuracy_m,
                    source: ping.source,
                    online: true,
                    vehicle_type,
                    trip: None,
                    updated_at_ms: ping.timestamp_ms,
                });
                None
            }
        };

        if old_cell != Some(cell) {
            if let Some(old) = old_cell {
                self.remove_from_cell(&ping.driver_id, old);
            }
            self.cells
                .entry(cell)
                .or_default()
                .push(ping.driver_id.clone());
        }

        UpsertOutcome::Applied { cell }
    }

    fn remove_from_cell(&self, driver: &DriverId, cell: CellIndex) {
        if let Some(mut ids) = self.cells.get_mut(&cell) {
            ids.retain(|id| id != driver);
            let now_empty = ids.is_empty();
            drop(ids);
            if now_empty {
                self.cells.remove_if(&cell, |_, ids| ids.is_empty());
            }
        }
    }

    /// Clear the online flag. The position record is retained so the last
    /// known location stays queryable by non-online-only consumers.
    pub fn mark_offline(&self, driver: &DriverId) {
        if let Some(mut pos) = self.positions.get_mut(driver) {
            pos.online = false;
        }
    }

    /// Flag drivers whose last update is older than the staleness TTL as
    /// offline. Returns how many drivers were flagged. Queries also apply
    /// the TTL directly, so a missed sweep never returns a stale driver.
    pub fn sweep_stale(&self, now_ms: u64) -> usize {
        let mut flagged = 0;
        for mut entry in self.positions.iter_mut() {
            if entry.online && now_ms.saturating_sub(entry.updated_at_ms) > self.staleness_ttl_ms {
                entry.online = false;
                flagged += 1;
            }
        }
        if flagged > 0 {
            debug!(count = flagged, "flagged stale drivers offline");
        }
        flagged
    }

    /// Consistent snapshot of one driver's position.
    pub fn position(&self, driver: &DriverId) -> Option<DriverPosition> {
        self.positions.get(driver).map(|p| p.clone())
    }

    /// Atomically claim a driver for a trip (compare-and-set on the `trip`
    /// field). Claiming the same trip again is an idempotent success; any
    /// other holder is a [`FleetError::ClaimConflict`].
    pub fn claim(&self, driver: &DriverId, trip: TripId) -> Result<()> {
        let mut pos = self
            .positions
            .get_mut(driver)
            .ok_or_else(|| FleetError::DriverNotFound(driver.clone()))?;
        match pos.trip {
            None => {
                pos.trip = Some(trip);
                Ok(())
            }
            Some(holder) if holder == trip => Ok(()),
            Some(holder) => Err(FleetError::ClaimConflict {
                driver: driver.clone(),
                holder,
            }),
        }
    }

    /// Release a claim held by `trip`. A release by any other trip is a
    /// no-op, so a cancellation racing a completion cannot strip the claim
    /// the winner installed. Returns whether the claim was released.
    pub fn release(&self, driver: &DriverId, trip: TripId) -> bool {
        if let Some(mut pos) = self.positions.get_mut(driver) {
            if pos.trip == Some(trip) {
                pos.trip = None;
                return true;
            }
        }
        false
    }

    /// Drivers within `radius_m` of `center`, as a lazy, finite, restartable
    /// scan. `iter()` walks candidate cells nearest-first and can be
    /// restarted at will; `collect_sorted()` gives the exact distance order
    /// the matching engine ranks from.
    pub fn query_nearby(
        &self,
        center: GeoPoint,
        radius_m: f64,
        filter: QueryFilter,
        now_ms: u64,
    ) -> NearbyScan<'_> {
        let cells = match center.cell(self.resolution) {
            Some(origin) => {
                let k = rings_for_radius(radius_m, self.resolution);
                let mut cells = grid_disk_cached(origin, k);
                // Nearest cells first so the lazy scan yields close drivers early.
                cells.sort_by(|a, b| {
                    let da = distance_m_between_points(center, latlng_of(*a));
                    let db = distance_m_between_points(center, latlng_of(*b));
                    da.total_cmp(&db)
                });
                cells
            }
            None => Vec::new(),
        };
        NearbyScan {
            index: self,
            center,
            radius_m,
            filter,
            now_ms,
            cells,
        }
    }

    fn eligible(&self, pos: &DriverPosition, filter: &QueryFilter, now_ms: u64) -> bool {
        if filter.online_only {
            if !pos.online {
                return false;
            }
            if now_ms.saturating_sub(pos.updated_at_ms) > self.staleness_ttl_ms {
                return false;
            }
        }
        if let Some(vt) = filter.vehicle_type {
            if pos.vehicle_type != vt {
                return false;
            }
        }
        if filter.exclude_assigned && pos.trip.is_some() {
            return false;
        }
        true
    }
}

fn latlng_of(cell: CellIndex) -> GeoPoint {
    h3o::LatLng::from(cell).into()
}

/// A prepared radius query. Holds no locks; every `iter()` call starts a
/// fresh pass over the candidate cells.
pub struct NearbyScan<'a> {
    index: &'a GeoIndex,
    center: GeoPoint,
    radius_m: f64,
    filter: QueryFilter,
    now_ms: u64,
    cells: Vec<CellIndex>,
}

impl NearbyScan<'_> {
    pub fn iter(&self) -> NearbyIter<'_> {
        NearbyIter {
            scan: self,
            cell_cursor: 0,
            pending: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// All matches sorted by exact distance, ties broken by driver id for
    /// determinism.
    pub fn collect_sorted(&self) -> Vec<NearbyDriver> {
        let mut drivers: Vec<NearbyDriver> = self.iter().collect();
        drivers.sort_by(|a, b| {
            a.distance_m
                .total_cmp(&b.distance_m)
                .then_with(|| a.position.driver_id.cmp(&b.position.driver_id))
        });
        drivers
    }
}

/// Lazy iterator over a [`NearbyScan`]. Yields drivers cell-by-cell in
/// roughly nearest-first order; exact global ordering comes from
/// [`NearbyScan::collect_sorted`].
pub struct NearbyIter<'a> {
    scan: &'a NearbyScan<'a>,
    cell_cursor: usize,
    pending: VecDeque<NearbyDriver>,
    seen: HashSet<DriverId>,
}

impl Iterator for NearbyIter<'_> {
    type Item = NearbyDriver;

    fn next(&mut self) -> Option<NearbyDriver> {
        loop {
            if let Some(driver) = self.pending.pop_front() {
                return Some(driver);
            }
            let cell = *self.scan.cells.get(self.cell_cursor)?;
            self.cell_cursor += 1;

            let Some(ids) = self.scan.index.cells.get(&cell).map(|v| v.clone()) else {
                continue;
            };
            let mut batch: Vec<NearbyDriver> = Vec::new();
            for id in ids {
                if !self.seen.insert(id.clone()) {
                    continue;
                }
                let Some(position) = self.scan.index.position(&id) else {
                    continue;
                };
                if !self
                    .scan
                    .index
                    .eligible(&position, &self.scan.filter, self.scan.now_ms)
                {
                    continue;
                }
                let distance_m = distance_m_between_points(self.scan.center, position.location);
                if distance_m <= self.scan.radius_m {
                    batch.push(NearbyDriver {
                        position,
                        distance_m,
                    });
                }
            }
            batch.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
            self.pending.extend(batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeoIndexConfig;

    fn ping(driver: &str, lat: f64, lng: f64, ts: u64) -> LocationPing {
        LocationPing {
            driver_id: DriverId::new(driver),
            location: GeoPoint::new(lat, lng),
            speed_kmh: 30.0,
            heading_deg: 90.0,
            accuracy_m: 5.0,
            source: PositionSource::Gps,
            timestamp_ms: ts,
        }
    }

    fn index() -> GeoIndex {
        GeoIndex::new(&GeoIndexConfig::default())
    }

    #[test]
    fn upsert_applies_and_creates_record() {
        let geo = index();
        let outcome = geo.upsert(&ping("d1", 52.52, 13.405, 1_000));
        assert!(matches!(outcome, UpsertOutcome::Applied { .. }));

        let pos = geo.position(&DriverId::new("d1")).expect("position");
        assert!(pos.online);
        assert_eq!(pos.updated_at_ms, 1_000);
        assert_eq!(pos.trip, None);
    }

    #[test]
    fn older_timestamp_never_changes_state() {
        let geo = index();
        geo.upsert(&ping("d1", 52.52, 13.405, 2_000));
        let before = geo.position(&DriverId::new("d1")).expect("position");

        let outcome = geo.upsert(&ping("d1", 52.60, 13.50, 1_000));
        assert_eq!(outcome, UpsertOutcome::DroppedStale);

        let after = geo.position(&DriverId::new("d1")).expect("position");
        assert_eq!(before, after);
    }

    #[test]
    fn malformed_ping_rejected() {
        let geo = index();
        let mut bad = ping("d1", 52.52, 13.405, 1_000);
        bad.accuracy_m = 0.0;
        assert_eq!(geo.upsert(&bad), UpsertOutcome::Rejected);

        let mut bad = ping("d1", f64::NAN, 13.405, 1_000);
        bad.driver_id = DriverId::new("d2");
        assert_eq!(geo.upsert(&bad), UpsertOutcome::Rejected);

        let mut bad = ping("d3", 52.52, 13.405, 1_000);
        bad.speed_kmh = -5.0;
        assert_eq!(geo.upsert(&bad), UpsertOutcome::Rejected);

        assert!(geo.is_empty());
    }

    #[test]
    fn query_results_respect_radius() {
        let geo = index();
        let center = GeoPoint::new(52.52, 13.405);
        // ~75m east (0.0011 deg lng at this latitude).
        geo.upsert(&ping("near", 52.52, 13.4061, 1_000));
        // ~2km east.
        geo.upsert(&ping("far", 52.52, 13.4345, 1_000));

        let scan = geo.query_nearby(center, 500.0, QueryFilter::available(None), 1_000);
        let found: Vec<_> = scan.iter().collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].position.driver_id, DriverId::new("near"));
        assert!(found[0].distance_m <= 500.0);
    }

    #[test]
    fn scan_is_restartable() {
        let geo = index();
        geo.upsert(&ping("d1", 52.52, 13.405, 1_000));
        geo.upsert(&ping("d2", 52.5205, 13.4055, 1_000));

        let scan = geo.query_nearby(
            GeoPoint::new(52.52, 13.405),
            1_000.0,
            QueryFilter::available(None),
            1_000,
        );
        let first: Vec<_> = scan.iter().map(|d| d.position.driver_id).collect();
        let second: Vec<_> = scan.iter().map(|d| d.position.driver_id).collect();
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
    }

    #[test]
    fn collect_sorted_orders_by_distance() {
        let geo = index();
        geo.upsert(&ping("far", 52.52, 13.4105, 1_000));
        geo.upsert(&ping("near", 52.52, 13.4055, 1_000));

        let scan = geo.query_nearby(
            GeoPoint::new(52.52, 13.405),
            2_000.0,
            QueryFilter::available(None),
            1_000,
        );
        let sorted = scan.collect_sorted();
        assert_eq!(sorted.len(), 2);
        assert_eq!(sorted[0].position.driver_id, DriverId::new("near"));
        assert!(sorted[0].distance_m <= sorted[1].distance_m);
    }

    #[test]
    fn stale_drivers_are_invisible_and_swept() {
        let geo = index();
        geo.upsert(&ping("d1", 52.52, 13.405, 1_000));

        // 91s later the driver has not pinged again.
        let now = 1_000 + 91_000;
        let scan = geo.query_nearby(
            GeoPoint::new(52.52, 13.405),
            1_000.0,
            QueryFilter::available(None),
            now,
        );
        assert_eq!(scan.iter().count(), 0);

        assert_eq!(geo.sweep_stale(now), 1);
        assert!(!geo.position(&DriverId::new("d1")).expect("pos").online);
        // Sweep is idempotent.
        assert_eq!(geo.sweep_stale(now), 0);
    }

    #[test]
    fn vehicle_type_filter() {
        let geo = index();
        geo.set_vehicle_type(&DriverId::new("moto"), VehicleType::Motorcycle);
        geo.upsert(&ping("moto", 52.52, 13.405, 1_000));
        geo.upsert(&ping("car", 52.5201, 13.4051, 1_000));

        let scan = geo.query_nearby(
            GeoPoint::new(52.52, 13.405),
            1_000.0,
            QueryFilter::available(Some(VehicleType::Motorcycle)),
            1_000,
        );
        let found: Vec<_> = scan.iter().collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].position.driver_id, DriverId::new("moto"));
    }

    #[test]
    fn claimed_drivers_are_excluded_from_available() {
        let geo = index();
        geo.upsert(&ping("d1", 52.52, 13.405, 1_000));
        geo.claim(&DriverId::new("d1"), TripId(1)).expect("claim");

        let scan = geo.query_nearby(
            GeoPoint::new(52.52, 13.405),
            1_000.0,
            QueryFilter::available(None),
            1_000,
        );
        assert_eq!(scan.iter().count(), 0);
    }

    #[test]
    fn claim_is_compare_and_set() {
        let geo = index();
        geo.upsert(&ping("d1", 52.52, 13.405, 1_000));
        let driver = DriverId::new("d1");

        geo.claim(&driver, TripId(1)).expect("first claim");
        // Same trip: idempotent.
        geo.claim(&driver, TripId(1)).expect("re-claim");
        // Other trip: conflict naming the holder.
        match geo.claim(&driver, TripId(2)) {
            Err(FleetError::ClaimConflict { holder, .. }) => assert_eq!(holder, TripId(1)),
            other => panic!("expected claim conflict, got {other:?}"),
        }

        // Release by the non-holder is a no-op.
        assert!(!geo.release(&driver, TripId(2)));
        assert_eq!(geo.position(&driver).expect("pos").trip, Some(TripId(1)));
        // Release by the holder frees the driver.
        assert!(geo.release(&driver, TripId(1)));
        geo.claim(&driver, TripId(2)).expect("claim after release");
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        use std::sync::Arc;

        let geo = Arc::new(index());
        geo.upsert(&ping("d1", 52.52, 13.405, 1_000));

        let mut handles = Vec::new();
        for trip in 1..=8u64 {
            let geo = Arc::clone(&geo);
            handles.push(std::thread::spawn(move || {
                geo.claim(&DriverId::new("d1"), TripId(trip)).is_ok()
            }));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1, "exactly one claim must win");
    }

    #[test]
    fn cell_index_follows_the_driver() {
        let geo = index();
        geo.upsert(&ping("d1", 52.52, 13.405, 1_000));
        // Driver moves ~3km away.
        geo.upsert(&ping("d1", 52.545, 13.42, 2_000));

        let old_spot = geo.query_nearby(
            GeoPoint::new(52.52, 13.405),
            500.0,
            QueryFilter::available(None),
            2_000,
        );
        assert_eq!(old_spot.iter().count(), 0);

        let new_spot = geo.query_nearby(
            GeoPoint::new(52.545, 13.42),
            500.0,
            QueryFilter::available(None),
            2_000,
        );
        assert_eq!(new_spot.iter().count(), 1);
    }

    #[test]
    fn mark_offline_hides_driver() {
        let geo = index();
        geo.upsert(&ping("d1", 52.52, 13.405, 1_000));
        geo.mark_offline(&DriverId::new("d1"));

        let scan = geo.query_nearby(
            GeoPoint::new(52.52, 13.405),
            1_000.0,
            QueryFilter::available(None),
            1_000,
        );
        assert_eq!(scan.iter().count(), 0);
        // A later ping brings the driver back online.
        geo.upsert(&ping("d1", 52.52, 13.405, 2_000));
        assert!(geo.position(&DriverId::new("d1")).expect("pos").online);
    }
}

//! Crowdsourced road-speed model.
//!
//! Each registered road segment keeps a live current speed maintained as an
//! exponential weighted average of driver speed samples, bounded to
//! [0, 2×baseline] to reject outliers. Traffic level is a pure function of
//! the current/baseline ratio. Segments that stop receiving samples decay
//! back toward their baseline so the model never stays pessimistic (or
//! optimistic) on stale data.
//!
//! Samples arrive two ways: direct `record_sample` calls, and
//! `snap_sample`, which matches a driver ping against the nearest segment
//! polyline within the snap corridor.

use dashmap::DashMap;
use h3o::{CellIndex, Resolution};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RoadSpeedConfig;
use crate::spatial::{grid_disk_cached, point_to_polyline_distance_m};
use crate::types::{GeoPoint, SegmentId};

/// Congestion bands derived from the current/baseline speed ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrafficLevel {
    Free,
    Moderate,
    Heavy,
    Blocked,
}

impl TrafficLevel {
    /// Pure derivation from current and baseline speed. Same inputs always
    /// yield the same level:
    ///
    /// - FREE:     ratio >= 0.8
    /// - MODERATE: 0.5 <= ratio < 0.8
    /// - HEAVY:    0.2 <= ratio < 0.5
    /// - BLOCKED:  ratio < 0.2
    pub fn derive(current_kmh: f64, baseline_kmh: f64) -> Self {
        if baseline_kmh <= 0.0 {
            return TrafficLevel::Blocked;
        }
        let ratio = current_kmh / baseline_kmh;
        if ratio >= 0.8 {
            TrafficLevel::Free
        } else if ratio >= 0.5 {
            TrafficLevel::Moderate
        } else if ratio >= 0.2 {
            TrafficLevel::Heavy
        } else {
            TrafficLevel::Blocked
        }
    }
}

/// One road segment with its live speed state.
#[derive(Debug, Clone)]
pub struct RoadSegment {
    pub id: SegmentId,
    /// Ordered polyline, at least two points.
    pub polyline: Vec<GeoPoint>,
    pub baseline_kmh: f64,
    /// Exponentially-weighted live speed, bounded to [0, 2×baseline].
    pub current_kmh: f64,
    pub sample_count: u64,
    pub updated_at_ms: u64,
}

impl RoadSegment {
    pub fn traffic_level(&self) -> TrafficLevel {
        TrafficLevel::derive(self.current_kmh, self.baseline_kmh)
    }
}

/// Outcome of recording one speed sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome {
    Applied { current_kmh: f64 },
    /// Sample outside [0, 2×baseline]; logged, state unchanged.
    Rejected,
    UnknownSegment,
}

/// Where a speed estimate came from, most trusted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedSource {
    /// Live EWMA from recent samples.
    Current,
    /// Segment known but has no samples yet.
    Baseline,
    /// No segment near the query point.
    GlobalDefault,
}

/// A speed estimate for a point or segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedEstimate {
    pub kmh: f64,
    pub source: SpeedSource,
}

/// Client-facing condition snapshot for one segment (map overlays).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoadCondition {
    pub segment_id: SegmentId,
    pub level: TrafficLevel,
    pub current_kmh: f64,
    pub baseline_kmh: f64,
}

pub struct RoadSpeedModel {
    config: RoadSpeedConfig,
    resolution: Resolution,
    segments: DashMap<SegmentId, RoadSegment>,
    /// Tolerance corridor: cells near any polyline vertex map to the
    /// segments passing through them.
    cells: DashMap<CellIndex, Vec<SegmentId>>,
}

impl RoadSpeedModel {
    pub fn new(config: RoadSpeedConfig, resolution: Resolution) -> Self {
        Self {
            config,
            resolution,
            segments: DashMap::new(),
            cells: DashMap::new(),
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Register a road segment. The polyline needs at least two valid
    /// points; current speed starts at baseline.
    pub fn insert_segment(
        &self,
        id: SegmentId,
        polyline: Vec<GeoPoint>,
        baseline_kmh: f64,
    ) -> crate::error::Result<()> {
        if polyline.len() < 2 || polyline.iter().any(|p| !p.is_valid()) {
            return Err(crate::error::FleetError::TransientInput {
                reason: format!("segment {id}: polyline needs >= 2 valid points"),
            });
        }
        if !baseline_kmh.is_finite() || baseline_kmh <= 0.0 {
            return Err(crate::error::FleetError::TransientInput {
                reason: format!("segment {id}: baseline speed must be > 0"),
            });
        }

        // Densify each leg so the corridor has no gaps between far-apart
        // vertices: one sample point per hex edge length along the leg.
        let step_m = crate::spatial::hex_edge_len_m(self.resolution);
        for pair in polyline.windows(2) {
            let leg_m = crate::spatial::distance_m_between_points(pair[0], pair[1]);
            let steps = (leg_m / step_m).ceil().max(1.0) as usize;
            for i in 0..=steps {
                let t = i as f64 / steps as f64;
                let point = GeoPoint::new(
                    pair[0].lat + (pair[1].lat - pair[0].lat) * t,
                    pair[0].lng + (pair[1].lng - pair[0].lng) * t,
                );
                let Some(cell) = point.cell(self.resolution) else {
                    continue;
                };
                for corridor_cell in grid_disk_cached(cell, 1) {
                    let mut ids = self.cells.entry(corridor_cell).or_default();
                    if !ids.contains(&id) {
                        ids.push(id.clone());
                    }
                }
            }
        }

        self.segments.insert(
            id.clone(),
            RoadSegment {
                id,
                polyline,
                baseline_kmh,
                current_kmh: baseline_kmh,
                sample_count: 0,
                updated_at_ms: 0,
            },
        );
        Ok(())
    }

    /// Fold one observed speed into the segment's EWMA. Samples outside
    /// [0, 2×baseline] are rejected as outliers.
    pub fn record_sample(
        &self,
        id: &SegmentId,
        observed_kmh: f64,
        timestamp_ms: u64,
    ) -> SampleOutcome {
        let Some(mut segment) = self.segments.get_mut(id) else {
            return SampleOutcome::UnknownSegment;
        };

        let max = segment.baseline_kmh * 2.0;
        if !observed_kmh.is_finite() || observed_kmh < 0.0 || observed_kmh > max {
            warn!(
                segment = %id,
                observed_kmh,
                baseline_kmh = segment.baseline_kmh,
                "rejected out-of-range speed sample"
            );
            return SampleOutcome::Rejected;
        }

        let w = self.config.ewma_weight;
        let current = (w * observed_kmh + (1.0 - w) * segment.current_kmh).clamp(0.0, max);
        segment.current_kmh = current;
        segment.sample_count += 1;
        segment.updated_at_ms = segment.updated_at_ms.max(timestamp_ms);
        SampleOutcome::Applied {
            current_kmh: current,
        }
    }

    /// Find the nearest segment whose polyline is within the snap corridor
    /// of `point`. Returns the segment id and its distance in meters.
    pub fn nearest_segment(&self, point: GeoPoint) -> Option<(SegmentId, f64)> {
        let cell = point.cell(self.resolution)?;
        let candidates = self.cells.get(&cell).map(|ids| ids.clone())?;

        let mut best: Option<(SegmentId, f64)> = None;
        for id in candidates {
            let Some(segment) = self.segments.get(&id) else {
                continue;
            };
            let distance = point_to_polyline_distance_m(point, &segment.polyline);
            if distance <= self.config.snap_distance_m {
                match &best {
                    Some((_, best_distance)) if distance >= *best_distance => {}
                    _ => best = Some((id.clone(), distance)),
                }
            }
        }
        best
    }

    /// Feed a driver ping into the model: if the ping lies inside a known
    /// segment's snap corridor, record its speed as a sample there.
    pub fn snap_sample(
        &self,
        point: GeoPoint,
        speed_kmh: f64,
        timestamp_ms: u64,
    ) -> Option<SegmentId> {
        let (id, distance) = self.nearest_segment(point)?;
        debug!(segment = %id, distance_m = distance, speed_kmh, "snapped ping to segment");
        match self.record_sample(&id, speed_kmh, timestamp_ms) {
            SampleOutcome::Applied { .. } => Some(id),
            _ => None,
        }
    }

    /// Snapshot of one segment's state.
    pub fn segment(&self, id: &SegmentId) -> Option<RoadSegment> {
        self.segments.get(id).map(|s| s.clone())
    }

    /// Speed to assume on a segment: live EWMA when samples exist, else the
    /// segment baseline. Unknown segments get the global default.
    pub fn speed_for(&self, id: &SegmentId) -> SpeedEstimate {
        match self.segments.get(id) {
            Some(segment) if segment.sample_count > 0 => SpeedEstimate {
                kmh: segment.current_kmh,
                source: SpeedSource::Current,
            },
            Some(segment) => SpeedEstimate {
                kmh: segment.baseline_kmh,
                source: SpeedSource::Baseline,
            },
            None => SpeedEstimate {
                kmh: self.config.global_default_kmh,
                source: SpeedSource::GlobalDefault,
            },
        }
    }

    /// The segment whose indexed corridor contains `point`'s cell, nearest
    /// polyline first. Looser than [`nearest_segment`](Self::nearest_segment):
    /// no meter cutoff, membership in the cell corridor is the tolerance.
    /// Used for ETA decomposition, where route cell centers can sit a full
    /// cell away from the road they follow.
    pub fn segment_covering(&self, point: GeoPoint) -> Option<SegmentId> {
        let cell = point.cell(self.resolution)?;
        let candidates = self.cells.get(&cell).map(|ids| ids.clone())?;

        candidates
            .into_iter()
            .filter_map(|id| {
                let segment = self.segments.get(&id)?;
                let distance = point_to_polyline_distance_m(point, &segment.polyline);
                Some((id, distance))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
    }

    /// Speed to assume at an arbitrary point: the covering segment's
    /// estimate, else the global default.
    pub fn speed_near(&self, point: GeoPoint) -> SpeedEstimate {
        match self.segment_covering(point) {
            Some(id) => self.speed_for(&id),
            None => SpeedEstimate {
                kmh: self.config.global_default_kmh,
                source: SpeedSource::GlobalDefault,
            },
        }
    }

    pub fn global_default_kmh(&self) -> f64 {
        self.config.global_default_kmh
    }

    /// Decay segments with no samples inside the rolling window back toward
    /// baseline. Returns how many segments moved.
    pub fn decay_idle(&self, now_ms: u64) -> usize {
        let mut decayed = 0;
        for mut segment in self.segments.iter_mut() {
            if segment.sample_count == 0 {
                continue;
            }
            if now_ms.saturating_sub(segment.updated_at_ms) < self.config.decay_window_ms {
                continue;
            }
            let gap = segment.baseline_kmh - segment.current_kmh;
            if gap.abs() < 0.1 {
                continue;
            }
            segment.current_kmh += gap * self.config.decay_factor;
            decayed += 1;
        }
        if decayed > 0 {
            debug!(count = decayed, "decayed idle segments toward baseline");
        }
        decayed
    }

    /// Condition snapshot across all segments, for map overlays.
    pub fn conditions(&self) -> Vec<RoadCondition> {
        self.segments
            .iter()
            .map(|segment| RoadCondition {
                segment_id: segment.id.clone(),
                level: segment.traffic_level(),
                current_kmh: segment.current_kmh,
                baseline_kmh: segment.baseline_kmh,
            })
            .collect()
    }
}

//! Parquet export for the analytics collaborator.
//!
//! Completed trips and road-condition snapshots are written as columnar
//! files with a stable schema. Enum columns are exported as small integer
//! codes rather than strings to keep files compact and joins cheap.

use std::error::Error;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Float64Array, StringArray, UInt32Array, UInt64Array, UInt8Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;

use crate::road_speed::{RoadCondition, TrafficLevel};
use crate::telemetry::CompletedTripRecord;

fn u64_field(name: &'static str) -> Field {
    Field::new(name, DataType::UInt64, false)
}

fn u32_field(name: &'static str) -> Field {
    Field::new(name, DataType::UInt32, false)
}

fn u8_field(name: &'static str) -> Field {
    Field::new(name, DataType::UInt8, false)
}

fn f64_field(name: &'static str) -> Field {
    Field::new(name, DataType::Float64, false)
}

fn string_field(name: &'static str) -> Field {
    Field::new(name, DataType::Utf8, false)
}

fn nullable_string_field(name: &'static str) -> Field {
    Field::new(name, DataType::Utf8, true)
}

fn bool_field(name: &'static str) -> Field {
    Field::new(name, DataType::Boolean, false)
}

fn write_record_batch<P: AsRef<Path>>(
    path: P,
    schema: Schema,
    arrays: Vec<ArrayRef>,
) -> Result<(), Box<dyn Error>> {
    let schema = Arc::new(schema);
    let batch = RecordBatch::try_new(schema.clone(), arrays)?;
    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

fn traffic_level_code(level: TrafficLevel) -> u8 {
    match level {
        TrafficLevel::Free => 0,
        TrafficLevel::Moderate => 1,
        TrafficLevel::Heavy => 2,
        TrafficLevel::Blocked => 3,
    }
}

pub fn write_completed_trips_parquet<P: AsRef<Path>>(
    path: P,
    records: &[CompletedTripRecord],
) -> Result<(), Box<dyn Error>> {
    let mut trip_ids = Vec::with_capacity(records.len());
    let mut booking_refs = Vec::with_capacity(records.len());
    let mut passenger_ids = Vec::with_capacity(records.len());
    let mut driver_ids = Vec::with_capacity(records.len());
    let mut pickup_lats = Vec::with_capacity(records.len());
    let mut pickup_lngs = Vec::with_capacity(records.len());
    let mut dropoff_lats = Vec::with_capacity(records.len());
    let mut dropoff_lngs = Vec::with_capacity(records.len());
    let mut distances_km = Vec::with_capacity(records.len());
    let mut original_etas = Vec::with_capacity(records.len());
    let mut eta_drifts = Vec::with_capacity(records.len());
    let mut search_retries = Vec::with_capacity(records.len());
    let mut eta_degraded = Vec::with_capacity(records.len());
    let mut created_at = Vec::with_capacity(records.len());
    let mut assigned_at = Vec::with_capacity(records.len());
    let mut started_at = Vec::with_capacity(records.len());
    let mut ended_at = Vec::with_capacity(records.len());

    for record in records {
        trip_ids.push(record.trip_id.0);
        booking_refs.push(record.booking_ref.clone());
        passenger_ids.push(record.passenger_id.0.clone());
        driver_ids.push(record.driver_id.0.clone());
        pickup_lats.push(record.pickup.lat);
        pickup_lngs.push(record.pickup.lng);
        dropoff_lats.push(record.dropoff.lat);
        dropoff_lngs.push(record.dropoff.lng);
        distances_km.push(record.distance_km);
        original_etas.push(record.original_eta_minutes);
        eta_drifts.push(record.eta_drift_minutes());
        search_retries.push(record.search_retries);
        eta_degraded.push(record.eta_degraded);
        created_at.push(record.created_at_ms);
        assigned_at.push(record.assigned_at_ms);
        started_at.push(record.started_at_ms);
        ended_at.push(record.ended_at_ms);
    }

    let schema = Schema::new(vec![
        u64_field("trip_id"),
        nullable_string_field("booking_ref"),
        string_field("passenger_id"),
        string_field("driver_id"),
        f64_field("pickup_lat"),
        f64_field("pickup_lng"),
        f64_field("dropoff_lat"),
        f64_field("dropoff_lng"),
        f64_field("distance_km"),
        f64_field("original_eta_minutes"),
        f64_field("eta_drift_minutes"),
        u32_field("search_retries"),
        bool_field("eta_degraded"),
        u64_field("created_at_ms"),
        u64_field("assigned_at_ms"),
        u64_field("started_at_ms"),
        u64_field("ended_at_ms"),
    ]);

    let arrays: Vec<ArrayRef> = vec![
        Arc::new(UInt64Array::from(trip_ids)),
        Arc::new(StringArray::from(booking_refs)),
        Arc::new(StringArray::from(passenger_ids)),
        Arc::new(StringArray::from(driver_ids)),
        Arc::new(Float64Array::from(pickup_lats)),
        Arc::new(Float64Array::from(pickup_lngs)),
        Arc::new(Float64Array::from(dropoff_lats)),
        Arc::new(Float64Array::from(dropoff_lngs)),
        Arc::new(Float64Array::from(distances_km)),
        Arc::new(Float64Array::from(original_etas)),
        Arc::new(Float64Array::from(eta_drifts)),
        Arc::new(UInt32Array::from(search_retries)),
        Arc::new(BooleanArray::from(eta_degraded)),
        Arc::new(UInt64Array::from(created_at)),
        Arc::new(UInt64Array::from(assigned_at)),
        Arc::new(UInt64Array::from(started_at)),
        Arc::new(UInt64Array::from(ended_at)),
    ];

    write_record_batch(path, schema, arrays)
}

pub fn write_road_conditions_parquet<P: AsRef<Path>>(
    path: P,
    conditions: &[RoadCondition],
) -> Result<(), Box<dyn Error>> {
    let mut segment_ids = Vec::with_capacity(conditions.len());
    let mut levels = Vec::with_capacity(conditions.len());
    let mut current_kmh = Vec::with_capacity(conditions.len());
    let mut baseline_kmh = Vec::with_capacity(conditions.len());

    for condition in conditions {
        segment_ids.push(condition.segment_id.0.clone());
        levels.push(traffic_level_code(condition.level));
        current_kmh.push(condition.current_kmh);
        baseline_kmh.push(condition.baseline_kmh);
    }

    let schema = Schema::new(vec![
        string_field("segment_id"),
        u8_field("traffic_level"),
        f64_field("current_kmh"),
        f64_field("baseline_kmh"),
    ]);

    let arrays: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(segment_ids)),
        Arc::new(UInt8Array::from(levels)),
        Arc::new(Float64Array::from(current_kmh)),
        Arc::new(Float64Array::from(baseline_kmh)),
    ];

    write_record_batch(path, schema, arrays)
}

pub mod config;
pub mod engine;
pub mod error;
pub mod eta;
pub mod events;
pub mod geo_index;
pub mod matching;
pub mod road_speed;
pub mod routing;
pub mod spatial;
pub mod telemetry;
pub mod telemetry_export;
pub mod trips;
pub mod types;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

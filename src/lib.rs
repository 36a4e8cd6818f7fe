//! Streaming conversion of an Apple Health export into SQLite.
//!
//! `Record`s land in one table per type (`rHeartRate`, `rStepCount`, ...),
//! `ActivitySummary` rows in `activity_summary`, and each `Workout` in
//! `workouts` with its route in `workout_points`.

pub mod archive;
pub mod cli;
pub mod convert;
pub mod database;
pub mod error;
pub mod gpx;
pub mod progress;
pub mod records;
pub mod types;
pub mod utils;
pub mod workouts;
pub mod xml;

pub use error::{Error, Result};

//! Utility functions shared across the mealflow crates.

pub mod formatting;
pub mod helpers;

pub use formatting::truncate_id;
pub use helpers::{current_timestamp, current_timestamp_millis};

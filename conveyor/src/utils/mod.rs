//! Small helpers for ids and timestamps shared across the engine.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// UTC timestamp type used on job records and progress events.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Returns the current UTC time as an ISO 8601 formatted string.
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Generates a random v4 UUID for job ids and lease tokens.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

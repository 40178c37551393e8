//! SQLite helper utilities for type conversion
//!
//! SQLite has no native timestamp or unsigned types; these helpers keep the
//! conversions in one place.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};

// ============================================================================
// Timestamp Helpers (stored as ISO8601 TEXT in SQLite)
// ============================================================================

/// Convert a chrono DateTime to ISO8601 string
#[inline]
pub fn datetime_to_str(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Parse an ISO8601 string to DateTime
#[inline]
pub fn str_to_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Try parsing SQLite's datetime() format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| ndt.and_utc())
                .map_err(|e| anyhow!("Invalid datetime '{}': {}", s, e))
        })
}

// ============================================================================
// Integer Helpers
// ============================================================================

/// Season/episode/year numbers are stored as signed SQLite integers
#[inline]
pub fn u32_to_int(v: Option<u32>) -> Option<i64> {
    v.map(i64::from)
}

#[inline]
pub fn int_to_u32(v: Option<i64>) -> Option<u32> {
    v.and_then(|i| u32::try_from(i).ok())
}

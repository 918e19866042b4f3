//! sqlite has no native timestamp type; we store unix seconds as `INTEGER`
//! rather than leaning on text-formatted RFC3339 columns so that `<=`/`<`
//! comparisons in SQL are plain integer comparisons, not a bet on a
//! particular string format staying lexicographically sortable.

use chrono::{DateTime, TimeZone, Utc};

pub fn to_epoch(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

pub fn from_epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
}

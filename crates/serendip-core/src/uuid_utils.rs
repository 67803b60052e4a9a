//! Time-ordered identifiers.
//!
//! Sketch runs, mining runs and candidate pairs are keyed by UUIDv7. The
//! first 48 bits are the creation time in milliseconds, so ids sort by age
//! and a retention cutoff can be expressed as an id.

use chrono::{DateTime, Utc};
use uuid::{Builder, Uuid};

/// A fresh UUIDv7.
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

/// The smallest UUIDv7 carrying `ts`. Every id created before `ts` sorts
/// below it.
pub fn v7_from_timestamp(ts: &DateTime<Utc>) -> Uuid {
    let millis = ts.timestamp_millis().max(0) as u64;
    Builder::from_unix_timestamp_millis(millis, &[0u8; 10]).into_uuid()
}

/// Whether `id` was minted before `cutoff`. Non-v7 ids are never considered
/// older.
pub fn created_before(id: &Uuid, cutoff: &DateTime<Utc>) -> bool {
    id.get_version_num() == 7 && *id < v7_from_timestamp(cutoff)
}

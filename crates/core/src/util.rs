use std::time::{SystemTime, UNIX_EPOCH};

use ulid::Ulid;

use crate::model::{EpochMs, Id};

/// Returns current unix epoch milliseconds.
pub fn now_ms() -> EpochMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as EpochMs)
        .unwrap_or_default()
}

/// Generates a new record id (ULID string).
pub fn new_id() -> Id {
    Ulid::new().to_string()
}

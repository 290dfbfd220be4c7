//! Global "current time" seam (`spec.md` §9: implementations should inject a
//! clock rather than calling the system clock directly).

use std::time::{SystemTime, UNIX_EPOCH};

/// Source of "now", expressed as seconds since the epoch — the unit every
/// timestamp column in the schema uses (`when_timestamp`, `submitted_at`,
/// `claimed_at`, `complete_at`, `start_time`, `finish_time`).
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// The real clock, used by every production `Connector`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_secs() as i64
    }
}

//! Test-only helpers shared by `bm-db`'s integration tests: a controllable
//! clock and a ready-to-use in-memory connector.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bm_db::{Clock, Connector};

/// A clock tests can advance explicitly, instead of depending on wall-clock
/// time for claim-TTL and completion-timestamp assertions.
pub struct VirtualClock {
    now: AtomicI64,
}

impl VirtualClock {
    pub fn new(start: i64) -> Arc<Self> {
        Arc::new(VirtualClock { now: AtomicI64::new(start) })
    }

    pub fn advance(&self, delta: i64) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set(&self, value: i64) {
        self.now.store(value, Ordering::SeqCst);
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Opens a fresh in-memory sqlite-backed connector with the schema already
/// bootstrapped, wired to a [`VirtualClock`] starting at `start_time`.
pub async fn test_connector(start_time: i64) -> (Arc<Connector>, Arc<VirtualClock>) {
    let clock = VirtualClock::new(start_time);
    let conn = Connector::open("sqlite::memory:", None)
        .await
        .expect("in-memory sqlite connector")
        .with_clock(clock.clone());
    (conn, clock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connector_is_ready_and_uses_the_virtual_clock() {
        let (conn, clock) = test_connector(1_000).await;
        assert_eq!(conn.now(), 1_000);
        clock.advance(50);
        assert_eq!(conn.now(), 1_050);
        assert_eq!(conn.get_version().await.unwrap(), Some(1));
    }
}

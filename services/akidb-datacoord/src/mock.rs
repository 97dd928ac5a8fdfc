//! In-process test doubles.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use akidb_core::{compose_ts, CoreResult, IdAllocator, Timestamp};

/// [`IdAllocator`] with a manually driven clock.
///
/// Ids count up from 1. Timestamps use the configured physical time and bump
/// the logical counter when called repeatedly within the same millisecond.
#[derive(Debug)]
pub struct MockIdAllocator {
    next_id: AtomicI64,
    physical_ms: AtomicU64,
    last: Mutex<Timestamp>,
}

impl Default for MockIdAllocator {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MockIdAllocator {
    pub fn new(physical_ms: u64) -> Self {
        Self {
            next_id: AtomicI64::new(1),
            physical_ms: AtomicU64::new(physical_ms),
            last: Mutex::new(0),
        }
    }

    pub fn physical_ms(&self) -> u64 {
        self.physical_ms.load(Ordering::SeqCst)
    }

    pub fn set_physical_ms(&self, physical_ms: u64) {
        self.physical_ms.fetch_max(physical_ms, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.physical_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Timestamp at the start of the current millisecond.
    pub fn now(&self) -> Timestamp {
        compose_ts(self.physical_ms(), 0)
    }
}

#[async_trait]
impl IdAllocator for MockIdAllocator {
    async fn alloc_id(&self) -> CoreResult<i64> {
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn alloc_timestamp(&self) -> CoreResult<Timestamp> {
        let mut last = self.last.lock();
        let ts = compose_ts(self.physical_ms(), 0).max(*last + 1);
        *last = ts;
        Ok(ts)
    }
}

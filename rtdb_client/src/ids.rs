//! Monotonic client-minted handles: [`QueryId`] and [`RequestId`] (spec §3).

use std::sync::atomic::{AtomicU32, Ordering};

/// Monotonic 32-bit handle naming an active subscription on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u32);

impl QueryId {
    pub fn get(self) -> u32 {
        self.0
    }
}

/// Monotonic 32-bit handle correlating an outbound request with its response.
/// Wraps near 2^31, per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u32);

impl RequestId {
    pub fn get(self) -> u32 {
        self.0
    }
}

const WRAP_LIMIT: u32 = 1 << 31;

/// Allocates monotonic ids that wrap before 2^31, matching
/// `RequestTracker.generate_request_id` in
/// `examples/original_source/src/spacetimedb_sdk/request_tracker.py`.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU32,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self { next: AtomicU32::new(1) }
    }
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_request_id(&self) -> RequestId {
        RequestId(self.next_raw())
    }

    pub fn next_query_id(&self) -> QueryId {
        QueryId(self.next_raw())
    }

    fn next_raw(&self) -> u32 {
        loop {
            let current = self.next.load(Ordering::Relaxed);
            let next = if current >= WRAP_LIMIT { 1 } else { current + 1 };
            if self
                .next
                .compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return current;
            }
        }
    }
}

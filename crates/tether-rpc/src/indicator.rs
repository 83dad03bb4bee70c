//! Per-echo performance counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Call counters recorded at the end of every dispatch.
#[derive(Debug, Default)]
pub struct Indicator {
    calls: AtomicU64,
    failures: AtomicU64,
    total_ns: AtomicU64,
}

impl Indicator {
    pub fn new() -> Self {
        Indicator::default()
    }

    pub fn record(&self, elapsed_ns: u64, success: bool) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.total_ns.fetch_add(elapsed_ns, Ordering::Relaxed);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn total_ns(&self) -> u64 {
        self.total_ns.load(Ordering::Relaxed)
    }

    /// Mean call duration, zero before the first call completes.
    pub fn average_ns(&self) -> u64 {
        let calls = self.calls();
        if calls == 0 { 0 } else { self.total_ns() / calls }
    }
}

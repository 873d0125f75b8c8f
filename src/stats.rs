//! Lock-free accumulators folded into global counters on demand,
//! in place of one process-global mutable struct (spec §9 "Global
//! mutable state"). Per-thread scrubber stats (spec §4.6) are the
//! concrete instance: an atomic counter bundle with a snapshot method.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

#[derive(Debug, Default, Clone, Copy)]
pub struct ScrubStatsSnapshot {
    pub reorganizations: u64,
    pub splits: u64,
    pub underflow_failures: u64,
    pub out_of_filespace_failures: u64,
    pub missing_index_failures: u64,
    pub unknown_failures: u64,
}

/// Per-thread scrubber counters (spec §4.6 "Statistics").
#[derive(Default)]
pub struct ScrubThreadStats {
    pub reorganizations: AtomicU64,
    pub splits: AtomicU64,
    pub underflow_failures: AtomicU64,
    pub out_of_filespace_failures: AtomicU64,
    pub missing_index_failures: AtomicU64,
    pub unknown_failures: AtomicU64,
}

impl ScrubThreadStats {
    pub fn snapshot(&self) -> ScrubStatsSnapshot {
        ScrubStatsSnapshot {
            reorganizations: self.reorganizations.load(Ordering::Relaxed),
            splits: self.splits.load(Ordering::Relaxed),
            underflow_failures: self.underflow_failures.load(Ordering::Relaxed),
            out_of_filespace_failures: self.out_of_filespace_failures.load(Ordering::Relaxed),
            missing_index_failures: self.missing_index_failures.load(Ordering::Relaxed),
            unknown_failures: self.unknown_failures.load(Ordering::Relaxed),
        }
    }
}

/// Global fold point (spec §4.6: "On space completion these are folded
/// into global counters under a single statistics mutex").
#[derive(Default)]
pub struct GlobalScrubStats {
    inner: Mutex<ScrubStatsSnapshot>,
}

impl GlobalScrubStats {
    pub fn fold(&self, thread_stats: &ScrubThreadStats) {
        let s = thread_stats.snapshot();
        let mut g = self.inner.lock();
        g.reorganizations += s.reorganizations;
        g.splits += s.splits;
        g.underflow_failures += s.underflow_failures;
        g.out_of_filespace_failures += s.out_of_filespace_failures;
        g.missing_index_failures += s.missing_index_failures;
        g.unknown_failures += s.unknown_failures;
    }

    pub fn snapshot(&self) -> ScrubStatsSnapshot {
        *self.inner.lock()
    }
}

//! Per-device statistics: request counters plus per-state residency
//! and timing for the chunk cache.

use std::sync::atomic::{AtomicU64, Ordering};

/// Number of chunk cache entry states. Must shadow the state enum in
/// `chunkdata`.
pub const NR_STATES: usize = 12;

#[derive(Default)]
pub struct DeviceStats {
    state_count: [AtomicU64; NR_STATES],
    state_time_us: [AtomicU64; NR_STATES],
    state_time_samples: [AtomicU64; NR_STATES],
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub chunk_reads: AtomicU64,
    pub chunk_writes: AtomicU64,
    pub whole_chunk_updates: AtomicU64,
    pub encrypted_discards: AtomicU64,
    pub chunk_errors: AtomicU64,
    pub cache_alloc_failures: AtomicU64,
    pub sectors_read: AtomicU64,
    pub sectors_written: AtomicU64,
}

impl DeviceStats {
    /// Record an entry entering a state (at entry allocation, with no
    /// previous state).
    pub fn state_entered(&self, state: usize) {
        self.state_count[state].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a timestamped transition out of `from` into `to`.
    pub fn state_transition(&self, from: usize, to: usize, elapsed_us: u64) {
        self.state_count[from].fetch_sub(1, Ordering::Relaxed);
        self.state_count[to].fetch_add(1, Ordering::Relaxed);
        self.state_time_us[from].fetch_add(elapsed_us, Ordering::Relaxed);
        self.state_time_samples[from].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let read = |a: &AtomicU64| a.load(Ordering::Relaxed);
        let mut state_count = [0u64; NR_STATES];
        let mut state_time_us = [0u64; NR_STATES];
        let mut state_time_samples = [0u64; NR_STATES];
        for i in 0..NR_STATES {
            state_count[i] = read(&self.state_count[i]);
            state_time_us[i] = read(&self.state_time_us[i]);
            state_time_samples[i] = read(&self.state_time_samples[i]);
        }
        StatsSnapshot {
            state_count,
            state_time_us,
            state_time_samples,
            cache_hits: read(&self.cache_hits),
            cache_misses: read(&self.cache_misses),
            chunk_reads: read(&self.chunk_reads),
            chunk_writes: read(&self.chunk_writes),
            whole_chunk_updates: read(&self.whole_chunk_updates),
            encrypted_discards: read(&self.encrypted_discards),
            chunk_errors: read(&self.chunk_errors),
            cache_alloc_failures: read(&self.cache_alloc_failures),
            sectors_read: read(&self.sectors_read),
            sectors_written: read(&self.sectors_written),
        }
    }
}

/// Point-in-time copy of the counters, for the statistics surface.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub state_count: [u64; NR_STATES],
    pub state_time_us: [u64; NR_STATES],
    pub state_time_samples: [u64; NR_STATES],
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub chunk_reads: u64,
    pub chunk_writes: u64,
    pub whole_chunk_updates: u64,
    pub encrypted_discards: u64,
    pub chunk_errors: u64,
    pub cache_alloc_failures: u64,
    pub sectors_read: u64,
    pub sectors_written: u64,
}

impl StatsSnapshot {
    /// Total entries across all states; always equals the configured
    /// cache size once the entry table is allocated.
    pub fn total_entries(&self) -> u64 {
        self.state_count.iter().sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transitions_preserve_total() {
        let stats = DeviceStats::default();
        for _ in 0..4 {
            stats.state_entered(0);
        }
        stats.state_transition(0, 1, 10);
        stats.state_transition(1, 6, 25);
        let snap = stats.snapshot();
        assert_eq!(snap.total_entries(), 4);
        assert_eq!(snap.state_count[0], 3);
        assert_eq!(snap.state_count[6], 1);
        assert_eq!(snap.state_time_us[1], 25);
        assert_eq!(snap.state_time_samples[0], 1);
    }
}

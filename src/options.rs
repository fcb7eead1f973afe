//! Configuration options for rilldb.

use std::time::Duration;

/// Default arena block size (4KB).
pub const DEFAULT_ARENA_BLOCK_SIZE: usize = 4 * 1024;

/// Default number of entries between block restart points.
pub const DEFAULT_BLOCK_RESTART_INTERVAL: usize = 16;

/// Default yield-phase bound when adaptive yield is enabled (microseconds).
pub const DEFAULT_MAX_YIELD_USEC: u64 = 100;

/// Default threshold above which a single yield counts as slow
/// (microseconds).
pub const DEFAULT_SLOW_YIELD_USEC: u64 = 3;

/// WAL sync mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Sync on every write (safest, slowest).
    Always,
    /// Sync at intervals (balanced).
    Interval {
        /// Interval between syncs.
        interval: Duration,
    },
    /// Sync after N bytes written.
    Bytes {
        /// Number of bytes before sync.
        bytes: usize,
    },
    /// Let OS decide when to sync (fastest, may lose recent writes on crash).
    None,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Interval {
            interval: Duration::from_millis(100),
        }
    }
}

/// Store-wide configuration options recognized by this core.
#[derive(Debug, Clone)]
pub struct Options {
    // === Write coordinator ===
    /// Enable the yield phase of the adaptive wait.
    pub enable_write_thread_adaptive_yield: bool,

    /// Upper bound on the yield-phase duration in microseconds.
    pub write_thread_max_yield_usec: u64,

    /// Threshold above which a single yield is considered slow, in
    /// microseconds.
    pub write_thread_slow_yield_usec: u64,

    /// Permit followers to write their own batches into the memtable in
    /// parallel with the leader.
    pub allow_concurrent_memtable_write: bool,

    /// Split the WAL and memtable stages so a new WAL group can form while
    /// the previous group is still being ingested.
    pub enable_pipelined_write: bool,

    // === WAL ===
    /// Reuse log files, writing recyclable records that carry the log
    /// number in their headers.
    pub recycle_log_files: bool,

    /// Sync mode for WAL durability.
    pub sync_mode: SyncMode,

    // === MemTable ===
    /// Slab size for the memtable arena. Clamped to the supported range
    /// when the arena is constructed.
    pub arena_block_size: usize,

    // === Block layer ===
    /// Number of entries between restart points in built blocks.
    pub block_restart_interval: usize,

    /// Granularity of the read-amplification bitmap in bytes per bit
    /// (rounded down to a power of two; 0 disables the bitmap).
    pub read_amp_bytes_per_bit: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            enable_write_thread_adaptive_yield: true,
            write_thread_max_yield_usec: DEFAULT_MAX_YIELD_USEC,
            write_thread_slow_yield_usec: DEFAULT_SLOW_YIELD_USEC,
            allow_concurrent_memtable_write: true,
            enable_pipelined_write: false,
            recycle_log_files: false,
            sync_mode: SyncMode::default(),
            arena_block_size: DEFAULT_ARENA_BLOCK_SIZE,
            block_restart_interval: DEFAULT_BLOCK_RESTART_INTERVAL,
            read_amp_bytes_per_bit: 0,
        }
    }
}

impl Options {
    /// Effective yield-phase bound: zero unless adaptive yield is enabled.
    pub fn max_yield_usec(&self) -> u64 {
        if self.enable_write_thread_adaptive_yield {
            self.write_thread_max_yield_usec
        } else {
            0
        }
    }
}

/// Per-write options carried by each writer into the coordinator.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Sync the WAL before the write is acknowledged.
    pub sync: bool,

    /// Skip the WAL entirely for this write.
    pub disable_wal: bool,

    /// Fail with `Incomplete("Write stall")` instead of waiting when a
    /// write stall is in effect.
    pub no_slowdown: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert!(opts.enable_write_thread_adaptive_yield);
        assert_eq!(opts.write_thread_max_yield_usec, 100);
        assert_eq!(opts.write_thread_slow_yield_usec, 3);
        assert_eq!(opts.arena_block_size, DEFAULT_ARENA_BLOCK_SIZE);
        assert!(!opts.enable_pipelined_write);
    }

    #[test]
    fn test_max_yield_usec_gated_by_adaptive_flag() {
        let mut opts = Options::default();
        assert_eq!(opts.max_yield_usec(), 100);

        opts.enable_write_thread_adaptive_yield = false;
        assert_eq!(opts.max_yield_usec(), 0);
    }
}

//! Read-amplification bitmap.
//!
//! Maps block bytes onto a bitmap at `bytes_per_bit` granularity. Each
//! value read marks the range it consumed; the first touch of a bit adds
//! the covered byte count to the statistics sink, so the ratio of useful
//! bytes to total block bytes estimates read amplification.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::metrics::Stats;
use crate::util::random;

/// Bits per bitmap word.
const BITS_PER_ENTRY: u32 = 32;

/// Bitmap of consumed block bytes.
#[derive(Debug)]
pub struct BlockReadAmpBitmap {
    /// One bit per `bytes_per_bit` block bytes.
    bitmap: Vec<AtomicU32>,
    /// log2 of the granularity.
    bytes_per_bit_pow: u8,
    /// Random grid shift in `[0, bytes_per_bit)`, so bucket boundaries do
    /// not systematically align with entry boundaries.
    rnd: u32,
    /// Statistics sink; the owning store may re-point it after handoff.
    stats: ArcSwapOption<Stats>,
}

impl BlockReadAmpBitmap {
    /// Create a bitmap covering `block_size` bytes at `bytes_per_bit`
    /// granularity (rounded down to a power of two).
    pub fn new(block_size: usize, bytes_per_bit: usize, stats: Option<Arc<Stats>>) -> Self {
        assert!(block_size > 0 && bytes_per_bit > 0);

        let mut bytes_per_bit_pow = 0u8;
        let mut b = bytes_per_bit;
        while b > 1 {
            b >>= 1;
            bytes_per_bit_pow += 1;
        }

        let rnd = random::with_tls_random(|r| r.uniform(1u64 << bytes_per_bit_pow)) as u32;

        let num_bits_needed = ((block_size - 1) >> bytes_per_bit_pow) + 1;
        let bitmap_size = (num_bits_needed - 1) / BITS_PER_ENTRY as usize + 1;

        let bitmap = (0..bitmap_size).map(|_| AtomicU32::new(0)).collect();

        if let Some(ref stats) = stats {
            stats.read_amp_total_read_bytes.add(block_size as u64);
        }

        Self {
            bitmap,
            bytes_per_bit_pow,
            rnd,
            stats: ArcSwapOption::from(stats),
        }
    }

    /// Mark the inclusive byte range `[start_offset, end_offset]` as read.
    pub fn mark(&self, start_offset: u32, end_offset: u32) {
        debug_assert!(end_offset >= start_offset);

        let bit = 1u32 << self.bytes_per_bit_pow;
        // Index of the first bucket fully covered by the range, and one
        // past the last.
        let start_bit = (start_offset + bit - self.rnd - 1) >> self.bytes_per_bit_pow;
        let exclusive_end_bit = (end_offset + bit - self.rnd) >> self.bytes_per_bit_pow;
        if start_bit >= exclusive_end_bit {
            return;
        }

        if !self.get_and_set(start_bit) {
            let new_useful_bytes =
                u64::from(exclusive_end_bit - start_bit) << self.bytes_per_bit_pow;
            if let Some(stats) = self.stats.load_full() {
                stats.read_amp_estimate_useful_bytes.add(new_useful_bytes);
            }
        }
    }

    /// Get the bit at `bit_idx` and set it, returning the previous value.
    fn get_and_set(&self, bit_idx: u32) -> bool {
        let entry_idx = (bit_idx / BITS_PER_ENTRY) as usize;
        let bit_mask = 1u32 << (bit_idx % BITS_PER_ENTRY);

        self.bitmap[entry_idx].fetch_or(bit_mask, Ordering::Relaxed) & bit_mask != 0
    }

    /// Granularity in bytes per bit.
    pub fn bytes_per_bit(&self) -> u32 {
        1 << self.bytes_per_bit_pow
    }

    /// Replace the statistics sink.
    pub fn set_statistics(&self, stats: Arc<Stats>) {
        self.stats.store(Some(stats));
    }

    /// Approximate heap footprint of the bitmap.
    pub fn approximate_memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.bitmap.capacity() * std::mem::size_of::<AtomicU32>()
    }

    #[cfg(test)]
    pub(crate) fn rnd(&self) -> u32 {
        self.rnd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(block_size: usize, bytes_per_bit: usize) -> (BlockReadAmpBitmap, Arc<Stats>) {
        let stats = Arc::new(Stats::new());
        let bitmap = BlockReadAmpBitmap::new(block_size, bytes_per_bit, Some(stats.clone()));
        (bitmap, stats)
    }

    #[test]
    fn test_total_bytes_recorded_up_front() {
        let (_bitmap, stats) = fresh(4096, 32);
        assert_eq!(stats.read_amp_total_read_bytes.get(), 4096);
        assert_eq!(stats.read_amp_estimate_useful_bytes.get(), 0);
    }

    #[test]
    fn test_power_of_two_rounding() {
        let (bitmap, _) = fresh(4096, 48);
        assert_eq!(bitmap.bytes_per_bit(), 32);
        assert!(bitmap.rnd() < 48 as u32);
    }

    #[test]
    fn test_first_touch_counts_once() {
        let (bitmap, stats) = fresh(4096, 1);
        // bytes_per_bit == 1: every byte is its own bucket and rnd == 0.
        bitmap.mark(100, 199);
        let first = stats.read_amp_estimate_useful_bytes.get();
        assert_eq!(first, 100);

        // Marking the same range again touches an already-set bit.
        bitmap.mark(100, 199);
        assert_eq!(stats.read_amp_estimate_useful_bytes.get(), first);
    }

    #[test]
    fn test_useful_never_exceeds_total() {
        let (bitmap, stats) = fresh(4096, 16);
        for start in (0..4096u32).step_by(64) {
            bitmap.mark(start, start + 63);
        }
        assert!(
            stats.read_amp_estimate_useful_bytes.get()
                <= stats.read_amp_total_read_bytes.get() + bitmap.bytes_per_bit() as u64
        );
    }

    #[test]
    fn test_set_statistics_repoints() {
        let (bitmap, old_stats) = fresh(1024, 1);
        let new_stats = Arc::new(Stats::new());
        bitmap.set_statistics(new_stats.clone());

        bitmap.mark(0, 63);
        assert_eq!(old_stats.read_amp_estimate_useful_bytes.get(), 0);
        assert_eq!(new_stats.read_amp_estimate_useful_bytes.get(), 64);
    }
}

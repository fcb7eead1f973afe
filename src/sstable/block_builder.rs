//! Block builders for data and index blocks.
//!
//! Builds blocks with prefix compression and restart points. Keys must be
//! added in sorted order.

use bytes::{BufMut, Bytes, BytesMut};

use crate::util::coding::{encode_varint32, encode_varint64};

use super::{BlockHandle, DEFAULT_BLOCK_SIZE};

/// Default number of entries between restart points.
pub const DEFAULT_RESTART_INTERVAL: usize = 16;

/// Builder for SSTable data blocks.
///
/// Uses prefix compression to reduce key storage overhead, with restart
/// points for efficient binary search.
pub struct BlockBuilder {
    /// Buffer for block data.
    buffer: BytesMut,
    /// Restart point offsets.
    restarts: Vec<u32>,
    /// Number of entries since the last restart.
    counter: usize,
    /// Restart interval.
    restart_interval: usize,
    /// Last key added (for prefix compression).
    last_key: Vec<u8>,
    /// Whether `finish` has been called.
    finished: bool,
    /// Target block size.
    block_size: usize,
}

impl BlockBuilder {
    /// Create a new block builder with default settings.
    pub fn new() -> Self {
        Self::with_options(DEFAULT_BLOCK_SIZE, DEFAULT_RESTART_INTERVAL)
    }

    /// Create a block builder configured from store options.
    pub fn from_options(options: &crate::options::Options) -> Self {
        Self::with_options(DEFAULT_BLOCK_SIZE, options.block_restart_interval)
    }

    /// Create a new block builder with custom options.
    pub fn with_options(block_size: usize, restart_interval: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(block_size),
            restarts: vec![0],
            counter: 0,
            restart_interval: restart_interval.max(1),
            last_key: Vec::new(),
            finished: false,
            block_size,
        }
    }

    /// Add a key-value pair to the block.
    ///
    /// Keys must be added in sorted order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);
        debug_assert!(
            self.last_key.is_empty() || key > self.last_key.as_slice(),
            "keys must be added in sorted order"
        );

        let shared = if self.counter < self.restart_interval {
            let min_len = std::cmp::min(self.last_key.len(), key.len());
            let mut shared = 0;
            while shared < min_len && self.last_key[shared] == key[shared] {
                shared += 1;
            }
            shared
        } else {
            // Start a new restart point: the key is stored whole.
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
            0
        };

        let non_shared = key.len() - shared;

        // Entry: shared_len | non_shared_len | value_len | key_delta | value
        encode_varint32(&mut self.buffer, shared as u32);
        encode_varint32(&mut self.buffer, non_shared as u32);
        encode_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.put_slice(&key[shared..]);
        self.buffer.put_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// Check if the block is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Current size of the block if finished now.
    pub fn current_size(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    /// Check if adding more entries would exceed the target size.
    pub fn should_flush(&self) -> bool {
        self.current_size() >= self.block_size
    }

    /// Finish building the block and return its bytes.
    pub fn finish(&mut self) -> Bytes {
        debug_assert!(!self.finished);
        self.finished = true;

        for &restart in &self.restarts {
            self.buffer.put_u32_le(restart);
        }
        self.buffer.put_u32_le(self.restarts.len() as u32);

        self.buffer.clone().freeze()
    }

    /// Reset the builder for reuse.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.last_key.clear();
        self.finished = false;
    }
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for index blocks whose values are [`BlockHandle`]s.
///
/// With delta encoding enabled, the first value in each restart interval
/// is a fully encoded handle; later values carry only the handle size, and
/// readers recover offsets by running sum. Prefix-hash seek assumes a
/// restart interval of 1, which is also the layout that makes binary seek
/// land exactly on entries.
pub struct IndexBlockBuilder {
    inner: BlockBuilder,
    /// Whether values after a restart carry only the size delta.
    value_delta_encoded: bool,
    scratch: BytesMut,
}

impl IndexBlockBuilder {
    /// Create an index builder.
    pub fn new(restart_interval: usize, value_delta_encoded: bool) -> Self {
        Self {
            inner: BlockBuilder::with_options(DEFAULT_BLOCK_SIZE, restart_interval),
            value_delta_encoded,
            scratch: BytesMut::new(),
        }
    }

    /// Add a separator key and the handle of the block it covers.
    pub fn add(&mut self, key: &[u8], handle: &BlockHandle) {
        let at_restart = self.inner.counter >= self.inner.restart_interval
            || self.inner.buffer.is_empty();

        self.scratch.clear();
        if self.value_delta_encoded && !at_restart {
            encode_varint64(&mut self.scratch, handle.size());
        } else {
            handle.encode_to(&mut self.scratch);
        }

        let value = self.scratch.split().freeze();
        self.inner.add(key, &value);
    }

    /// Check if the block is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Current size of the block if finished now.
    pub fn current_size(&self) -> usize {
        self.inner.current_size()
    }

    /// Finish building the index block and return its bytes.
    pub fn finish(&mut self) -> Bytes {
        self.inner.finish()
    }

    /// Whether this builder emits delta-encoded values.
    pub fn value_delta_encoded(&self) -> bool {
        self.value_delta_encoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sstable::Block;
    use crate::util::comparator::BytewiseComparator;

    #[test]
    fn test_block_builder_empty() {
        let builder = BlockBuilder::new();
        assert!(builder.is_empty());
    }

    #[test]
    fn test_block_builder_single_entry() {
        let mut builder = BlockBuilder::new();
        builder.add(b"key", b"value");
        assert!(!builder.is_empty());

        let data = builder.finish();
        let block = Block::new(data).unwrap();
        assert_eq!(block.num_restarts(), 1);

        let cmp = BytewiseComparator::new();
        let mut iter = block.data_iter(&cmp);
        iter.seek_to_first();
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key");
        assert_eq!(iter.value(), b"value");

        iter.next();
        assert!(!iter.valid());
    }

    #[test]
    fn test_block_builder_restart_points() {
        let mut builder = BlockBuilder::with_options(4096, 2);

        for i in 0..6 {
            let key = format!("key_{:02}", i);
            builder.add(key.as_bytes(), b"value");
        }

        let data = builder.finish();
        let block = Block::new(data).unwrap();

        // Interval 2 with 6 entries yields 3 restart points.
        assert_eq!(block.num_restarts(), 3);
    }

    #[test]
    fn test_block_builder_prefix_compression() {
        let mut builder = BlockBuilder::with_options(4096, 16);

        for i in 0..10 {
            let key = format!("prefix_{:04}", i);
            let value = format!("value_{}", i);
            builder.add(key.as_bytes(), value.as_bytes());
        }

        let data = builder.finish();
        // 11-byte keys with ~7-byte values would be ~180 bytes raw; shared
        // prefixes should shrink that noticeably.
        assert!(data.len() < 180);
    }

    #[test]
    fn test_block_builder_reset() {
        let mut builder = BlockBuilder::new();
        builder.add(b"key1", b"value1");
        builder.finish();

        builder.reset();
        assert!(builder.is_empty());

        builder.add(b"key2", b"value2");
        let data = builder.finish();
        let block = Block::new(data).unwrap();

        let cmp = BytewiseComparator::new();
        let mut iter = block.data_iter(&cmp);
        iter.seek_to_first();
        assert_eq!(iter.key(), b"key2");
    }

    #[test]
    fn test_index_builder_full_handles() {
        let mut builder = IndexBlockBuilder::new(1, false);
        builder.add(b"k1", &BlockHandle::new(0, 100));
        builder.add(b"k2", &BlockHandle::new(100, 250));

        let data = builder.finish();
        let block = Block::new(data).unwrap();

        let cmp = BytewiseComparator::new();
        let mut iter = block.index_iter(&cmp, false, true, None);
        iter.seek_to_first();
        assert!(iter.valid());
        assert_eq!(iter.handle(), BlockHandle::new(0, 100));
        iter.next();
        assert_eq!(iter.handle(), BlockHandle::new(100, 250));
    }

    #[test]
    fn test_index_builder_delta_encoding_smaller() {
        let handles: Vec<BlockHandle> = (0..64u64)
            .scan(0u64, |offset, i| {
                let size = 4000 + i;
                let handle = BlockHandle::new(*offset, size);
                *offset += size;
                Some(handle)
            })
            .collect();

        let build = |delta: bool| {
            let mut builder = IndexBlockBuilder::new(16, delta);
            for (i, handle) in handles.iter().enumerate() {
                builder.add(format!("key_{:03}", i).as_bytes(), handle);
            }
            builder.finish()
        };

        assert!(build(true).len() < build(false).len());
    }
}

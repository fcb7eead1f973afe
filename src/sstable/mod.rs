//! SSTable block layer: layout, construction, and iteration.
//!
//! # Block format
//!
//! ```text
//! +------------------+
//! | Entry 1          |  shared_len | unshared_len | value_len | key_delta | value
//! +------------------+
//! | ...              |
//! +------------------+
//! | Restart Point 0  |  (4 bytes, little-endian offset)
//! +------------------+
//! | ...              |
//! +------------------+
//! | Num Restarts     |  (4 bytes, little-endian)
//! +------------------+
//! ```
//!
//! Keys are prefix-compressed against their predecessor; at every restart
//! point the key is stored whole (`shared_len == 0`), so iterators can
//! binary-search the restart array and scan forward within an interval.
//!
//! Index blocks store [`BlockHandle`] values, optionally delta-encoded:
//! the first value in a restart interval is a full handle, later values
//! carry only their size, with offsets recovered by running sum.

mod block;
mod block_builder;
mod iterator;
mod prefix_index;
mod read_amp;

pub use block::Block;
pub use block_builder::{BlockBuilder, IndexBlockBuilder};
pub use iterator::{DataBlockIter, IndexBlockIter};
pub use prefix_index::{BlockPrefixIndex, BlockPrefixIndexBuilder};
pub use read_amp::BlockReadAmpBitmap;

use bytes::BytesMut;

use crate::util::coding::{decode_varint64, encode_varint64};
use crate::{Error, Result};

/// Target size for built data blocks (4KB).
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024;

/// Global sequence number value meaning "no override".
pub const DISABLE_GLOBAL_SEQUENCE_NUMBER: u64 = 0;

/// Handle to a block within an SSTable file.
///
/// Offset and size are varint-encoded so index blocks stay dense.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHandle {
    /// Offset within the file.
    offset: u64,
    /// Size of the block.
    size: u64,
}

impl BlockHandle {
    /// Maximum encoded length of a handle (two varint64s).
    pub const MAX_ENCODED_LENGTH: usize = 20;

    /// Create a new block handle.
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Get the offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Get the size.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Encode to a buffer as two varints.
    pub fn encode_to(&self, buf: &mut BytesMut) {
        encode_varint64(buf, self.offset);
        encode_varint64(buf, self.size);
    }

    /// Decode from a buffer, advancing it.
    pub fn decode(data: &mut &[u8]) -> Result<Self> {
        let offset =
            decode_varint64(data).ok_or_else(|| Error::corruption("bad handle offset"))?;
        let size = decode_varint64(data).ok_or_else(|| Error::corruption("bad handle size"))?;
        Ok(Self { offset, size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_handle_roundtrip() {
        for (offset, size) in [(0u64, 0u64), (100, 200), (1 << 40, 1 << 20)] {
            let handle = BlockHandle::new(offset, size);
            let mut buf = BytesMut::new();
            handle.encode_to(&mut buf);

            let mut cursor = &buf[..];
            let decoded = BlockHandle::decode(&mut cursor).unwrap();
            assert_eq!(decoded, handle);
            assert!(cursor.is_empty());
        }
    }

    #[test]
    fn test_block_handle_decode_truncated() {
        let handle = BlockHandle::new(1 << 40, 7);
        let mut buf = BytesMut::new();
        handle.encode_to(&mut buf);

        let mut cursor = &buf[..2];
        assert!(BlockHandle::decode(&mut cursor).is_err());
    }
}

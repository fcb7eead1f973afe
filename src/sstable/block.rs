//! Block parsing and iterator factories.

use std::sync::Arc;

use bytes::Bytes;

use crate::metrics::Stats;
use crate::util::comparator::Comparator;
use crate::{Error, Result};

use super::{
    BlockPrefixIndex, BlockReadAmpBitmap, DataBlockIter, IndexBlockIter,
    DISABLE_GLOBAL_SEQUENCE_NUMBER,
};

/// A parsed block.
///
/// Owns the raw bytes and the eagerly decoded restart-array geometry;
/// iterators borrow from it.
pub struct Block {
    /// The raw block data: entries, restart array, restart count.
    data: Bytes,
    /// Offset of the restart array.
    restart_offset: u32,
    /// Number of restart points.
    num_restarts: u32,
    /// Sequence override applied to decoded keys; zero disables it.
    global_seqno: u64,
    /// Read-amplification bitmap, present when the owner asked for one.
    read_amp_bitmap: Option<BlockReadAmpBitmap>,
}

impl Block {
    /// Parse a block with no sequence override and no read-amp tracking.
    pub fn new(data: Bytes) -> Result<Self> {
        Self::with_options(data, DISABLE_GLOBAL_SEQUENCE_NUMBER, 0, None)
    }

    /// Parse a block configured from store options, attaching a read-amp
    /// bitmap when the store asks for one.
    pub fn from_options(
        data: Bytes,
        options: &crate::options::Options,
        stats: Option<Arc<Stats>>,
    ) -> Result<Self> {
        Self::with_options(
            data,
            DISABLE_GLOBAL_SEQUENCE_NUMBER,
            options.read_amp_bytes_per_bit,
            stats,
        )
    }

    /// Parse a block.
    ///
    /// `global_seqno` of zero means no override. A non-zero
    /// `read_amp_bytes_per_bit` attaches a read-amp bitmap feeding
    /// `stats`.
    pub fn with_options(
        data: Bytes,
        global_seqno: u64,
        read_amp_bytes_per_bit: usize,
        stats: Option<Arc<Stats>>,
    ) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::corruption("block too short"));
        }

        let num_restarts = u32::from_le_bytes(data[data.len() - 4..].try_into().unwrap());

        let restart_array_size = num_restarts as u64 * 4;
        if (data.len() as u64) < 4 + restart_array_size {
            return Err(Error::corruption("block too short for restart array"));
        }

        let restart_offset = (data.len() as u64 - 4 - restart_array_size) as u32;

        let read_amp_bitmap = if read_amp_bytes_per_bit > 0 && restart_offset > 0 {
            Some(BlockReadAmpBitmap::new(
                restart_offset as usize,
                read_amp_bytes_per_bit,
                stats,
            ))
        } else {
            None
        };

        Ok(Self {
            data,
            restart_offset,
            num_restarts,
            global_seqno,
            read_amp_bitmap,
        })
    }

    /// Raw block bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Block size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Number of restart points.
    pub fn num_restarts(&self) -> u32 {
        self.num_restarts
    }

    /// Offset of the restart array.
    pub(crate) fn restart_offset(&self) -> u32 {
        self.restart_offset
    }

    /// The configured sequence override (zero when disabled).
    pub fn global_seqno(&self) -> u64 {
        self.global_seqno
    }

    /// The read-amp bitmap, if one was attached.
    pub fn read_amp_bitmap(&self) -> Option<&BlockReadAmpBitmap> {
        self.read_amp_bitmap.as_ref()
    }

    /// Approximate heap usage of the block and its bitmap.
    pub fn approximate_memory_usage(&self) -> usize {
        let bitmap = self
            .read_amp_bitmap
            .as_ref()
            .map_or(0, |b| b.approximate_memory_usage());
        std::mem::size_of::<Self>() + self.data.len() + bitmap
    }

    /// Create a data-block iterator.
    pub fn data_iter<'a>(&'a self, cmp: &'a dyn Comparator) -> DataBlockIter<'a> {
        DataBlockIter::new(self, cmp)
    }

    /// Create an index-block iterator.
    ///
    /// `value_delta_encoded` must match how the block was built. With
    /// `total_order_seek` off and a prefix index supplied, seeks use
    /// prefix-hash candidate lookup.
    pub fn index_iter<'a>(
        &'a self,
        cmp: &'a dyn Comparator,
        value_delta_encoded: bool,
        total_order_seek: bool,
        prefix_index: Option<&'a BlockPrefixIndex>,
    ) -> IndexBlockIter<'a> {
        IndexBlockIter::new(self, cmp, value_delta_encoded, total_order_seek, prefix_index)
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("size", &self.size())
            .field("num_restarts", &self.num_restarts)
            .field("global_seqno", &self.global_seqno)
            .finish()
    }
}

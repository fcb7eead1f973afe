//! Block iterators.
//!
//! Iterators position over prefix-compressed entries by binary-searching
//! the restart array and scanning forward within a restart interval. A
//! decode failure (bad varint, out-of-bounds range) invalidates the
//! iterator with a sticky corruption status; every later mutator is a
//! no-op.

use std::cell::Cell;
use std::cmp::Ordering;

use crate::util::coding::{decode_varint32, decode_varint64, read_fixed32};
use crate::util::comparator::Comparator;
use crate::{Error, Result};

use super::{Block, BlockHandle, BlockPrefixIndex, BlockReadAmpBitmap};
use super::DISABLE_GLOBAL_SEQUENCE_NUMBER;

/// Outcome of advancing to the next entry.
enum Parsed {
    /// Positioned on an entry.
    Entry,
    /// Ran off the end of the entry area.
    AtEnd,
    /// Decode failure; the iterator has been invalidated.
    Corrupt,
}

/// Positioning state shared by data and index iterators.
struct IterCore<'a> {
    cmp: &'a dyn Comparator,
    data: &'a [u8],
    /// Offset of the restart array.
    restarts: u32,
    num_restarts: u32,
    /// Offset of the current entry; >= `restarts` when invalid.
    current: u32,
    /// Restart interval containing `current`.
    restart_index: u32,
    /// Current key, reconstructed by applying shared prefixes.
    key: Vec<u8>,
    /// Current value range within `data`.
    value_start: u32,
    value_len: u32,
    status: Option<Error>,
}

impl<'a> IterCore<'a> {
    fn new(block: &'a Block, cmp: &'a dyn Comparator) -> Self {
        let restarts = block.restart_offset();
        Self {
            cmp,
            data: block.data(),
            restarts,
            num_restarts: block.num_restarts(),
            current: restarts,
            restart_index: block.num_restarts(),
            key: Vec::new(),
            value_start: restarts,
            value_len: 0,
            status: None,
        }
    }

    fn valid(&self) -> bool {
        self.status.is_none() && self.current < self.restarts
    }

    fn status(&self) -> Result<()> {
        match self.status {
            Some(ref e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Offset just past the current entry.
    fn next_entry_offset(&self) -> u32 {
        self.value_start + self.value_len
    }

    fn restart_point(&self, index: u32) -> u32 {
        debug_assert!(index < self.num_restarts);
        read_fixed32(&self.data[(self.restarts + index * 4) as usize..]).unwrap_or(self.restarts)
    }

    fn seek_to_restart_point(&mut self, index: u32) {
        self.key.clear();
        self.restart_index = index;
        // parse_next_key starts at next_entry_offset, so stage a zero-length
        // value at the restart offset.
        self.value_start = self.restart_point(index);
        self.value_len = 0;
    }

    /// Mark the iterator exhausted without error.
    fn set_at_end(&mut self) {
        self.current = self.restarts;
        self.restart_index = self.num_restarts;
    }

    fn corruption(&mut self, msg: &str) {
        self.status = Some(Error::corruption(msg));
        self.key.clear();
        self.current = self.restarts;
        self.restart_index = self.num_restarts;
        self.value_start = self.restarts;
        self.value_len = 0;
    }

    /// Decode the entry header at `offset`.
    ///
    /// Returns (shared, non_shared, value_len, key_offset).
    fn decode_entry(&self, offset: u32) -> Option<(u32, u32, u32, u32)> {
        if offset >= self.restarts {
            return None;
        }
        let mut cursor = &self.data[offset as usize..self.restarts as usize];
        let before = cursor.len();

        let shared = decode_varint32(&mut cursor)?;
        let non_shared = decode_varint32(&mut cursor)?;
        let value_len = decode_varint32(&mut cursor)?;

        let header_len = (before - cursor.len()) as u32;
        let key_offset = offset + header_len;

        let end = key_offset as u64 + non_shared as u64 + value_len as u64;
        if end > self.restarts as u64 {
            return None;
        }

        Some((shared, non_shared, value_len, key_offset))
    }

    /// Advance to the entry at `next_entry_offset`, rebuilding the key.
    fn parse_next_key(&mut self) -> Parsed {
        self.current = self.next_entry_offset();
        if self.current >= self.restarts {
            self.set_at_end();
            return Parsed::AtEnd;
        }

        let Some((shared, non_shared, value_len, key_offset)) = self.decode_entry(self.current)
        else {
            self.corruption("bad block entry");
            return Parsed::Corrupt;
        };

        if shared as usize > self.key.len() {
            self.corruption("shared prefix exceeds previous key");
            return Parsed::Corrupt;
        }

        self.key.truncate(shared as usize);
        self.key
            .extend_from_slice(&self.data[key_offset as usize..(key_offset + non_shared) as usize]);
        self.value_start = key_offset + non_shared;
        self.value_len = value_len;

        while self.restart_index + 1 < self.num_restarts
            && self.restart_point(self.restart_index + 1) < self.current
        {
            self.restart_index += 1;
        }

        Parsed::Entry
    }

    /// Decode the full key stored at a restart point.
    fn decode_restart_key(&self, index: u32) -> Option<Vec<u8>> {
        let offset = self.restart_point(index);
        let (shared, non_shared, _value_len, key_offset) = self.decode_entry(offset)?;
        if shared != 0 {
            // Restart entries store their key whole.
            return None;
        }
        Some(self.data[key_offset as usize..(key_offset + non_shared) as usize].to_vec())
    }

    /// Find the last restart point whose key is <= `target`.
    fn binary_seek(&mut self, target: &[u8]) -> Option<u32> {
        let mut left = 0u32;
        let mut right = self.num_restarts - 1;

        while left < right {
            let mid = (left + right + 1) / 2;
            let Some(key) = self.decode_restart_key(mid) else {
                self.corruption("bad restart entry");
                return None;
            };
            match self.cmp.compare(&key, target) {
                Ordering::Less => left = mid,
                Ordering::Greater => right = mid - 1,
                Ordering::Equal => {
                    left = mid;
                    right = mid;
                }
            }
        }

        Some(left)
    }

    /// Re-derive `restart_index` after repositioning to `current`.
    fn sync_restart_index(&mut self) {
        if self.num_restarts == 0 {
            return;
        }
        if self.restart_index >= self.num_restarts {
            self.restart_index = self.num_restarts - 1;
        }
        while self.restart_index > 0 && self.restart_point(self.restart_index) > self.current {
            self.restart_index -= 1;
        }
        while self.restart_index + 1 < self.num_restarts
            && self.restart_point(self.restart_index + 1) <= self.current
        {
            self.restart_index += 1;
        }
    }
}

/// One remembered entry for amortized backward iteration.
struct CachedPrevEntry {
    offset: u32,
    key: Vec<u8>,
    value_start: u32,
    value_len: u32,
}

/// Iterator over a data block.
pub struct DataBlockIter<'a> {
    core: IterCore<'a>,
    /// Non-disabled values overwrite the sequence in each decoded key's
    /// trailer, making ingested files appear at a chosen logical time.
    global_seqno: u64,
    read_amp_bitmap: Option<&'a BlockReadAmpBitmap>,
    /// Last entry offset reported to the bitmap, so repeated `value` calls
    /// on one entry mark once.
    last_bitmap_offset: Cell<u32>,
    /// Decoded entries of the current backward scan, oldest first.
    prev_entries: Vec<CachedPrevEntry>,
    prev_entries_idx: i32,
}

impl<'a> DataBlockIter<'a> {
    pub(crate) fn new(block: &'a Block, cmp: &'a dyn Comparator) -> Self {
        let core = IterCore::new(block, cmp);
        let last_bitmap_offset = Cell::new(core.current + 1);
        Self {
            core,
            global_seqno: block.global_seqno(),
            read_amp_bitmap: block.read_amp_bitmap(),
            last_bitmap_offset,
            prev_entries: Vec::new(),
            prev_entries_idx: -1,
        }
    }

    /// True iff positioned on an entry.
    pub fn valid(&self) -> bool {
        self.core.valid()
    }

    /// Sticky iterator status.
    pub fn status(&self) -> Result<()> {
        self.core.status()
    }

    /// Current key. Only valid while `valid()`.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.core.key
    }

    /// Current value. Only valid while `valid()`.
    ///
    /// Reading a value feeds the block's read-amp bitmap.
    pub fn value(&self) -> &'a [u8] {
        debug_assert!(self.valid());
        if let Some(bitmap) = self.read_amp_bitmap {
            if self.core.current != self.last_bitmap_offset.get() {
                bitmap.mark(self.core.current, self.core.next_entry_offset() - 1);
                self.last_bitmap_offset.set(self.core.current);
            }
        }
        &self.core.data[self.core.value_start as usize..self.core.next_entry_offset() as usize]
    }

    /// Position at the first entry with key >= `target`.
    pub fn seek(&mut self, target: &[u8]) {
        if self.core.status.is_some() {
            return;
        }
        self.clear_prev_cache();
        if self.core.num_restarts == 0 {
            self.core.set_at_end();
            return;
        }

        let Some(index) = self.core.binary_seek(target) else {
            return;
        };
        self.core.seek_to_restart_point(index);

        loop {
            if !self.parse_next_data_key() {
                return;
            }
            if self.core.cmp.compare(&self.core.key, target) != Ordering::Less {
                return;
            }
        }
    }

    /// Position at the last entry with key <= `target`.
    pub fn seek_for_prev(&mut self, target: &[u8]) {
        if self.core.status.is_some() {
            return;
        }
        self.seek(target);
        if !self.valid() && self.core.status.is_none() {
            self.seek_to_last();
        }
        while self.valid() && self.core.cmp.compare(&self.core.key, target) == Ordering::Greater {
            self.prev();
        }
    }

    /// Position at the first entry.
    pub fn seek_to_first(&mut self) {
        if self.core.status.is_some() {
            return;
        }
        self.clear_prev_cache();
        if self.core.num_restarts == 0 {
            self.core.set_at_end();
            return;
        }
        self.core.seek_to_restart_point(0);
        self.parse_next_data_key();
    }

    /// Position at the last entry.
    pub fn seek_to_last(&mut self) {
        if self.core.status.is_some() {
            return;
        }
        self.clear_prev_cache();
        if self.core.num_restarts == 0 {
            self.core.set_at_end();
            return;
        }
        self.core.seek_to_restart_point(self.core.num_restarts - 1);
        loop {
            if !self.parse_next_data_key() {
                return;
            }
            if self.core.next_entry_offset() >= self.core.restarts {
                return;
            }
        }
    }

    /// Advance to the next entry.
    pub fn next(&mut self) {
        if !self.valid() {
            return;
        }
        self.parse_next_data_key();
    }

    /// Step back to the previous entry.
    ///
    /// Backward iteration re-parses forward from the nearest restart
    /// point; decoded entries are cached so consecutive `prev` calls pay
    /// the scan once per interval.
    pub fn prev(&mut self) {
        if !self.valid() {
            return;
        }

        let original = self.core.current;

        // Fast path: the previous entry is still in the cache.
        if self.prev_entries_idx > 0
            && self.prev_entries[self.prev_entries_idx as usize].offset == original
        {
            self.prev_entries_idx -= 1;
            self.restore_cached(self.prev_entries_idx as usize);
            return;
        }

        if original == self.core.restart_point(0) {
            // Already at the first entry.
            self.clear_prev_cache();
            self.core.set_at_end();
            return;
        }

        // Walk back to the restart interval holding entries before
        // `original` and rebuild the cache by scanning forward.
        if self.core.restart_index >= self.core.num_restarts {
            self.core.restart_index = self.core.num_restarts - 1;
        }
        while self.core.restart_point(self.core.restart_index) >= original {
            self.core.restart_index -= 1;
        }

        self.prev_entries.clear();
        self.prev_entries_idx = -1;
        let scan_index = self.core.restart_index;
        self.core.seek_to_restart_point(scan_index);

        loop {
            if !self.parse_next_data_key() {
                return;
            }
            if self.core.current >= original {
                break;
            }
            self.prev_entries.push(CachedPrevEntry {
                offset: self.core.current,
                key: self.core.key.clone(),
                value_start: self.core.value_start,
                value_len: self.core.value_len,
            });
            if self.core.next_entry_offset() >= original {
                break;
            }
        }

        if self.prev_entries.is_empty() {
            self.core.set_at_end();
            return;
        }
        self.prev_entries_idx = self.prev_entries.len() as i32 - 1;
        self.restore_cached(self.prev_entries_idx as usize);
    }

    fn restore_cached(&mut self, idx: usize) {
        let entry = &self.prev_entries[idx];
        self.core.key.clear();
        self.core.key.extend_from_slice(&entry.key);
        self.core.current = entry.offset;
        self.core.value_start = entry.value_start;
        self.core.value_len = entry.value_len;
        self.core.sync_restart_index();
    }

    fn clear_prev_cache(&mut self) {
        self.prev_entries.clear();
        self.prev_entries_idx = -1;
    }

    /// Parse the next entry and apply the global sequence override.
    fn parse_next_data_key(&mut self) -> bool {
        match self.core.parse_next_key() {
            Parsed::Entry => {
                if self.global_seqno != DISABLE_GLOBAL_SEQUENCE_NUMBER {
                    let len = self.core.key.len();
                    if len < 8 {
                        self.core.corruption("key too short for sequence trailer");
                        return false;
                    }
                    let tail: [u8; 8] = self.core.key[len - 8..].try_into().unwrap();
                    let packed = u64::from_be_bytes(tail);
                    let rewritten = (self.global_seqno << 8) | (packed & 0xFF);
                    self.core.key[len - 8..].copy_from_slice(&rewritten.to_be_bytes());
                }
                true
            }
            Parsed::AtEnd | Parsed::Corrupt => false,
        }
    }
}

/// Iterator over an index block whose values are [`BlockHandle`]s.
pub struct IndexBlockIter<'a> {
    core: IterCore<'a>,
    /// Whether non-restart values carry only the handle size.
    value_delta_encoded: bool,
    /// Handle decoded for the current entry (running sum in delta mode).
    decoded_handle: BlockHandle,
    prefix_index: Option<&'a BlockPrefixIndex>,
    total_order_seek: bool,
}

impl<'a> IndexBlockIter<'a> {
    pub(crate) fn new(
        block: &'a Block,
        cmp: &'a dyn Comparator,
        value_delta_encoded: bool,
        total_order_seek: bool,
        prefix_index: Option<&'a BlockPrefixIndex>,
    ) -> Self {
        Self {
            core: IterCore::new(block, cmp),
            value_delta_encoded,
            decoded_handle: BlockHandle::default(),
            prefix_index,
            total_order_seek,
        }
    }

    /// True iff positioned on an entry.
    pub fn valid(&self) -> bool {
        self.core.valid()
    }

    /// Sticky iterator status.
    pub fn status(&self) -> Result<()> {
        self.core.status()
    }

    /// Current separator key. Only valid while `valid()`.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.core.key
    }

    /// Handle of the block the current entry covers.
    pub fn handle(&self) -> BlockHandle {
        debug_assert!(self.valid());
        self.decoded_handle
    }

    /// Position at the first entry with key >= `target`.
    ///
    /// With a prefix index attached and total-order seek off, the seek
    /// narrows to the candidate entries sharing the target's prefix; a
    /// missing prefix leaves the iterator invalid.
    pub fn seek(&mut self, target: &[u8]) {
        if self.core.status.is_some() {
            return;
        }
        if self.core.num_restarts == 0 {
            self.core.set_at_end();
            return;
        }

        if !self.total_order_seek {
            if let Some(prefix_index) = self.prefix_index {
                self.prefix_seek(target, prefix_index);
                return;
            }
        }

        let Some(index) = self.core.binary_seek(target) else {
            return;
        };
        self.core.seek_to_restart_point(index);

        loop {
            if !self.parse_next_index_key() {
                return;
            }
            if self.core.cmp.compare(&self.core.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn prefix_seek(&mut self, target: &[u8], prefix_index: &BlockPrefixIndex) {
        let Some(candidates) = prefix_index.get_for_key(target) else {
            self.core.set_at_end();
            return;
        };

        // First candidate whose separator key is >= target.
        let mut lo = 0usize;
        let mut hi = candidates.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let Some(key) = self.core.decode_restart_key(candidates[mid]) else {
                self.core.corruption("bad restart entry");
                return;
            };
            if self.core.cmp.compare(&key, target) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        if lo == candidates.len() {
            self.core.set_at_end();
            return;
        }

        self.core.seek_to_restart_point(candidates[lo]);
        self.parse_next_index_key();
    }

    /// Index blocks do not support `seek_for_prev`.
    pub fn seek_for_prev(&mut self, _target: &[u8]) {
        self.core.status = Some(Error::invalid_argument(
            "seek_for_prev is not supported on index blocks",
        ));
        self.core.key.clear();
        self.core.current = self.core.restarts;
        self.core.restart_index = self.core.num_restarts;
    }

    /// Position at the first entry.
    pub fn seek_to_first(&mut self) {
        if self.core.status.is_some() {
            return;
        }
        if self.core.num_restarts == 0 {
            self.core.set_at_end();
            return;
        }
        self.core.seek_to_restart_point(0);
        self.parse_next_index_key();
    }

    /// Position at the last entry.
    pub fn seek_to_last(&mut self) {
        if self.core.status.is_some() {
            return;
        }
        if self.core.num_restarts == 0 {
            self.core.set_at_end();
            return;
        }
        self.core.seek_to_restart_point(self.core.num_restarts - 1);
        loop {
            if !self.parse_next_index_key() {
                return;
            }
            if self.core.next_entry_offset() >= self.core.restarts {
                return;
            }
        }
    }

    /// Advance to the next entry.
    pub fn next(&mut self) {
        if !self.valid() {
            return;
        }
        self.parse_next_index_key();
    }

    /// Step back to the previous entry by re-scanning its restart
    /// interval, which also replays the running-sum handle state.
    pub fn prev(&mut self) {
        if !self.valid() {
            return;
        }

        let original = self.core.current;
        if original == self.core.restart_point(0) {
            self.core.set_at_end();
            return;
        }

        if self.core.restart_index >= self.core.num_restarts {
            self.core.restart_index = self.core.num_restarts - 1;
        }
        while self.core.restart_point(self.core.restart_index) >= original {
            self.core.restart_index -= 1;
        }

        let scan_index = self.core.restart_index;
        self.core.seek_to_restart_point(scan_index);
        loop {
            if !self.parse_next_index_key() {
                return;
            }
            if self.core.next_entry_offset() >= original {
                return;
            }
        }
    }

    /// Parse the next entry and decode its handle.
    fn parse_next_index_key(&mut self) -> bool {
        match self.core.parse_next_key() {
            Parsed::Entry => self.decode_current_handle(),
            Parsed::AtEnd | Parsed::Corrupt => false,
        }
    }

    fn decode_current_handle(&mut self) -> bool {
        let value =
            &self.core.data[self.core.value_start as usize..self.core.next_entry_offset() as usize];
        let at_restart = self.core.restart_point(self.core.restart_index) == self.core.current;

        if !self.value_delta_encoded || at_restart {
            let mut cursor = value;
            match BlockHandle::decode(&mut cursor) {
                Ok(handle) => {
                    self.decoded_handle = handle;
                    true
                }
                Err(_) => {
                    self.core.corruption("bad index handle");
                    false
                }
            }
        } else {
            // Delta value: size only; offset continues the running sum.
            let mut cursor = value;
            let Some(size) = decode_varint64(&mut cursor) else {
                self.core.corruption("bad index handle delta");
                return false;
            };
            self.decoded_handle = BlockHandle::new(
                self.decoded_handle.offset() + self.decoded_handle.size(),
                size,
            );
            true
        }
    }
}

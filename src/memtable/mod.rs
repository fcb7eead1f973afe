//! MemTable - in-memory sorted staging area for recent writes.
//!
//! The MemTable is the first destination for all writes. It uses a
//! concurrent skip list for sorted storage, with node key and value bytes
//! carved from the crate arena behind a short critical section; the skip
//! list entries are raw views into those slabs, released together when
//! the memtable is dropped.
//!
//! # MVCC semantics
//!
//! Multiple versions of the same user key coexist with different sequence
//! numbers. Reads at a sequence horizon see the latest version at or
//! before that sequence.

pub mod arena;

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};

use crate::types::{InternalKey, LookupResult, ValueType, WriteBatch};

use arena::Arena;

/// Estimated skip-list node overhead per entry.
const NODE_OVERHEAD: usize = 64;

/// View into arena-owned bytes.
///
/// Valid for as long as the owning memtable's arena, which outlives the
/// skip list holding these views.
#[derive(Clone, Copy)]
struct ArenaSlice {
    ptr: *const u8,
    len: usize,
}

impl ArenaSlice {
    /// Copy `data` into the arena and return a view of the copy.
    fn copy_in(arena: &Arena, data: &[u8]) -> Self {
        Self {
            ptr: arena.allocate_copy(data),
            len: data.len(),
        }
    }

    /// Borrow `data` without copying. Only for transient range bounds
    /// whose backing buffer outlives the lookup.
    fn borrowed(data: &[u8]) -> Self {
        Self {
            ptr: data.as_ptr(),
            len: data.len(),
        }
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

// The referenced bytes are immutable once published and live until the
// arena drops.
unsafe impl Send for ArenaSlice {}
unsafe impl Sync for ArenaSlice {}

impl PartialEq for ArenaSlice {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for ArenaSlice {}

impl PartialOrd for ArenaSlice {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ArenaSlice {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_slice().cmp(other.as_slice())
    }
}

/// MemTable for in-memory sorted storage.
///
/// Thread-safe for concurrent reads and writes; the parallel memtable
/// phase has each follower call [`MemTable::apply`] with its own batch.
pub struct MemTable {
    /// The underlying skip list. Keys are encoded internal keys; values
    /// are raw bytes (empty for tombstones). Declared before the arena so
    /// the views die before their backing slabs.
    table: SkipMap<ArenaSlice, ArenaSlice>,

    /// Backing storage for node bytes. The lock bounds a bump-pointer
    /// allocation, so the critical section is a few instructions.
    arena: Mutex<Arena>,

    /// Approximate memory usage in bytes.
    approximate_memory_usage: AtomicUsize,

    /// Minimum sequence number in this memtable.
    min_sequence: AtomicU64,

    /// Maximum sequence number in this memtable.
    max_sequence: AtomicU64,

    /// Number of entries.
    entry_count: AtomicUsize,

    /// Unique ID for this memtable.
    id: u64,
}

impl MemTable {
    /// Create a new empty MemTable.
    pub fn new(id: u64) -> Self {
        Self::with_arena_block_size(id, arena::MIN_BLOCK_SIZE)
    }

    /// Create a MemTable with a specific arena slab size.
    pub fn with_arena_block_size(id: u64, arena_block_size: usize) -> Self {
        Self {
            table: SkipMap::new(),
            arena: Mutex::new(Arena::with_block_size(arena_block_size)),
            approximate_memory_usage: AtomicUsize::new(0),
            min_sequence: AtomicU64::new(u64::MAX),
            max_sequence: AtomicU64::new(0),
            entry_count: AtomicUsize::new(0),
            id,
        }
    }

    /// Get the memtable ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Insert one internal key and value.
    ///
    /// Tombstones store an empty value; the key's value type is what marks
    /// the deletion.
    pub fn add(&self, key: &InternalKey, value: &[u8]) {
        let encoded_key = key.encode();

        let (node_key, node_value) = {
            let arena = self.arena.lock();
            (
                ArenaSlice::copy_in(&arena, &encoded_key),
                ArenaSlice::copy_in(&arena, value),
            )
        };

        self.approximate_memory_usage.fetch_add(
            encoded_key.len() + value.len() + NODE_OVERHEAD,
            AtomicOrdering::Relaxed,
        );
        self.update_sequence_bounds(key.sequence());

        self.table.insert(node_key, node_value);
        self.entry_count.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Apply a batch at an assigned sequence number.
    ///
    /// Each entry consumes one sequence number in batch order; returns the
    /// last sequence used. Safe to call concurrently from parallel
    /// memtable writers with disjoint sequence ranges.
    pub fn apply(&self, batch: &WriteBatch, first_sequence: u64) -> u64 {
        let mut seq = first_sequence;
        for entry in batch.entries() {
            let key = InternalKey::new(entry.key.clone(), seq, entry.value_type);
            match entry.value {
                Some(ref value) => self.add(&key, value),
                None => self.add(&key, &[]),
            }
            seq += 1;
        }
        seq.saturating_sub(1)
    }

    /// Look up a key at a sequence horizon.
    ///
    /// Returns the value of the latest version with sequence <= the given
    /// horizon. Merge operands are returned as found values; combining
    /// them is the caller's concern.
    pub fn get(&self, user_key: &[u8], sequence: u64) -> LookupResult {
        // Versions of one user key sort by ascending sequence, so scan the
        // key's range and keep the last visible entry.
        let lower = InternalKey::new(Bytes::copy_from_slice(user_key), 0, ValueType::Value).encode();
        let upper = InternalKey::new(
            Bytes::copy_from_slice(user_key),
            sequence,
            ValueType::Merge, // highest type byte sorts after Value/Deletion
        )
        .encode();

        let lower_bound = ArenaSlice::borrowed(&lower);
        let upper_bound = ArenaSlice::borrowed(&upper);

        let mut result = LookupResult::NotFound;

        for entry in self.table.range(lower_bound..=upper_bound) {
            let entry_key = entry.key().as_slice();

            let Some(entry_user_key) = InternalKey::parse_user_key(entry_key) else {
                continue;
            };
            if entry_user_key != user_key {
                continue;
            }

            let Some(entry_seq) = InternalKey::parse_sequence(entry_key) else {
                continue;
            };
            if entry_seq <= sequence {
                if let Some(internal_key) = InternalKey::decode(entry_key) {
                    if internal_key.is_deletion() {
                        result = LookupResult::Deleted;
                    } else {
                        result =
                            LookupResult::Found(Bytes::copy_from_slice(entry.value().as_slice()));
                    }
                }
            }
        }

        result
    }

    /// Iterate over entries in sorted order as (encoded key, value) copies.
    pub fn iter(&self) -> impl Iterator<Item = (Bytes, Bytes)> + '_ {
        self.table.iter().map(|entry| {
            (
                Bytes::copy_from_slice(entry.key().as_slice()),
                Bytes::copy_from_slice(entry.value().as_slice()),
            )
        })
    }

    /// Get approximate memory usage in bytes, including arena slabs.
    pub fn approximate_memory_usage(&self) -> usize {
        let arena_usage = self.arena.lock().approximate_memory_usage();
        arena_usage + self.entry_count() * NODE_OVERHEAD
    }

    /// Get the number of entries.
    pub fn entry_count(&self) -> usize {
        self.entry_count.load(AtomicOrdering::Relaxed)
    }

    /// Check if the memtable is empty.
    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    /// Get the minimum sequence number (0 when empty).
    pub fn min_sequence(&self) -> u64 {
        let min = self.min_sequence.load(AtomicOrdering::Relaxed);
        if min == u64::MAX {
            0
        } else {
            min
        }
    }

    /// Get the maximum sequence number.
    pub fn max_sequence(&self) -> u64 {
        self.max_sequence.load(AtomicOrdering::Relaxed)
    }

    fn update_sequence_bounds(&self, seq: u64) {
        self.min_sequence.fetch_min(seq, AtomicOrdering::Relaxed);
        self.max_sequence.fetch_max(seq, AtomicOrdering::Relaxed);
    }
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable")
            .field("id", &self.id)
            .field("entries", &self.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_put_get() {
        let memtable = MemTable::new(1);

        let key = InternalKey::for_value(Bytes::from("hello"), 10);
        memtable.add(&key, b"world");

        match memtable.get(b"hello", 10) {
            LookupResult::Found(v) => assert_eq!(&v[..], b"world"),
            other => panic!("unexpected {:?}", other),
        }

        // Invisible before its sequence.
        assert_eq!(memtable.get(b"hello", 9), LookupResult::NotFound);
    }

    #[test]
    fn test_mvcc_versions() {
        let memtable = MemTable::new(1);

        memtable.add(&InternalKey::for_value(Bytes::from("k"), 10), b"v1");
        memtable.add(&InternalKey::for_value(Bytes::from("k"), 20), b"v2");
        memtable.add(&InternalKey::for_deletion(Bytes::from("k"), 30), b"");

        assert_eq!(
            memtable.get(b"k", 15),
            LookupResult::Found(Bytes::from("v1"))
        );
        assert_eq!(
            memtable.get(b"k", 25),
            LookupResult::Found(Bytes::from("v2"))
        );
        assert_eq!(memtable.get(b"k", 35), LookupResult::Deleted);
    }

    #[test]
    fn test_prefix_keys_do_not_collide() {
        let memtable = MemTable::new(1);
        memtable.add(&InternalKey::for_value(Bytes::from("ab"), 5), b"short");
        memtable.add(&InternalKey::for_value(Bytes::from("abc"), 5), b"long");

        assert_eq!(
            memtable.get(b"ab", 100),
            LookupResult::Found(Bytes::from("short"))
        );
        assert_eq!(
            memtable.get(b"abc", 100),
            LookupResult::Found(Bytes::from("long"))
        );
    }

    #[test]
    fn test_apply_batch_sequences() {
        let memtable = MemTable::new(1);

        let mut batch = WriteBatch::new();
        batch.put(b"a".as_slice(), b"1".as_slice());
        batch.put(b"b".as_slice(), b"2".as_slice());
        batch.delete(b"a".as_slice());

        let last = memtable.apply(&batch, 100);
        assert_eq!(last, 102);
        assert_eq!(memtable.entry_count(), 3);
        assert_eq!(memtable.min_sequence(), 100);
        assert_eq!(memtable.max_sequence(), 102);

        assert_eq!(memtable.get(b"a", 200), LookupResult::Deleted);
        assert_eq!(
            memtable.get(b"b", 200),
            LookupResult::Found(Bytes::from("2"))
        );
    }

    #[test]
    fn test_concurrent_apply() {
        let memtable = Arc::new(MemTable::new(1));
        let threads = 8;
        let per_thread = 50u64;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let memtable = memtable.clone();
                std::thread::spawn(move || {
                    let mut batch = WriteBatch::new();
                    for i in 0..per_thread {
                        batch.put(
                            format!("key-{:02}-{:03}", t, i).into_bytes(),
                            format!("value-{}-{}", t, i).into_bytes(),
                        );
                    }
                    memtable.apply(&batch, 1 + t * per_thread);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(memtable.entry_count(), (threads * per_thread) as usize);
        for t in 0..threads {
            let value = memtable.get(format!("key-{:02}-007", t).as_bytes(), u64::MAX >> 9);
            assert!(value.is_found(), "thread {} entry missing", t);
        }
    }

    #[test]
    fn test_memory_usage_grows() {
        let memtable = MemTable::new(1);
        let before = memtable.approximate_memory_usage();
        for i in 0..100 {
            memtable.add(
                &InternalKey::for_value(format!("key-{}", i).into_bytes(), i as u64),
                &vec![0u8; 128],
            );
        }
        assert!(memtable.approximate_memory_usage() > before);
    }

    #[test]
    fn test_iter_sorted() {
        let memtable = MemTable::new(1);
        memtable.add(&InternalKey::for_value(Bytes::from("c"), 1), b"3");
        memtable.add(&InternalKey::for_value(Bytes::from("a"), 2), b"1");
        memtable.add(&InternalKey::for_value(Bytes::from("b"), 3), b"2");

        let user_keys: Vec<_> = memtable
            .iter()
            .map(|(k, _)| InternalKey::parse_user_key(&k).unwrap().to_vec())
            .collect();
        assert_eq!(user_keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }
}

//! Auxiliary prefix index for index blocks.
//!
//! Maps fixed-length key prefixes to the restart indices of the index
//! entries whose separator keys carry that prefix. When `total_order_seek`
//! is off, the index iterator consults this structure to narrow a seek to
//! a handful of candidate entries instead of binary-searching the whole
//! restart array. A seek whose prefix is not indexed simply leaves the
//! iterator invalid rather than positioning past the target.
//!
//! The structure assumes the index block was built with a restart interval
//! of 1, so restart indices and entry positions coincide.

use std::collections::HashMap;

/// Immutable prefix → candidate entries map.
#[derive(Debug)]
pub struct BlockPrefixIndex {
    prefix_len: usize,
    buckets: HashMap<Box<[u8]>, Vec<u32>>,
}

impl BlockPrefixIndex {
    /// Candidate restart indices for the prefix of `key`, ascending.
    ///
    /// Returns None when no indexed key carries the prefix.
    pub fn get_for_key(&self, key: &[u8]) -> Option<&[u32]> {
        let prefix = &key[..key.len().min(self.prefix_len)];
        self.buckets.get(prefix).map(|v| v.as_slice())
    }

    /// Prefix length this index was built with.
    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    /// Number of distinct prefixes indexed.
    pub fn num_prefixes(&self) -> usize {
        self.buckets.len()
    }
}

/// Builder collecting (key, restart index) pairs in block order.
#[derive(Debug)]
pub struct BlockPrefixIndexBuilder {
    prefix_len: usize,
    buckets: HashMap<Box<[u8]>, Vec<u32>>,
}

impl BlockPrefixIndexBuilder {
    /// Create a builder with a fixed prefix length.
    pub fn new(prefix_len: usize) -> Self {
        Self {
            prefix_len,
            buckets: HashMap::new(),
        }
    }

    /// Record the separator key of the entry at `restart_index`.
    ///
    /// Entries must be added in block order so candidate lists stay
    /// sorted.
    pub fn add_key(&mut self, key: &[u8], restart_index: u32) {
        let prefix = &key[..key.len().min(self.prefix_len)];
        let bucket = self
            .buckets
            .entry(prefix.to_vec().into_boxed_slice())
            .or_default();
        debug_assert!(bucket.last().map_or(true, |&last| last <= restart_index));
        bucket.push(restart_index);
    }

    /// Finish building.
    pub fn finish(self) -> BlockPrefixIndex {
        BlockPrefixIndex {
            prefix_len: self.prefix_len,
            buckets: self.buckets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_key_prefix() {
        let mut builder = BlockPrefixIndexBuilder::new(3);
        builder.add_key(b"usr:1", 0);
        builder.add_key(b"usr:9", 1);
        builder.add_key(b"web:2", 2);
        let index = builder.finish();

        assert_eq!(index.num_prefixes(), 2);
        assert_eq!(index.get_for_key(b"usr:5"), Some(&[0u32, 1][..]));
        assert_eq!(index.get_for_key(b"web:0"), Some(&[2u32][..]));
        assert_eq!(index.get_for_key(b"db:77"), None);
    }

    #[test]
    fn test_short_keys_use_whole_key() {
        let mut builder = BlockPrefixIndexBuilder::new(8);
        builder.add_key(b"ab", 0);
        let index = builder.finish();
        assert_eq!(index.get_for_key(b"ab"), Some(&[0u32][..]));
    }
}

//! Core types for rilldb.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::cmp::Ordering;

use crate::util::coding::{decode_varint64, encode_varint64};

/// Value type indicator in internal keys and batch entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    /// Normal value.
    Value = 1,
    /// Deletion marker (tombstone).
    Deletion = 2,
    /// Merge operand. Merge operands require single-threaded ordering, so
    /// batches containing them never enter the parallel memtable phase.
    Merge = 3,
}

impl ValueType {
    /// Create from byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(ValueType::Value),
            2 => Some(ValueType::Deletion),
            3 => Some(ValueType::Merge),
            _ => None,
        }
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Check if this is a deletion marker.
    pub fn is_deletion(&self) -> bool {
        matches!(self, ValueType::Deletion)
    }
}

/// Internal key format used for storage.
///
/// An internal key combines the user key, a sequence number, and a value
/// type. Encoded as `[user_key][packed (8 bytes)]` where
/// `packed = (sequence << 8) | value_type`, big-endian, so that encoded
/// keys sort by user key first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    user_key: Bytes,
    sequence: u64,
    value_type: ValueType,
}

impl InternalKey {
    /// Maximum sequence number (56 bits).
    pub const MAX_SEQUENCE: u64 = (1 << 56) - 1;

    /// Create a new internal key.
    pub fn new(user_key: impl Into<Bytes>, sequence: u64, value_type: ValueType) -> Self {
        debug_assert!(sequence <= Self::MAX_SEQUENCE);
        Self {
            user_key: user_key.into(),
            sequence,
            value_type,
        }
    }

    /// Create an internal key for a put operation.
    pub fn for_value(user_key: impl Into<Bytes>, sequence: u64) -> Self {
        Self::new(user_key, sequence, ValueType::Value)
    }

    /// Create an internal key for a delete operation.
    pub fn for_deletion(user_key: impl Into<Bytes>, sequence: u64) -> Self {
        Self::new(user_key, sequence, ValueType::Deletion)
    }

    /// Get the user key.
    pub fn user_key(&self) -> &[u8] {
        &self.user_key
    }

    /// Get the sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Get the value type.
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Check if this is a deletion marker.
    pub fn is_deletion(&self) -> bool {
        self.value_type.is_deletion()
    }

    /// Encode the internal key to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.user_key.len() + 8);
        self.encode_to(&mut buf);
        buf.freeze()
    }

    /// Encode into an existing buffer.
    pub fn encode_to(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.user_key);
        let packed = (self.sequence << 8) | (self.value_type.to_byte() as u64);
        buf.put_u64(packed);
    }

    /// Decode an internal key from bytes.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }

        let user_key_len = data.len() - 8;
        let user_key = Bytes::copy_from_slice(&data[..user_key_len]);

        let mut packed_bytes = &data[user_key_len..];
        let packed = packed_bytes.get_u64();

        let value_type = ValueType::from_byte((packed & 0xFF) as u8)?;
        let sequence = packed >> 8;

        Some(Self {
            user_key,
            sequence,
            value_type,
        })
    }

    /// Get the encoded length.
    pub fn encoded_len(&self) -> usize {
        self.user_key.len() + 8
    }

    /// Parse the user key from encoded bytes without a full decode.
    pub fn parse_user_key(encoded: &[u8]) -> Option<&[u8]> {
        if encoded.len() < 8 {
            return None;
        }
        Some(&encoded[..encoded.len() - 8])
    }

    /// Parse the sequence from encoded bytes.
    pub fn parse_sequence(encoded: &[u8]) -> Option<u64> {
        if encoded.len() < 8 {
            return None;
        }
        let packed_bytes = &encoded[encoded.len() - 8..];
        let packed = u64::from_be_bytes(packed_bytes.try_into().ok()?);
        Some(packed >> 8)
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.user_key.cmp(&other.user_key) {
            // Same user key: newer sequence sorts first so reads see the
            // latest version.
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ord => ord,
        }
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A batch of write operations to be applied atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    entries: Vec<BatchEntry>,
    /// Approximate in-memory size plus encoding overhead.
    approximate_size: usize,
    /// Whether any entry is a merge operand.
    has_merge: bool,
}

/// A single entry in a write batch.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    /// The key to write.
    pub key: Bytes,
    /// The value (None for deletion).
    pub value: Option<Bytes>,
    /// Kind of operation.
    pub value_type: ValueType,
}

impl WriteBatch {
    /// Create a new empty write batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a write batch with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            approximate_size: 0,
            has_merge: false,
        }
    }

    /// Add a put operation to the batch.
    pub fn put(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        let key = key.into();
        let value = value.into();
        self.approximate_size += key.len() + value.len() + 16;
        self.entries.push(BatchEntry {
            key,
            value: Some(value),
            value_type: ValueType::Value,
        });
    }

    /// Add a delete operation to the batch.
    pub fn delete(&mut self, key: impl Into<Bytes>) {
        let key = key.into();
        self.approximate_size += key.len() + 8;
        self.entries.push(BatchEntry {
            key,
            value: None,
            value_type: ValueType::Deletion,
        });
    }

    /// Add a merge operand to the batch.
    pub fn merge(&mut self, key: impl Into<Bytes>, operand: impl Into<Bytes>) {
        let key = key.into();
        let operand = operand.into();
        self.approximate_size += key.len() + operand.len() + 16;
        self.has_merge = true;
        self.entries.push(BatchEntry {
            key,
            value: Some(operand),
            value_type: ValueType::Merge,
        });
    }

    /// Clear the batch.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.approximate_size = 0;
        self.has_merge = false;
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get the number of entries.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Approximate byte size used for group sizing.
    pub fn byte_size(&self) -> usize {
        self.approximate_size
    }

    /// Whether any entry is a merge operand.
    pub fn has_merge(&self) -> bool {
        self.has_merge
    }

    /// Get the entries.
    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    /// Append another batch's entries (cheap: payloads are refcounted).
    ///
    /// Used by a group leader to concatenate its group into one WAL
    /// record.
    pub fn append_from(&mut self, other: &WriteBatch) {
        self.entries.extend_from_slice(&other.entries);
        self.approximate_size += other.approximate_size;
        self.has_merge |= other.has_merge;
    }

    /// Iterate over entries.
    pub fn iter(&self) -> impl Iterator<Item = &BatchEntry> {
        self.entries.iter()
    }

    /// Encode the batch for the WAL.
    ///
    /// Format:
    /// ```text
    /// [count (4 bytes)]
    /// [entry: type (1) | key_len (varint) | key | value_len (varint) | value]
    /// ...
    /// ```
    /// Deletions omit the value length and value.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.approximate_size + 4);
        self.encode_to(&mut buf);
        buf.freeze()
    }

    /// Encode into an existing buffer (used when a leader concatenates a
    /// whole group into one WAL record).
    pub fn encode_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.entries.len() as u32);

        for entry in &self.entries {
            buf.put_u8(entry.value_type.to_byte());
            encode_varint64(buf, entry.key.len() as u64);
            buf.put_slice(&entry.key);
            if let Some(ref value) = entry.value {
                encode_varint64(buf, value.len() as u64);
                buf.put_slice(value);
            }
        }
    }

    /// Decode a batch from WAL data.
    pub fn decode(mut data: &[u8]) -> crate::Result<Self> {
        if data.len() < 4 {
            return Err(crate::Error::corruption("batch too short"));
        }

        let count = data.get_u32() as usize;
        let mut batch = WriteBatch::with_capacity(count);

        for _ in 0..count {
            if data.is_empty() {
                return Err(crate::Error::corruption("unexpected end of batch"));
            }

            let value_type = ValueType::from_byte(data.get_u8())
                .ok_or_else(|| crate::Error::corruption("invalid value type"))?;

            let key_len = decode_varint64(&mut data)
                .ok_or_else(|| crate::Error::corruption("invalid key length"))?
                as usize;

            if data.len() < key_len {
                return Err(crate::Error::corruption("key truncated"));
            }
            let key = Bytes::copy_from_slice(&data[..key_len]);
            data.advance(key_len);

            match value_type {
                ValueType::Value | ValueType::Merge => {
                    let value_len = decode_varint64(&mut data)
                        .ok_or_else(|| crate::Error::corruption("invalid value length"))?
                        as usize;

                    if data.len() < value_len {
                        return Err(crate::Error::corruption("value truncated"));
                    }
                    let value = Bytes::copy_from_slice(&data[..value_len]);
                    data.advance(value_len);

                    if value_type == ValueType::Merge {
                        batch.merge(key, value);
                    } else {
                        batch.put(key, value);
                    }
                }
                ValueType::Deletion => {
                    batch.delete(key);
                }
            }
        }

        Ok(batch)
    }
}

/// Result of a lookup operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    /// Value found.
    Found(Bytes),
    /// Key was deleted (tombstone found).
    Deleted,
    /// Key not found.
    NotFound,
}

impl LookupResult {
    /// Check if a value was found.
    pub fn is_found(&self) -> bool {
        matches!(self, LookupResult::Found(_))
    }

    /// Get the value if found.
    pub fn value(&self) -> Option<&Bytes> {
        match self {
            LookupResult::Found(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type() {
        assert_eq!(ValueType::from_byte(1), Some(ValueType::Value));
        assert_eq!(ValueType::from_byte(2), Some(ValueType::Deletion));
        assert_eq!(ValueType::from_byte(3), Some(ValueType::Merge));
        assert_eq!(ValueType::from_byte(0), None);
        assert!(ValueType::Deletion.is_deletion());
        assert!(!ValueType::Merge.is_deletion());
    }

    #[test]
    fn test_internal_key_encode_decode() {
        let key = InternalKey::new(Bytes::from("hello"), 12345, ValueType::Value);
        let encoded = key.encode();
        let decoded = InternalKey::decode(&encoded).unwrap();

        assert_eq!(key.user_key(), decoded.user_key());
        assert_eq!(key.sequence(), decoded.sequence());
        assert_eq!(key.value_type(), decoded.value_type());
    }

    #[test]
    fn test_internal_key_ordering() {
        let key1 = InternalKey::new(Bytes::from("aaa"), 100, ValueType::Value);
        let key2 = InternalKey::new(Bytes::from("aaa"), 200, ValueType::Value);
        let key3 = InternalKey::new(Bytes::from("bbb"), 100, ValueType::Value);

        // Same user key: higher sequence comes first.
        assert!(key2 < key1);

        // Different user keys: lexicographic order.
        assert!(key1 < key3);
        assert!(key2 < key3);
    }

    #[test]
    fn test_write_batch_counts() {
        let mut batch = WriteBatch::new();
        batch.put(b"key1".as_slice(), b"value1".as_slice());
        batch.put(b"key2".as_slice(), b"value2".as_slice());
        batch.delete(b"key3".as_slice());

        assert_eq!(batch.count(), 3);
        assert!(!batch.is_empty());
        assert!(!batch.has_merge());
        assert!(batch.byte_size() > 0);
    }

    #[test]
    fn test_write_batch_merge_flag() {
        let mut batch = WriteBatch::new();
        batch.put(b"key".as_slice(), b"value".as_slice());
        assert!(!batch.has_merge());

        batch.merge(b"key".as_slice(), b"operand".as_slice());
        assert!(batch.has_merge());

        batch.clear();
        assert!(!batch.has_merge());
    }

    #[test]
    fn test_write_batch_encode_decode() {
        let mut batch = WriteBatch::new();
        batch.put(b"key1".as_slice(), b"value1".as_slice());
        batch.delete(b"key2".as_slice());
        batch.merge(b"key3".as_slice(), b"operand".as_slice());

        let encoded = batch.encode();
        let decoded = WriteBatch::decode(&encoded).unwrap();

        assert_eq!(batch.count(), decoded.count());
        assert!(decoded.has_merge());

        for (orig, dec) in batch.entries().iter().zip(decoded.entries().iter()) {
            assert_eq!(orig.key, dec.key);
            assert_eq!(orig.value, dec.value);
            assert_eq!(orig.value_type, dec.value_type);
        }
    }

    #[test]
    fn test_write_batch_decode_truncated() {
        assert!(WriteBatch::decode(&[0, 0]).is_err());

        let mut batch = WriteBatch::new();
        batch.put(b"key".as_slice(), b"value".as_slice());
        let encoded = batch.encode();
        assert!(WriteBatch::decode(&encoded[..encoded.len() - 2]).is_err());
    }
}

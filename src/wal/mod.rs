//! Write-Ahead Log (WAL) framing.
//!
//! The WAL ensures durability by logging all writes before they're applied
//! to the MemTable. On crash recovery, the WAL is replayed to restore any
//! writes that weren't flushed to SSTables.
//!
//! # Format
//!
//! The log file is a sequence of 32KB blocks. Each physical record has:
//! - Masked CRC32 checksum (4 bytes, little-endian)
//! - Payload length (2 bytes, little-endian)
//! - Record type (1 byte)
//! - Log number (4 bytes, little-endian, recyclable records only)
//! - Payload (variable)
//!
//! Records larger than the space left in a block are fragmented across
//! blocks as FIRST, MIDDLE*, LAST. A block tail smaller than a header is
//! zero-filled and skipped by readers.

mod reader;
mod writer;

pub use reader::{WalIterator, WalReader};
pub use writer::WalWriter;

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::Result;

/// Block size for WAL (32KB).
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Legacy header size: CRC (4) + Length (2) + Type (1) = 7 bytes.
pub const HEADER_SIZE: usize = 7;

/// Recyclable header size: legacy header + log number (4) = 11 bytes.
pub const RECYCLABLE_HEADER_SIZE: usize = 11;

/// Highest valid record type byte.
pub const MAX_RECORD_TYPE: u8 = RecordType::RecyclableLast as u8;

/// Record types for WAL entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Zero is reserved for pre-allocated files.
    Zero = 0,
    /// Complete record in a single fragment.
    Full = 1,
    /// First fragment of a record.
    First = 2,
    /// Middle fragment(s) of a record.
    Middle = 3,
    /// Last fragment of a record.
    Last = 4,
    /// Recyclable counterparts carry the log number in their headers so a
    /// reused file can tell fresh records from stale ones.
    RecyclableFull = 5,
    RecyclableFirst = 6,
    RecyclableMiddle = 7,
    RecyclableLast = 8,
}

impl RecordType {
    /// Create from byte value.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(RecordType::Zero),
            1 => Some(RecordType::Full),
            2 => Some(RecordType::First),
            3 => Some(RecordType::Middle),
            4 => Some(RecordType::Last),
            5 => Some(RecordType::RecyclableFull),
            6 => Some(RecordType::RecyclableFirst),
            7 => Some(RecordType::RecyclableMiddle),
            8 => Some(RecordType::RecyclableLast),
            _ => None,
        }
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Whether this type carries a log number in its header.
    pub fn is_recyclable(&self) -> bool {
        self.to_byte() >= RecordType::RecyclableFull as u8
    }

    /// Header size for this record type.
    pub fn header_size(&self) -> usize {
        if self.is_recyclable() {
            RECYCLABLE_HEADER_SIZE
        } else {
            HEADER_SIZE
        }
    }
}

/// Append-only byte sink the WAL writer consumes.
///
/// The core does not own file-system policy; it only appends, syncs, and
/// closes.
pub trait LogSink: Send {
    /// Append bytes at the end of the log.
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Make previously appended bytes durable.
    fn sync(&mut self) -> Result<()>;

    /// Flush and release the sink.
    fn close(&mut self) -> Result<()>;
}

/// Buffered file-backed sink.
pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    /// Create a new log file, truncating any existing one.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            writer: BufWriter::with_capacity(BLOCK_SIZE * 4, file),
        })
    }

    /// Open an existing log file for appending.
    pub fn open_for_append(path: &Path) -> Result<(Self, usize)> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        Ok((
            Self {
                writer: BufWriter::with_capacity(BLOCK_SIZE * 4, file),
            },
            len,
        ))
    }
}

impl LogSink for FileSink {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// In-memory sink for tests and benchmarks.
#[derive(Debug, Default)]
pub struct MemSink {
    /// Appended bytes.
    pub data: Vec<u8>,
    /// Number of sync calls observed.
    pub syncs: usize,
}

impl MemSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogSink for MemSink {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.syncs += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

//! WAL writer implementation.

use std::path::Path;
use std::sync::Arc;

use crate::metrics::Stats;
use crate::options::SyncMode;
use crate::util::crc::{crc32, crc32_extend, mask_crc};
use crate::Result;

use super::{FileSink, LogSink, RecordType, BLOCK_SIZE, HEADER_SIZE, MAX_RECORD_TYPE};

/// WAL writer for durable logging.
///
/// Fragments user records into block-aligned physical records with masked
/// CRC headers and writes them through an append-only sink.
pub struct WalWriter<S: LogSink> {
    /// The append-only sink.
    sink: S,
    /// Current position within the current block.
    block_offset: usize,
    /// Log number stamped into recyclable headers.
    log_number: u64,
    /// Whether to emit recyclable record types.
    recycle: bool,
    /// Sync mode for durability.
    sync_mode: SyncMode,
    /// Bytes written since last sync.
    bytes_since_sync: usize,
    /// CRC seeds indexed by record type, so each record only extends over
    /// its header remainder and payload.
    type_crc: [u32; MAX_RECORD_TYPE as usize + 1],
    /// Optional statistics sink.
    stats: Option<Arc<Stats>>,
}

impl WalWriter<FileSink> {
    /// Create a new WAL file at `path`.
    pub fn create(
        path: &Path,
        log_number: u64,
        recycle: bool,
        sync_mode: SyncMode,
    ) -> Result<Self> {
        let sink = FileSink::create(path)?;
        Ok(Self::new(sink, log_number, recycle, sync_mode))
    }

    /// Open an existing WAL for appending.
    pub fn open_for_append(
        path: &Path,
        log_number: u64,
        recycle: bool,
        sync_mode: SyncMode,
    ) -> Result<Self> {
        let (sink, file_size) = FileSink::open_for_append(path)?;
        let mut writer = Self::new(sink, log_number, recycle, sync_mode);
        writer.block_offset = file_size % BLOCK_SIZE;
        Ok(writer)
    }
}

impl<S: LogSink> WalWriter<S> {
    /// Create a writer over a sink, configured from store options.
    pub fn from_options(sink: S, log_number: u64, options: &crate::options::Options) -> Self {
        Self::new(sink, log_number, options.recycle_log_files, options.sync_mode)
    }

    /// Create a writer over an arbitrary sink.
    pub fn new(sink: S, log_number: u64, recycle: bool, sync_mode: SyncMode) -> Self {
        let mut type_crc = [0u32; MAX_RECORD_TYPE as usize + 1];
        for (t, slot) in type_crc.iter_mut().enumerate() {
            *slot = crc32(&[t as u8]);
        }

        Self {
            sink,
            block_offset: 0,
            log_number,
            recycle,
            sync_mode,
            bytes_since_sync: 0,
            type_crc,
            stats: None,
        }
    }

    /// Attach a statistics sink.
    pub fn with_stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Get the log number.
    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    /// Current offset within the active block.
    pub fn block_offset(&self) -> usize {
        self.block_offset
    }

    /// Header size in effect for this writer.
    fn header_size(&self) -> usize {
        if self.recycle {
            super::RECYCLABLE_HEADER_SIZE
        } else {
            HEADER_SIZE
        }
    }

    /// Add a logical record to the WAL.
    ///
    /// The record is split into FULL or FIRST/MIDDLE*/LAST fragments as
    /// block boundaries require. An empty record still emits one FULL
    /// fragment so readers observe it.
    pub fn add_record(&mut self, data: &[u8]) -> Result<()> {
        let header_size = self.header_size();
        let mut left = data.len();
        let mut ptr = 0;
        let mut begin = true;

        loop {
            let leftover = BLOCK_SIZE - self.block_offset;

            // Switch to a new block if not even a header fits.
            if leftover < header_size {
                if leftover > 0 {
                    self.sink.append(&ZEROES[..leftover])?;
                    self.bytes_since_sync += leftover;
                    if let Some(ref stats) = self.stats {
                        stats.wal_bytes_written.add(leftover as u64);
                    }
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - header_size;
            let fragment_length = std::cmp::min(left, avail);
            let end = left == fragment_length;

            let record_type = match (begin, end, self.recycle) {
                (true, true, false) => RecordType::Full,
                (true, false, false) => RecordType::First,
                (false, true, false) => RecordType::Last,
                (false, false, false) => RecordType::Middle,
                (true, true, true) => RecordType::RecyclableFull,
                (true, false, true) => RecordType::RecyclableFirst,
                (false, true, true) => RecordType::RecyclableLast,
                (false, false, true) => RecordType::RecyclableMiddle,
            };

            self.emit_physical_record(record_type, &data[ptr..ptr + fragment_length])?;

            ptr += fragment_length;
            left -= fragment_length;
            begin = false;

            if left == 0 {
                break;
            }
        }

        if let Some(ref stats) = self.stats {
            stats.wal_records_appended.inc();
        }

        self.maybe_sync()?;

        Ok(())
    }

    /// Write a physical record (header + payload).
    fn emit_physical_record(&mut self, record_type: RecordType, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= 0xFFFF); // Length fits in 2 bytes
        let header_size = record_type.header_size();
        debug_assert!(self.block_offset + header_size + data.len() <= BLOCK_SIZE);

        let mut header = [0u8; super::RECYCLABLE_HEADER_SIZE];
        header[4..6].copy_from_slice(&(data.len() as u16).to_le_bytes());
        header[6] = record_type.to_byte();

        // CRC covers the type (via the precomputed seed), the log number in
        // recyclable mode, and the payload.
        let mut crc = self.type_crc[record_type.to_byte() as usize];
        if record_type.is_recyclable() {
            header[7..11].copy_from_slice(&(self.log_number as u32).to_le_bytes());
            crc = crc32_extend(crc, &header[7..11]);
        }
        crc = mask_crc(crc32_extend(crc, data));
        header[0..4].copy_from_slice(&crc.to_le_bytes());

        self.sink.append(&header[..header_size])?;
        self.sink.append(data)?;

        let record_size = header_size + data.len();
        self.block_offset += record_size;
        self.bytes_since_sync += record_size;
        if let Some(ref stats) = self.stats {
            stats.wal_bytes_written.add(record_size as u64);
        }

        Ok(())
    }

    /// Sync if required by sync mode.
    fn maybe_sync(&mut self) -> Result<()> {
        match self.sync_mode {
            SyncMode::Always => {
                self.sync()?;
            }
            SyncMode::Bytes { bytes } => {
                if self.bytes_since_sync >= bytes {
                    self.sync()?;
                }
            }
            SyncMode::Interval { .. } => {
                // Interval-based sync is handled externally.
            }
            SyncMode::None => {}
        }
        Ok(())
    }

    /// Force a sync to durable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.sink.sync()?;
        self.bytes_since_sync = 0;
        Ok(())
    }

    /// Close the writer, flushing the sink.
    pub fn close(mut self) -> Result<S> {
        self.sink.close()?;
        Ok(self.sink)
    }

    /// Borrow the underlying sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }
}

/// Zero padding source for block tails.
static ZEROES: [u8; super::RECYCLABLE_HEADER_SIZE] = [0u8; super::RECYCLABLE_HEADER_SIZE];

//! WAL reader implementation.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use bytes::Bytes;

use crate::util::crc::{crc32, crc32_extend, unmask_crc};
use crate::{Error, Result};

use super::{RecordType, BLOCK_SIZE, HEADER_SIZE, RECYCLABLE_HEADER_SIZE};

/// WAL reader for recovery.
///
/// Re-assembles logical records from physical fragments, verifying masked
/// CRC checksums. A truncated record at the tail of the log is treated as
/// end of log rather than corruption; a recyclable record carrying a stale
/// log number marks the end of the live portion of a recycled file.
pub struct WalReader<R: Read> {
    /// Buffered reader over the log bytes.
    reader: BufReader<R>,
    /// Current block buffer.
    buffer: Vec<u8>,
    /// Current position within the buffer.
    buffer_offset: usize,
    /// Valid bytes in the buffer.
    buffer_size: usize,
    /// Whether we've reached EOF.
    eof: bool,
    /// Whether to report corruption or skip damaged regions.
    checksum_errors_are_fatal: bool,
    /// Expected log number for recyclable records.
    log_number: u64,
}

impl WalReader<File> {
    /// Open a WAL file for reading.
    pub fn open(path: &Path, log_number: u64) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(file, log_number))
    }
}

impl<R: Read> WalReader<R> {
    /// Create a reader over an arbitrary byte source.
    pub fn new(source: R, log_number: u64) -> Self {
        Self {
            reader: BufReader::with_capacity(BLOCK_SIZE * 4, source),
            buffer: vec![0u8; BLOCK_SIZE],
            buffer_offset: 0,
            buffer_size: 0,
            eof: false,
            checksum_errors_are_fatal: true,
            log_number,
        }
    }

    /// Set whether checksum errors should be fatal.
    pub fn set_checksum_errors_fatal(&mut self, fatal: bool) {
        self.checksum_errors_are_fatal = fatal;
    }

    /// Get the expected log number.
    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    /// Read the next logical record.
    ///
    /// Returns None when there are no more records.
    pub fn read_record(&mut self) -> Result<Option<Bytes>> {
        let mut scratch = Vec::new();
        let mut in_fragmented_record = false;

        loop {
            match self.read_physical_record()? {
                Some((record_type, data)) => match record_type {
                    RecordType::Full | RecordType::RecyclableFull => {
                        if in_fragmented_record {
                            if self.checksum_errors_are_fatal {
                                return Err(Error::corruption(
                                    "full record inside fragmented record",
                                ));
                            }
                            scratch.clear();
                        }
                        return Ok(Some(Bytes::from(data)));
                    }
                    RecordType::First | RecordType::RecyclableFirst => {
                        if in_fragmented_record {
                            if self.checksum_errors_are_fatal {
                                return Err(Error::corruption(
                                    "first record inside fragmented record",
                                ));
                            }
                            scratch.clear();
                        }
                        scratch.extend_from_slice(&data);
                        in_fragmented_record = true;
                    }
                    RecordType::Middle | RecordType::RecyclableMiddle => {
                        if !in_fragmented_record {
                            if self.checksum_errors_are_fatal {
                                return Err(Error::corruption(
                                    "middle record without preceding first",
                                ));
                            }
                            continue;
                        }
                        scratch.extend_from_slice(&data);
                    }
                    RecordType::Last | RecordType::RecyclableLast => {
                        if !in_fragmented_record {
                            if self.checksum_errors_are_fatal {
                                return Err(Error::corruption(
                                    "last record without preceding first",
                                ));
                            }
                            continue;
                        }
                        scratch.extend_from_slice(&data);
                        return Ok(Some(Bytes::from(std::mem::take(&mut scratch))));
                    }
                    RecordType::Zero => {
                        // Preallocated zero fill; nothing further in this
                        // block.
                        continue;
                    }
                },
                None => {
                    // A dangling fragment at the tail is an incomplete
                    // write, dropped on recovery.
                    return Ok(None);
                }
            }
        }
    }

    /// Read a physical record from the current position.
    fn read_physical_record(&mut self) -> Result<Option<(RecordType, Vec<u8>)>> {
        loop {
            // A tail smaller than a legacy header is padding.
            if self.buffer_offset + HEADER_SIZE > self.buffer_size {
                if !self.read_block()? {
                    return Ok(None);
                }
                continue;
            }

            let header = &self.buffer[self.buffer_offset..self.buffer_offset + HEADER_SIZE];
            let crc_stored = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let length = u16::from_le_bytes([header[4], header[5]]) as usize;
            let record_type_byte = header[6];

            let record_type = match RecordType::from_byte(record_type_byte) {
                Some(rt) => rt,
                None => {
                    if self.checksum_errors_are_fatal {
                        return Err(Error::corruption("invalid record type"));
                    }
                    self.buffer_offset = self.buffer_size;
                    continue;
                }
            };

            if record_type == RecordType::Zero {
                // Zero fill runs to the end of the block.
                self.buffer_offset = self.buffer_size;
                return Ok(Some((RecordType::Zero, Vec::new())));
            }

            let header_size = record_type.header_size();
            if self.buffer_offset + header_size > self.buffer_size {
                if self.eof {
                    return Ok(None);
                }
                if self.checksum_errors_are_fatal {
                    return Err(Error::corruption("truncated recyclable header"));
                }
                self.buffer_offset = self.buffer_size;
                continue;
            }

            // Recycled files retain records from their previous life; a
            // mismatched log number marks the end of the live log.
            let mut crc = crc32(&[record_type_byte]);
            if record_type.is_recyclable() {
                let number_bytes =
                    &self.buffer[self.buffer_offset + HEADER_SIZE..self.buffer_offset + header_size];
                let record_log_number =
                    u32::from_le_bytes([number_bytes[0], number_bytes[1], number_bytes[2], number_bytes[3]]);
                if u64::from(record_log_number) != self.log_number {
                    return Ok(None);
                }
                crc = crc32_extend(crc, number_bytes);
            }

            if self.buffer_offset + header_size + length > self.buffer_size {
                if self.eof {
                    // Incomplete write at the tail of the log.
                    return Ok(None);
                }
                if self.checksum_errors_are_fatal {
                    return Err(Error::corruption("record extends beyond block"));
                }
                self.buffer_offset = self.buffer_size;
                continue;
            }

            let data_start = self.buffer_offset + header_size;
            let data_end = data_start + length;
            let data = &self.buffer[data_start..data_end];

            let crc_actual = crc32_extend(crc, data);
            let crc_expected = unmask_crc(crc_stored);
            if crc_expected != crc_actual {
                if self.checksum_errors_are_fatal {
                    return Err(Error::CrcMismatch {
                        expected: crc_expected,
                        actual: crc_actual,
                    });
                }
                self.buffer_offset = self.buffer_size;
                continue;
            }

            self.buffer_offset = data_end;

            return Ok(Some((record_type, data.to_vec())));
        }
    }

    /// Read the next block into the buffer.
    fn read_block(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }

        self.buffer_offset = 0;
        self.buffer_size = 0;

        // Loop because a raw reader may return short reads mid-file.
        while self.buffer_size < BLOCK_SIZE {
            let n = self.reader.read(&mut self.buffer[self.buffer_size..])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            self.buffer_size += n;
        }

        Ok(self.buffer_size > 0)
    }
}

/// Iterator over WAL records.
pub struct WalIterator<'a, R: Read> {
    reader: &'a mut WalReader<R>,
}

impl<'a, R: Read> WalIterator<'a, R> {
    /// Create a new iterator.
    pub fn new(reader: &'a mut WalReader<R>) -> Self {
        Self { reader }
    }
}

impl<'a, R: Read> Iterator for WalIterator<'a, R> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

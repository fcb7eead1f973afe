//! # rilldb
//!
//! The write-coordination and block-machinery core of an embedded
//! log-structured key-value store.
//!
//! ## What's here
//!
//! - **Group commit**: concurrent writers batched into serialized write
//!   groups over a lock-free intrusive list, with leader election,
//!   adaptive spin/yield/block waiting, optional parallel memtable
//!   ingestion, and a pipelined WAL/memtable split
//! - **WAL framing**: user records fragmented into checksummed,
//!   block-aligned physical records, with recyclable-log support and a
//!   recovering reader
//! - **Block layer**: prefix-compressed data and index blocks with
//!   restart-point binary seek, delta-encoded index handles, a
//!   read-amplification bitmap, and a global sequence override
//! - **Arena**: dual-ended bump allocator backing memtable nodes
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use rilldb::{CommitPipeline, Options, WriteBatch, WriteOptions};
//!
//! let mut batch = WriteBatch::new();
//! batch.put(b"hello".as_slice(), b"world".as_slice());
//! let sequence = pipeline.write(WriteOptions::default(), batch)?;
//! ```
//!
//! The pipeline hands each write to the coordinator; one thread leads a
//! group, appends a single WAL record for all of it, assigns contiguous
//! sequence numbers, and fans the batches out to the memtable.

// Public modules
pub mod error;
pub mod options;
pub mod types;

// Core modules
pub mod memtable;
pub mod metrics;
pub mod sstable;
pub mod wal;
pub mod write;

mod pipeline;
mod util;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use options::{Options, SyncMode, WriteOptions};
pub use types::{InternalKey, LookupResult, ValueType, WriteBatch};

pub use memtable::arena::Arena;
pub use memtable::MemTable;
pub use metrics::{Stats, StatsSnapshot};
pub use pipeline::CommitPipeline;
pub use sstable::{Block, BlockBuilder, BlockHandle, BlockReadAmpBitmap};
pub use util::comparator::{BytewiseComparator, Comparator, InternalKeyComparator};
pub use wal::{LogSink, WalReader, WalWriter};
pub use write::{WriteCoordinator, Writer};

//! The commit pipeline.
//!
//! Wires the writer coordinator to the WAL and the memtable. A client
//! thread calls [`CommitPipeline::write`]; the writer either leads a
//! group (appending one concatenated WAL record, assigning contiguous
//! sequence numbers, then ingesting memtables serially or launching the
//! parallel phase) or parks until a leader hands it a terminal state. The
//! moment the leader assigns the group's sequence range is the
//! linearization point of every write in the group.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::memtable::MemTable;
use crate::metrics::Stats;
use crate::options::{Options, WriteOptions};
use crate::types::WriteBatch;
use crate::wal::{LogSink, WalWriter};
use crate::write::{
    WriteCoordinator, WriteGroup, Writer, STATE_COMPLETED, STATE_GROUP_LEADER,
    STATE_MEMTABLE_WRITER_LEADER, STATE_PARALLEL_MEMTABLE_WRITER,
};
use crate::Result;

/// Write-path driver: group commit over one WAL and one memtable.
pub struct CommitPipeline<S: LogSink> {
    options: Options,
    coordinator: WriteCoordinator,
    wal: Mutex<WalWriter<S>>,
    memtable: RwLock<Arc<MemTable>>,
    /// Highest sequence number published to readers.
    last_sequence: AtomicU64,
    /// Serializes administrative barriers (WAL rotation).
    admin_mu: Mutex<()>,
    stats: Arc<Stats>,
}

impl<S: LogSink> CommitPipeline<S> {
    /// Create a pipeline over an existing WAL writer and memtable.
    pub fn new(
        options: Options,
        wal: WalWriter<S>,
        memtable: Arc<MemTable>,
        stats: Arc<Stats>,
    ) -> Self {
        let coordinator = WriteCoordinator::new(&options);
        Self {
            options,
            coordinator,
            wal: Mutex::new(wal),
            memtable: RwLock::new(memtable),
            last_sequence: AtomicU64::new(0),
            admin_mu: Mutex::new(()),
            stats,
        }
    }

    /// The store options this pipeline runs with.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The statistics sink.
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// The coordinator (exposed for stall control).
    pub fn coordinator(&self) -> &WriteCoordinator {
        &self.coordinator
    }

    /// Highest published sequence number.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Acquire)
    }

    /// Seed the sequence counter during recovery.
    pub fn set_last_sequence(&self, sequence: u64) {
        self.last_sequence.store(sequence, Ordering::Release);
    }

    /// The current memtable.
    pub fn memtable(&self) -> Arc<MemTable> {
        self.memtable.read().clone()
    }

    /// Replace the memtable, returning the previous one.
    pub fn swap_memtable(&self, memtable: Arc<MemTable>) -> Arc<MemTable> {
        std::mem::replace(&mut *self.memtable.write(), memtable)
    }

    /// Build a fresh memtable sized from this pipeline's options.
    pub fn new_memtable(&self, id: u64) -> Arc<MemTable> {
        Arc::new(MemTable::with_arena_block_size(
            id,
            self.options.arena_block_size,
        ))
    }

    /// Engage admission control: new writers queue up behind the stall
    /// sentinel; `no_slowdown` writers fail immediately.
    pub fn begin_write_stall(&self) {
        self.coordinator.begin_write_stall();
    }

    /// Release admission control.
    pub fn end_write_stall(&self) {
        self.coordinator.end_write_stall();
    }

    /// Commit a batch. Returns the first sequence number assigned to it.
    pub fn write(&self, options: WriteOptions, batch: WriteBatch) -> Result<u64> {
        if batch.is_empty() {
            return Ok(self.last_sequence());
        }

        let w = Writer::new(batch, options);
        let result = if self.coordinator.pipelined() {
            self.pipelined_write_impl(&w)
        } else {
            self.write_impl(&w)
        };

        if let Err(ref e) = result {
            if e.is_incomplete() {
                self.stats.write_stall_rejections.inc();
            }
        }
        result
    }

    /// Force the WAL down to durable storage.
    pub fn flush_wal(&self) -> Result<()> {
        self.wal.lock().sync()
    }

    /// Swap in a fresh WAL writer, returning the old one.
    ///
    /// Runs as an unbatched barrier: the swap happens with no group in
    /// flight, so no group's record straddles two logs.
    pub fn rotate_wal(&self, new_wal: WalWriter<S>) -> Result<WalWriter<S>> {
        let w = Writer::new_unbatched(WriteOptions::default());
        let guard = self.admin_mu.lock();
        let guard = self.coordinator.enter_unbatched(&w, &self.admin_mu, guard);

        let old = std::mem::replace(&mut *self.wal.lock(), new_wal);

        self.coordinator.exit_unbatched(&w);
        drop(guard);
        Ok(old)
    }

    // === Non-pipelined commit ===

    fn write_impl(&self, w: &Writer) -> Result<u64> {
        self.coordinator.join_batch_group(w);

        let state = w.state();
        if state == STATE_PARALLEL_MEMTABLE_WRITER {
            // Launched by the leader to ingest our own batch.
            if w.should_write_to_memtable() {
                let memtable = self.memtable();
                if let Some(ref batch) = w.batch {
                    memtable.apply(batch, w.sequence());
                }
            }
            if self.coordinator.complete_parallel_memtable_writer(w) {
                // Last finisher performs exit duties for the leader.
                self.coordinator.exit_as_batch_group_follower(w);
            }
            debug_assert_eq!(w.state(), STATE_COMPLETED);
            return w.status().map(|_| w.sequence());
        }

        if state == STATE_COMPLETED {
            // The leader committed us.
            return w.status().map(|_| w.sequence());
        }

        debug_assert_eq!(state, STATE_GROUP_LEADER);
        let write_group = WriteGroup::new();
        self.coordinator.enter_as_batch_group_leader(w, &write_group);

        let parallel_ok = self.assign_sequences(&write_group);
        let status = self.write_group_wal(w, &write_group);

        let mut handed_off = false;
        if status.is_ok() {
            self.last_sequence
                .store(write_group.last_sequence(), Ordering::Release);

            let parallel = parallel_ok
                && write_group.size() > 1
                && self.coordinator.allow_concurrent_memtable_write();

            if parallel {
                self.coordinator.launch_parallel_memtable_writers(&write_group);
                if w.should_write_to_memtable() {
                    let memtable = self.memtable();
                    if let Some(ref batch) = w.batch {
                        memtable.apply(batch, w.sequence());
                    }
                }
                if self.coordinator.complete_parallel_memtable_writer(w) {
                    self.coordinator
                        .exit_as_batch_group_leader(&write_group, status.clone());
                } else {
                    // A follower ran the exit on our behalf; fold any
                    // follower failure into our own status.
                    if w.status().is_ok() {
                        if let Err(e) = write_group.status() {
                            w.set_status(Err(e));
                        }
                    }
                }
                handed_off = true;
            } else {
                let memtable = self.memtable();
                for member_ptr in write_group.iter() {
                    let member = unsafe { &*member_ptr };
                    if member.should_write_to_memtable() {
                        if let Some(ref batch) = member.batch {
                            memtable.apply(batch, member.sequence());
                        }
                    }
                }
            }
        }

        if !handed_off {
            self.coordinator
                .exit_as_batch_group_leader(&write_group, status.clone());
            w.set_status(status);
        }

        self.record_group_stats(&write_group);
        w.status().map(|_| w.sequence())
    }

    // === Pipelined commit ===

    fn pipelined_write_impl(&self, w: &Writer) -> Result<u64> {
        self.coordinator.join_batch_group(w);

        if w.state() == STATE_GROUP_LEADER {
            let wal_group = WriteGroup::new();
            self.coordinator.enter_as_batch_group_leader(w, &wal_group);

            let _parallel_ok = self.assign_sequences(&wal_group);
            let status = self.write_group_wal(w, &wal_group);
            if status.is_ok() {
                self.last_sequence
                    .store(wal_group.last_sequence(), Ordering::Release);
            } else {
                // A failed WAL append keeps the whole group out of the
                // memtable stage, the leader included.
                w.set_status(status.clone());
            }

            self.record_group_stats(&wal_group);

            // Splices the group onto the memtable queue, elects the next
            // WAL leader, and waits for our own memtable-stage state.
            self.coordinator
                .exit_as_batch_group_leader(&wal_group, status);
        }

        let state = w.state();
        if state == STATE_MEMTABLE_WRITER_LEADER {
            let memtable_group = WriteGroup::new();
            self.coordinator.enter_as_memtable_writer(w, &memtable_group);

            let parallel = memtable_group.size() > 1
                && self.coordinator.allow_concurrent_memtable_write();

            if parallel {
                self.coordinator
                    .launch_parallel_memtable_writers(&memtable_group);
                if w.should_write_to_memtable() {
                    let memtable = self.memtable();
                    if let Some(ref batch) = w.batch {
                        memtable.apply(batch, w.sequence());
                    }
                }
                if self.coordinator.complete_parallel_memtable_writer(w) {
                    self.coordinator.exit_as_memtable_writer(w, &memtable_group);
                }
            } else {
                let memtable = self.memtable();
                for member_ptr in memtable_group.iter() {
                    let member = unsafe { &*member_ptr };
                    if member.should_write_to_memtable() {
                        if let Some(ref batch) = member.batch {
                            memtable.apply(batch, member.sequence());
                        }
                    }
                }
                self.coordinator.exit_as_memtable_writer(w, &memtable_group);
            }
        } else if state == STATE_PARALLEL_MEMTABLE_WRITER {
            if w.should_write_to_memtable() {
                let memtable = self.memtable();
                if let Some(ref batch) = w.batch {
                    memtable.apply(batch, w.sequence());
                }
            }
            if self.coordinator.complete_parallel_memtable_writer(w) {
                let group = unsafe { &*w.write_group.load(Ordering::Acquire) };
                self.coordinator.exit_as_memtable_writer(w, group);
            }
        }

        debug_assert_eq!(w.state(), STATE_COMPLETED);
        w.status().map(|_| w.sequence())
    }

    // === Shared phases ===

    /// Assign contiguous sequence numbers to every member, leader first.
    ///
    /// This is the linearization point of the group. Returns whether the
    /// group is eligible for the parallel memtable phase (no merge
    /// operands anywhere).
    fn assign_sequences(&self, write_group: &WriteGroup) -> bool {
        let mut sequence = self.last_sequence.load(Ordering::Acquire) + 1;
        let mut parallel_ok = true;

        for member_ptr in write_group.iter() {
            let member = unsafe { &*member_ptr };
            member.set_sequence(sequence);
            sequence += member.batch_count() as u64;
            if let Some(ref batch) = member.batch {
                parallel_ok &= !batch.has_merge();
            }
        }

        write_group.last_sequence.set(sequence - 1);
        parallel_ok
    }

    /// Append the group's batches as one WAL record, honoring per-writer
    /// `disable_wal`, and sync if the leader asked for it.
    fn write_group_wal(&self, leader: &Writer, write_group: &WriteGroup) -> Result<()> {
        if leader.disable_wal {
            // Group construction never puts a WAL-requiring write behind
            // a WAL-disabled leader.
            return Ok(());
        }

        let record = if write_group.size() == 1 {
            leader.batch.as_ref().map(|b| b.encode())
        } else {
            let mut merged = WriteBatch::new();
            for member_ptr in write_group.iter() {
                let member = unsafe { &*member_ptr };
                if !member.disable_wal {
                    if let Some(ref batch) = member.batch {
                        merged.append_from(batch);
                    }
                }
            }
            if merged.is_empty() {
                None
            } else {
                Some(merged.encode())
            }
        };

        let Some(record) = record else {
            return Ok(());
        };

        let mut wal = self.wal.lock();
        wal.add_record(&record)?;
        if leader.sync {
            wal.sync()?;
        }
        Ok(())
    }

    fn record_group_stats(&self, write_group: &WriteGroup) {
        self.stats.group_commits.inc();
        self.stats.writes_batched.add(write_group.size() as u64);
        self.stats.write_group_size.observe(write_group.size() as u64);
    }
}

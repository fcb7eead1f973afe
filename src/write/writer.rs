//! Writer handles and write groups.
//!
//! A [`Writer`] is one pending append: the submitting thread owns it on
//! its stack for the duration of the commit, and the coordinator links
//! writers into an intrusive list through their atomic neighbor pointers.
//! All cross-thread state lives in atomics; `sequence` and `status` are
//! published by the release store of the state word that hands the writer
//! back to its owner.

use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::{Condvar, Mutex};

use crate::options::WriteOptions;
use crate::types::WriteBatch;
use crate::Result;

/// Writer states. Powers of two so waits can accept a goal set.
pub const STATE_INIT: u8 = 1;
/// Elected leader of a WAL write group.
pub const STATE_GROUP_LEADER: u8 = 2;
/// Leader of the memtable stage (pipelined mode).
pub const STATE_MEMTABLE_WRITER_LEADER: u8 = 4;
/// Launched to write its own batch into the memtable.
pub const STATE_PARALLEL_MEMTABLE_WRITER: u8 = 8;
/// Commit finished; the owner may reclaim the writer.
pub const STATE_COMPLETED: u8 = 16;
/// The writer has committed to blocking on its condvar. Any waker must
/// take the writer's mutex before replacing this state.
pub const STATE_LOCKED_WAITING: u8 = 32;

/// Lazily constructed mutex + condvar used only on the slow wait path.
pub(crate) struct SyncSlot {
    pub(crate) mu: Mutex<()>,
    pub(crate) cv: Condvar,
}

/// Hook consulted when building a write group.
pub trait WriteCallback: Send + Sync {
    /// Whether this writer may share a group with others. Writers that
    /// refuse stay solo group leaders.
    fn allow_write_batching(&self) -> bool;
}

/// One pending append.
pub struct Writer {
    /// The batch payload. None marks an administrative barrier writer.
    pub batch: Option<WriteBatch>,
    /// Sync the WAL before acknowledging.
    pub sync: bool,
    /// Skip the WAL for this write.
    pub disable_wal: bool,
    /// Fail instead of waiting when a write stall is in effect.
    pub no_slowdown: bool,
    /// Batching hook.
    pub callback: Option<Box<dyn WriteCallback>>,

    /// State word; see the `STATE_*` constants.
    state: AtomicU8,
    /// First sequence number assigned to this writer's batch. Written by
    /// the leader before the state handoff that publishes it.
    sequence: AtomicU64,
    /// Commit outcome. Written only by the current owner of the writer's
    /// transitions (the leader, or the writer itself), always before a
    /// release state store; read by the submitter after observing a
    /// terminal state.
    status: UnsafeCell<Result<()>>,
    /// Next-older writer in the pending list. Immutable from enqueue
    /// until dequeue.
    pub(crate) link_older: AtomicPtr<Writer>,
    /// Next-newer writer; written only by a leader while it owns the
    /// sub-list.
    pub(crate) link_newer: AtomicPtr<Writer>,
    /// Group this writer currently belongs to.
    pub(crate) write_group: AtomicPtr<WriteGroup>,
    /// Slow-path blocking slot, created on first use.
    sync_slot: OnceLock<SyncSlot>,
}

// Shared-mutable fields are atomics or protocol-guarded UnsafeCells; the
// list nodes stay alive until their owner observes a terminal state.
unsafe impl Send for Writer {}
unsafe impl Sync for Writer {}

impl Writer {
    /// Create a writer carrying a batch.
    pub fn new(batch: WriteBatch, options: WriteOptions) -> Self {
        Self {
            batch: Some(batch),
            sync: options.sync,
            disable_wal: options.disable_wal,
            no_slowdown: options.no_slowdown,
            callback: None,
            state: AtomicU8::new(STATE_INIT),
            sequence: AtomicU64::new(0),
            status: UnsafeCell::new(Ok(())),
            link_older: AtomicPtr::new(std::ptr::null_mut()),
            link_newer: AtomicPtr::new(std::ptr::null_mut()),
            write_group: AtomicPtr::new(std::ptr::null_mut()),
            sync_slot: OnceLock::new(),
        }
    }

    /// Create a batch-less writer (administrative barrier).
    pub fn new_unbatched(options: WriteOptions) -> Self {
        let mut w = Self::new(WriteBatch::new(), options);
        w.batch = None;
        w
    }

    /// Attach a batching callback.
    pub fn with_callback(mut self, callback: Box<dyn WriteCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Current state (acquire).
    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn state_relaxed(&self) -> u8 {
        self.state.load(Ordering::Relaxed)
    }

    pub(crate) fn store_state(&self, state: u8) {
        self.state.store(state, Ordering::Release);
    }

    pub(crate) fn cas_state(&self, current: u8, new: u8) -> std::result::Result<u8, u8> {
        self.state
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// First sequence number assigned to this writer's batch.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    pub(crate) fn set_sequence(&self, sequence: u64) {
        self.sequence.store(sequence, Ordering::Relaxed);
    }

    /// Commit outcome. Meaningful to the submitter once a terminal state
    /// has been observed.
    pub fn status(&self) -> Result<()> {
        unsafe { (*self.status.get()).clone() }
    }

    pub(crate) fn set_status(&self, status: Result<()>) {
        unsafe {
            *self.status.get() = status;
        }
    }

    /// Byte size of the batch (0 for barrier writers).
    pub fn batch_size(&self) -> usize {
        self.batch.as_ref().map_or(0, |b| b.byte_size())
    }

    /// Number of entries in the batch.
    pub fn batch_count(&self) -> usize {
        self.batch.as_ref().map_or(0, |b| b.count())
    }

    /// Whether this writer has anything for the memtable stage.
    pub fn should_write_to_memtable(&self) -> bool {
        self.status().is_ok() && self.batch.as_ref().is_some_and(|b| !b.is_empty())
    }

    /// Whether this writer's callback permits group membership.
    pub fn allow_write_batching(&self) -> bool {
        self.callback
            .as_ref()
            .map_or(true, |c| c.allow_write_batching())
    }

    /// The blocking slot, created on first use. Creation is published to
    /// wakers by the `STATE_LOCKED_WAITING` transition.
    pub(crate) fn sync_slot(&self) -> &SyncSlot {
        self.sync_slot.get_or_init(|| SyncSlot {
            mu: Mutex::new(()),
            cv: Condvar::new(),
        })
    }

    pub(crate) fn as_ptr(&self) -> *mut Writer {
        self as *const Writer as *mut Writer
    }
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("state", &self.state_relaxed())
            .field("sync", &self.sync)
            .field("disable_wal", &self.disable_wal)
            .field("no_slowdown", &self.no_slowdown)
            .field("batch_count", &self.batch_count())
            .finish()
    }
}

/// A contiguous prefix of the pending list committed atomically.
///
/// Owned by its leader for the lifetime of the commit. The `Cell` fields
/// are mutated only by the thread currently acting as leader; parallel
/// followers read them after the state handoff that launched them, and
/// write `status` only under the leader's sync-slot mutex.
pub struct WriteGroup {
    leader: Cell<*mut Writer>,
    last_writer: Cell<*mut Writer>,
    size: Cell<usize>,
    /// Highest sequence number assigned to the group.
    pub(crate) last_sequence: Cell<u64>,
    status: UnsafeCell<Result<()>>,
    /// Writers still inside the parallel memtable phase.
    pub(crate) running: AtomicUsize,
}

unsafe impl Send for WriteGroup {}
unsafe impl Sync for WriteGroup {}

impl WriteGroup {
    /// Create an empty group.
    pub fn new() -> Self {
        Self {
            leader: Cell::new(std::ptr::null_mut()),
            last_writer: Cell::new(std::ptr::null_mut()),
            size: Cell::new(0),
            last_sequence: Cell::new(0),
            status: UnsafeCell::new(Ok(())),
            running: AtomicUsize::new(0),
        }
    }

    /// Number of writers in the group.
    pub fn size(&self) -> usize {
        self.size.get()
    }

    /// Highest sequence number assigned to the group.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.get()
    }

    /// Group status; monotonic, once non-OK it sticks.
    pub fn status(&self) -> Result<()> {
        unsafe { (*self.status.get()).clone() }
    }

    /// Record a failure. Only the leader, or a parallel follower holding
    /// the leader's sync-slot mutex, may call this.
    pub(crate) fn set_status(&self, status: Result<()>) {
        unsafe {
            let slot = &mut *self.status.get();
            if slot.is_ok() {
                *slot = status;
            }
        }
    }

    pub(crate) fn leader_ptr(&self) -> *mut Writer {
        self.leader.get()
    }

    pub(crate) fn last_writer_ptr(&self) -> *mut Writer {
        self.last_writer.get()
    }

    pub(crate) fn set_leader(&self, w: *mut Writer) {
        self.leader.set(w);
    }

    pub(crate) fn set_last_writer(&self, w: *mut Writer) {
        self.last_writer.set(w);
    }

    pub(crate) fn set_size(&self, size: usize) {
        self.size.set(size);
    }

    pub(crate) fn as_ptr(&self) -> *mut WriteGroup {
        self as *const WriteGroup as *mut WriteGroup
    }

    /// Iterate the group from leader to last writer.
    ///
    /// Safe to call while the group links are frozen: after
    /// `enter_as_batch_group_leader` and before the group is dismantled.
    pub(crate) fn iter(&self) -> WriteGroupIter {
        WriteGroupIter {
            current: self.leader.get(),
            last: self.last_writer.get(),
            done: self.leader.get().is_null(),
        }
    }
}

impl Default for WriteGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw iterator over a frozen group's members.
pub(crate) struct WriteGroupIter {
    current: *mut Writer,
    last: *mut Writer,
    done: bool,
}

impl Iterator for WriteGroupIter {
    type Item = *mut Writer;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let current = self.current;
        if current == self.last {
            self.done = true;
        } else {
            // link_newer chains were completed by the leader before the
            // group froze.
            self.current = unsafe { (*current).link_newer.load(Ordering::Acquire) };
            debug_assert!(!self.current.is_null());
        }
        Some(current)
    }
}

/// Per-call-site adaptation state for the yield phase of `await_state`.
///
/// The credit says whether yielding has been paying off at this call site;
/// negative credit routes straight to blocking.
pub struct AdaptationContext {
    name: &'static str,
    pub(crate) yield_credit: AtomicI32,
}

impl AdaptationContext {
    /// Create a context. Intended for statics, one per call site.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            yield_credit: AtomicI32::new(0),
        }
    }

    /// Call-site label.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current yield credit.
    pub fn yield_credit(&self) -> i32 {
        self.yield_credit.load(Ordering::Relaxed)
    }
}

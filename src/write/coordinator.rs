//! The write coordinator.
//!
//! Writers CAS themselves onto the head of an intrusive pending list. The
//! writer that lands on an empty list is the group leader; it completes
//! the doubly-linked chain, selects a bounded group of compatible
//! followers, commits them in one shot, and on exit either hands
//! leadership to the oldest newcomer or empties the list. Followers wait
//! in a three-phase adaptive loop: a short spin, an optional sampled
//! yield phase with slow-yield detection, then a condvar block behind a
//! lazily built mutex.

use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::options::{Options, WriteOptions};
use crate::util::random;
use crate::{Error, Result};

use super::writer::{AdaptationContext, SyncSlot, WriteGroup, Writer};
use super::{
    STATE_COMPLETED, STATE_GROUP_LEADER, STATE_INIT, STATE_LOCKED_WAITING,
    STATE_MEMTABLE_WRITER_LEADER, STATE_PARALLEL_MEMTABLE_WRITER,
};

/// Spin iterations before the wait escalates; roughly a microsecond of
/// pause instructions on current hardware.
const SPIN_TRIES: u32 = 200;

/// Slow yields tolerated within one wait before giving up on yielding.
const MAX_SLOW_YIELDS_WHILE_SPINNING: usize = 3;

/// Yield-credit updates are sampled at 1/SAMPLING_BASE.
const SAMPLING_BASE: u64 = 256;

/// Credit adjustment per sampled outcome; decays by 1/1024 per update, so
/// the credit stays within i32 range.
const CREDIT_STEP: i32 = 131072;

/// Group size cap in bytes.
const MAX_WRITE_GROUP_SIZE: usize = 1 << 20;

/// Small writes only pull in this much beyond their own size, so they are
/// not held hostage by a flood of large followers.
const SMALL_WRITE_THRESHOLD: usize = 128 << 10;

static JBG_CTX: AdaptationContext = AdaptationContext::new("join_batch_group");
static EABGL_CTX: AdaptationContext = AdaptationContext::new("exit_as_batch_group_leader");
static CPMTW_CTX: AdaptationContext = AdaptationContext::new("complete_parallel_memtable_writer");
static EU_CTX: AdaptationContext = AdaptationContext::new("enter_unbatched");
static WFMW_CTX: AdaptationContext = AdaptationContext::new("wait_for_memtable_writers");

/// Serializes concurrent writers into batched write groups.
pub struct WriteCoordinator {
    /// Yield-phase bound in microseconds; zero disables the yield phase.
    max_yield_usec: u64,
    /// Threshold above which one yield counts as slow.
    slow_yield_usec: u64,
    allow_concurrent_memtable_write: bool,
    enable_pipelined_write: bool,

    /// Head of the pending list (pre-WAL queue).
    newest_writer: AtomicPtr<Writer>,
    /// Head of the memtable-stage queue (pipelined mode only).
    newest_memtable_writer: AtomicPtr<Writer>,

    /// Sentinel spliced into `newest_writer` while admission control has
    /// writes stalled. Boxed so its address is stable.
    write_stall_dummy: Box<Writer>,
    /// Guards the stall transition; enqueuers wait here while stalled.
    stall_mu: Mutex<()>,
    stall_cv: Condvar,
}

impl WriteCoordinator {
    /// Create a coordinator from store options.
    pub fn new(options: &Options) -> Self {
        Self {
            max_yield_usec: options.max_yield_usec(),
            slow_yield_usec: options.write_thread_slow_yield_usec,
            allow_concurrent_memtable_write: options.allow_concurrent_memtable_write,
            enable_pipelined_write: options.enable_pipelined_write,
            newest_writer: AtomicPtr::new(std::ptr::null_mut()),
            newest_memtable_writer: AtomicPtr::new(std::ptr::null_mut()),
            write_stall_dummy: Box::new(Writer::new_unbatched(WriteOptions::default())),
            stall_mu: Mutex::new(()),
            stall_cv: Condvar::new(),
        }
    }

    /// Whether the WAL and memtable stages run as separate queues.
    pub fn pipelined(&self) -> bool {
        self.enable_pipelined_write
    }

    /// Whether followers may ingest their batches in parallel.
    pub fn allow_concurrent_memtable_write(&self) -> bool {
        self.allow_concurrent_memtable_write
    }

    fn stall_ptr(&self) -> *mut Writer {
        self.write_stall_dummy.as_ref().as_ptr()
    }

    // === Adaptive wait ===

    /// Block until `w.state & goal_mask != 0`, returning the state.
    ///
    /// Phase 1 spins for about a microsecond. Phase 2 yields for up to
    /// `max_yield_usec`, but only while the context's yield credit says
    /// yielding has been beating the futex round-trip; three slow yields
    /// abandon the phase immediately. Phase 3 blocks on the writer's
    /// condvar. Credit updates are sampled at 1/256, with an
    /// exponential-decay step sized to saturate safely in 32 bits.
    pub fn await_state(&self, w: &Writer, goal_mask: u8, ctx: &AdaptationContext) -> u8 {
        let mut state = 0u8;
        for _ in 0..SPIN_TRIES {
            state = w.state();
            if state & goal_mask != 0 {
                return state;
            }
            std::hint::spin_loop();
        }

        let mut update_ctx = false;
        let mut would_spin_again = false;

        if self.max_yield_usec > 0 {
            update_ctx = random::with_tls_random(|r| r.one_in(SAMPLING_BASE));

            if update_ctx || ctx.yield_credit.load(Ordering::Relaxed) >= 0 {
                let spin_begin = Instant::now();
                let max_yield = Duration::from_micros(self.max_yield_usec);
                let slow_yield = Duration::from_micros(self.slow_yield_usec);

                // Does not count the final yield that meets the goal.
                let mut slow_yield_count = 0usize;
                let mut iter_begin = spin_begin;

                while iter_begin.duration_since(spin_begin) <= max_yield {
                    std::thread::yield_now();

                    state = w.state();
                    if state & goal_mask != 0 {
                        would_spin_again = true;
                        break;
                    }

                    let now = Instant::now();
                    if now == iter_begin || now.duration_since(iter_begin) >= slow_yield {
                        // A clock too coarse to measure the yield counts
                        // as slow too.
                        slow_yield_count += 1;
                        if slow_yield_count >= MAX_SLOW_YIELDS_WHILE_SPINNING {
                            // Several involuntary context switches in one
                            // wait; adapt now and fall back to blocking.
                            update_ctx = true;
                            break;
                        }
                    }
                    iter_begin = now;
                }
            }
        }

        if state & goal_mask == 0 {
            state = self.blocking_await_state(w, goal_mask);
        }

        if update_ctx {
            // Sampled, so a lost race with another thread's update is
            // acceptable.
            let v = ctx.yield_credit.load(Ordering::Relaxed);
            let step = if would_spin_again {
                CREDIT_STEP
            } else {
                -CREDIT_STEP
            };
            let v = v - (v / 1024) + step;
            ctx.yield_credit.store(v, Ordering::Relaxed);
        }

        debug_assert!(state & goal_mask != 0);
        state
    }

    /// Terminal wait: install `STATE_LOCKED_WAITING` and sleep on the
    /// writer's condvar.
    fn blocking_await_state(&self, w: &Writer, goal_mask: u8) -> u8 {
        // Construct the slot before publishing LOCKED_WAITING; the waker
        // only touches it after CASing that state away.
        let slot: &SyncSlot = w.sync_slot();

        let mut state = w.state();
        debug_assert_ne!(state, STATE_LOCKED_WAITING);
        if state & goal_mask == 0 && w.cas_state(state, STATE_LOCKED_WAITING).is_ok() {
            let mut guard = slot.mu.lock();
            while w.state_relaxed() == STATE_LOCKED_WAITING {
                slot.cv.wait(&mut guard);
            }
            state = w.state();
        } else if state & goal_mask == 0 {
            // CAS failed: the waker changed the state under us, and no
            // wait crosses intermediate states, so the goal is met.
            state = w.state();
        }

        debug_assert!(state & goal_mask != 0);
        state
    }

    /// Transition `w` to `new_state`, waking it if it blocked.
    pub(crate) fn set_state(&self, w: &Writer, new_state: u8) {
        let state = w.state();
        if state == STATE_LOCKED_WAITING || w.cas_state(state, new_state).is_err() {
            // The writer committed to blocking; only a waker holding its
            // mutex may replace LOCKED_WAITING.
            let slot = w.sync_slot();
            {
                let _guard = slot.mu.lock();
                debug_assert_eq!(w.state_relaxed(), STATE_LOCKED_WAITING);
                w.store_state(new_state);
            }
            slot.cv.notify_one();
        }
    }

    // === Enqueue ===

    /// CAS-prepend `w` onto the list headed by `newest_writer`.
    ///
    /// Returns true iff the previous head was null, making `w` the
    /// leader. While the stall sentinel heads the list, `no_slowdown`
    /// writers fail immediately with `Incomplete("Write stall")` and
    /// everyone else waits for the stall to clear.
    fn link_one(&self, w: &Writer, newest_writer: &AtomicPtr<Writer>) -> bool {
        debug_assert_eq!(w.state(), STATE_INIT);

        let mut writers = newest_writer.load(Ordering::Relaxed);
        loop {
            if writers == self.stall_ptr() {
                if w.no_slowdown {
                    w.set_status(Err(Error::incomplete("Write stall")));
                    self.set_state(w, STATE_COMPLETED);
                    return false;
                }
                // Wait for the stall to clear.
                {
                    let mut guard = self.stall_mu.lock();
                    writers = newest_writer.load(Ordering::Relaxed);
                    if writers == self.stall_ptr() {
                        self.stall_cv.wait(&mut guard);
                        writers = newest_writer.load(Ordering::Relaxed);
                        continue;
                    }
                }
            }

            w.link_older.store(writers, Ordering::Relaxed);
            match newest_writer.compare_exchange_weak(
                writers,
                w.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return writers.is_null(),
                Err(actual) => writers = actual,
            }
        }
    }

    /// Prepend a whole frozen group onto a queue. Returns true iff the
    /// queue was empty (the group's leader leads the new queue too).
    fn link_group(&self, write_group: &WriteGroup, newest_writer: &AtomicPtr<Writer>) -> bool {
        let leader = write_group.leader_ptr();
        let last_writer = write_group.last_writer_ptr();

        // Unset link_newer and group membership so a later
        // create_missing_newer_links rebuilds every link.
        let mut w = last_writer;
        loop {
            unsafe {
                (*w).link_newer.store(std::ptr::null_mut(), Ordering::Release);
                (*w).write_group.store(std::ptr::null_mut(), Ordering::Release);
            }
            if w == leader {
                break;
            }
            w = unsafe { (*w).link_older.load(Ordering::Acquire) };
        }

        let mut newest = newest_writer.load(Ordering::Relaxed);
        loop {
            unsafe {
                (*leader).link_older.store(newest, Ordering::Relaxed);
            }
            match newest_writer.compare_exchange_weak(
                newest,
                last_writer,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return newest.is_null(),
                Err(actual) => newest = actual,
            }
        }
    }

    /// Complete the lazily built back-links from `head` towards the list
    /// tail. Only the current leader calls this, so the writes race with
    /// nothing.
    fn create_missing_newer_links(&self, head: *mut Writer) {
        let mut head = head;
        loop {
            if head.is_null() {
                return;
            }
            let next = unsafe { (*head).link_older.load(Ordering::Acquire) };
            if next.is_null() {
                return;
            }
            let next_newer = unsafe { (*next).link_newer.load(Ordering::Acquire) };
            if !next_newer.is_null() {
                debug_assert_eq!(next_newer, head);
                return;
            }
            unsafe {
                (*next).link_newer.store(head, Ordering::Release);
            }
            head = next;
        }
    }

    /// Oldest writer strictly between `boundary` and `from` (walking
    /// `link_older` from `from` until it reaches `boundary`).
    fn find_next_leader(&self, from: *mut Writer, boundary: *mut Writer) -> *mut Writer {
        debug_assert!(!from.is_null() && from != boundary);
        let mut current = from;
        loop {
            let older = unsafe { (*current).link_older.load(Ordering::Acquire) };
            if older == boundary {
                return current;
            }
            debug_assert!(!older.is_null());
            current = older;
        }
    }

    // === Join ===

    /// Enqueue a batched writer and wait until it is a leader, launched
    /// parallel, handed the memtable stage, or completed.
    pub fn join_batch_group(&self, w: &Writer) {
        debug_assert!(w.batch.is_some());

        let linked_as_leader = self.link_one(w, &self.newest_writer);
        if linked_as_leader {
            self.set_state(w, STATE_GROUP_LEADER);
            return;
        }

        self.await_state(
            w,
            STATE_GROUP_LEADER
                | STATE_MEMTABLE_WRITER_LEADER
                | STATE_PARALLEL_MEMTABLE_WRITER
                | STATE_COMPLETED,
            &JBG_CTX,
        );
    }

    // === Group construction ===

    /// Cap for a group led by a write of `leader_size` bytes.
    fn max_group_size(leader_size: usize) -> usize {
        if leader_size <= SMALL_WRITE_THRESHOLD {
            leader_size + SMALL_WRITE_THRESHOLD
        } else {
            MAX_WRITE_GROUP_SIZE
        }
    }

    /// Build the leader's write group from the pending list.
    ///
    /// Walks from the leader towards the newest writer, completing
    /// back-links on the way, and stops at the first follower that is
    /// incompatible: sync or no_slowdown mismatch, a WAL-requiring write
    /// behind a WAL-disabled leader, a batch-less barrier, a callback
    /// refusing batching, or a size overflow. Returns the group's total
    /// byte size.
    pub fn enter_as_batch_group_leader(&self, leader: &Writer, write_group: &WriteGroup) -> usize {
        debug_assert!(leader.link_older.load(Ordering::Acquire).is_null());
        debug_assert!(leader.batch.is_some());

        let mut size = leader.batch_size();
        let max_size = Self::max_group_size(size);

        leader.write_group.store(write_group.as_ptr(), Ordering::Release);
        write_group.set_leader(leader.as_ptr());
        write_group.set_last_writer(leader.as_ptr());
        write_group.set_size(1);

        let newest_writer = self.newest_writer.load(Ordering::Acquire);

        // Safe regardless of who else is enqueueing: only a leader walks
        // these links, and there is exactly one leader.
        self.create_missing_newer_links(newest_writer);

        // Iteration starts past the leader and ends at newest_writer,
        // old to new.
        let mut w_ptr = leader.as_ptr();
        while w_ptr != newest_writer {
            let next = unsafe { (*w_ptr).link_newer.load(Ordering::Acquire) };
            debug_assert!(!next.is_null());
            let w = unsafe { &*next };

            if w.sync && !leader.sync {
                // Do not include a sync write into a batch handled by a
                // non-sync write.
                break;
            }

            if w.no_slowdown != leader.no_slowdown {
                // Do not mix writes that are ok with delays with ones
                // that fail on delay.
                break;
            }

            if !w.disable_wal && leader.disable_wal {
                // A write that needs the WAL cannot ride a group that
                // skips it.
                break;
            }

            if w.batch.is_none() {
                // Barrier writers want to be alone.
                break;
            }

            if !w.allow_write_batching() {
                break;
            }

            let batch_size = w.batch_size();
            if size + batch_size > max_size {
                // Do not make the batch too big.
                break;
            }

            size += batch_size;
            w.write_group.store(write_group.as_ptr(), Ordering::Release);
            write_group.set_last_writer(next);
            write_group.set_size(write_group.size() + 1);
            w_ptr = next;
        }

        size
    }

    /// Build the memtable-stage group (pipelined mode).
    pub fn enter_as_memtable_writer(&self, leader: &Writer, write_group: &WriteGroup) {
        debug_assert!(leader.link_older.load(Ordering::Acquire).is_null());
        debug_assert!(leader.batch.is_some());

        let mut size = leader.batch_size();
        let max_size = Self::max_group_size(size);

        leader.write_group.store(write_group.as_ptr(), Ordering::Release);
        write_group.set_leader(leader.as_ptr());
        write_group.set_size(1);
        let mut last_writer = leader.as_ptr();

        let leader_has_merge = leader.batch.as_ref().is_some_and(|b| b.has_merge());
        if !self.allow_concurrent_memtable_write || !leader_has_merge {
            let newest_writer = self.newest_memtable_writer.load(Ordering::Acquire);
            self.create_missing_newer_links(newest_writer);

            let mut w_ptr = leader.as_ptr();
            while w_ptr != newest_writer {
                let next = unsafe { (*w_ptr).link_newer.load(Ordering::Acquire) };
                debug_assert!(!next.is_null());
                let w = unsafe { &*next };

                if w.batch.is_none() {
                    break;
                }

                if w.batch.as_ref().is_some_and(|b| b.has_merge()) {
                    // Merge operands need single-threaded ordering.
                    break;
                }

                if !self.allow_concurrent_memtable_write {
                    let batch_size = w.batch_size();
                    if size + batch_size > max_size {
                        break;
                    }
                    size += batch_size;
                }

                w.write_group.store(write_group.as_ptr(), Ordering::Release);
                last_writer = next;
                write_group.set_size(write_group.size() + 1);
                w_ptr = next;
            }
        }

        write_group.set_last_writer(last_writer);
        let last = unsafe { &*last_writer };
        write_group
            .last_sequence
            .set(last.sequence() + last.batch_count() as u64 - 1);
    }

    /// Tear down a memtable-stage group, electing the next stage leader
    /// if more writers queued behind it.
    pub fn exit_as_memtable_writer(&self, _self_writer: &Writer, write_group: &WriteGroup) {
        let leader = write_group.leader_ptr();
        let last_writer = write_group.last_writer_ptr();

        if self
            .newest_memtable_writer
            .compare_exchange(
                last_writer,
                std::ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            let newest_writer = self.newest_memtable_writer.load(Ordering::Acquire);
            self.create_missing_newer_links(newest_writer);
            let next_leader = unsafe { (*last_writer).link_newer.load(Ordering::Acquire) };
            debug_assert!(!next_leader.is_null());
            unsafe {
                (*next_leader)
                    .link_older
                    .store(std::ptr::null_mut(), Ordering::Release);
                self.set_state(&*next_leader, STATE_MEMTABLE_WRITER_LEADER);
            }
        }

        let group_status = write_group.status();
        let mut w_ptr = leader;
        loop {
            let w = unsafe { &*w_ptr };
            if group_status.is_err() {
                w.set_status(group_status.clone());
            }
            let next = w.link_newer.load(Ordering::Acquire);
            if w_ptr != leader {
                self.set_state(w, STATE_COMPLETED);
            }
            if w_ptr == last_writer {
                break;
            }
            w_ptr = next;
        }
        // The leader exits last; it owns the write group.
        self.set_state(unsafe { &*leader }, STATE_COMPLETED);
    }

    /// Wake every member of the group to write its own batch into the
    /// memtable.
    pub fn launch_parallel_memtable_writers(&self, write_group: &WriteGroup) {
        write_group
            .running
            .store(write_group.size(), Ordering::SeqCst);
        for w_ptr in write_group.iter() {
            self.set_state(unsafe { &*w_ptr }, STATE_PARALLEL_MEMTABLE_WRITER);
        }
    }

    /// Called by the leader and every parallel follower when its memtable
    /// write is done. Returns true for the last finisher, which then
    /// performs exit duties.
    pub fn complete_parallel_memtable_writer(&self, w: &Writer) -> bool {
        let write_group = unsafe { &*w.write_group.load(Ordering::Acquire) };

        if let Err(e) = w.status() {
            // A follower's failure becomes the group status; captured
            // under the leader's sync-slot mutex.
            let leader = unsafe { &*write_group.leader_ptr() };
            let slot = leader.sync_slot();
            let _guard = slot.mu.lock();
            write_group.set_status(Err(e));
        }

        if write_group.running.fetch_sub(1, Ordering::AcqRel) > 1 {
            // Not the last one; wait for the finisher to complete us.
            self.await_state(w, STATE_COMPLETED, &CPMTW_CTX);
            return false;
        }

        w.set_status(write_group.status());
        true
    }

    /// Called by the last parallel finisher when it was a follower: runs
    /// the leader's exit on its behalf, then completes the leader.
    pub fn exit_as_batch_group_follower(&self, w: &Writer) {
        let write_group = unsafe { &*w.write_group.load(Ordering::Acquire) };

        debug_assert_eq!(w.state(), STATE_PARALLEL_MEMTABLE_WRITER);

        self.exit_as_batch_group_leader(write_group, write_group.status());
        self.set_state(unsafe { &*write_group.leader_ptr() }, STATE_COMPLETED);
    }

    // === Exit ===

    /// Remove one writer from the middle or tail of a group and complete
    /// it (pipelined mode, writers with nothing for the memtable).
    fn complete_follower(&self, w: &Writer, write_group: &WriteGroup) {
        debug_assert!(write_group.size() > 1);
        debug_assert!(w.as_ptr() != write_group.leader_ptr());

        let older = w.link_older.load(Ordering::Acquire);
        let newer = w.link_newer.load(Ordering::Acquire);
        if w.as_ptr() == write_group.last_writer_ptr() {
            unsafe {
                (*older).link_newer.store(std::ptr::null_mut(), Ordering::Release);
            }
            write_group.set_last_writer(older);
        } else {
            unsafe {
                (*older).link_newer.store(newer, Ordering::Release);
                (*newer).link_older.store(older, Ordering::Release);
            }
        }
        write_group.set_size(write_group.size() - 1);
        self.set_state(w, STATE_COMPLETED);
    }

    /// Complete and detach the group's leader (pipelined mode).
    fn complete_leader(&self, write_group: &WriteGroup) {
        debug_assert!(write_group.size() > 0);
        let leader = write_group.leader_ptr();
        if write_group.size() == 1 {
            write_group.set_leader(std::ptr::null_mut());
            write_group.set_last_writer(std::ptr::null_mut());
        } else {
            let newer = unsafe { (*leader).link_newer.load(Ordering::Acquire) };
            debug_assert!(!newer.is_null());
            unsafe {
                (*newer).link_older.store(std::ptr::null_mut(), Ordering::Release);
            }
            write_group.set_leader(newer);
        }
        write_group.set_size(write_group.size() - 1);
        self.set_state(unsafe { &*leader }, STATE_COMPLETED);
    }

    /// Leader exit after the commit phase.
    ///
    /// Non-pipelined: detach the group from the pending list (electing
    /// the oldest newcomer as next leader if the CAS to empty fails),
    /// then complete followers tail to head, reading each `link_older`
    /// before the state write that lets its owner deallocate it.
    ///
    /// Pipelined: complete members that skip the memtable, splice the
    /// rest onto the memtable queue, elect a successor (or park a dummy
    /// boundary writer), and wait to be handed a memtable-stage state.
    pub fn exit_as_batch_group_leader(&self, write_group: &WriteGroup, status: Result<()>) {
        let leader_ptr = write_group.leader_ptr();
        let last_writer = write_group.last_writer_ptr();
        debug_assert!(unsafe { (*leader_ptr).link_older.load(Ordering::Acquire).is_null() });

        // Propagate a memtable write error to the whole group.
        let mut status = status;
        if status.is_ok() {
            if let Err(e) = write_group.status() {
                status = Err(e);
            }
        }

        if self.enable_pipelined_write {
            // Complete writers with nothing for the memtable stage.
            let leader = unsafe { &*leader_ptr };
            let mut w_ptr = last_writer;
            while w_ptr != leader_ptr {
                let w = unsafe { &*w_ptr };
                let next = w.link_older.load(Ordering::Acquire);
                w.set_status(status.clone());
                if !w.should_write_to_memtable() {
                    self.complete_follower(w, write_group);
                }
                w_ptr = next;
            }
            if !leader.should_write_to_memtable() {
                self.complete_leader(write_group);
            }

            let mut next_leader: *mut Writer = std::ptr::null_mut();

            // Look for the next leader before linking the group onto the
            // memtable queue. If no writer is pending, park a dummy at
            // the tail so later arrivals know the group boundary.
            let dummy = Writer::new_unbatched(WriteOptions::default());
            let dummy_ptr = dummy.as_ptr();
            let has_dummy = match self.newest_writer.compare_exchange(
                last_writer,
                dummy_ptr,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => true,
                Err(actual) => {
                    // At least one pending writer arrived; the next
                    // leader is the oldest of them.
                    next_leader = self.find_next_leader(actual, last_writer);
                    debug_assert!(!next_leader.is_null() && next_leader != last_writer);
                    false
                }
            };

            // Link the remaining group to the memtable queue before
            // waking the next leader, so it cannot splice ahead of us.
            if write_group.size() > 0 {
                if self.link_group(write_group, &self.newest_memtable_writer) {
                    // The stage leader may differ from this writer.
                    self.set_state(
                        unsafe { &*write_group.leader_ptr() },
                        STATE_MEMTABLE_WRITER_LEADER,
                    );
                }
            }

            // Remove the dummy and re-check for arrivals behind it.
            if has_dummy {
                debug_assert!(next_leader.is_null());
                if let Err(actual) = self.newest_writer.compare_exchange(
                    dummy_ptr,
                    std::ptr::null_mut(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    next_leader = self.find_next_leader(actual, dummy_ptr);
                    debug_assert!(!next_leader.is_null() && next_leader != dummy_ptr);
                }
            }

            if !next_leader.is_null() {
                unsafe {
                    (*next_leader)
                        .link_older
                        .store(std::ptr::null_mut(), Ordering::Release);
                    self.set_state(&*next_leader, STATE_GROUP_LEADER);
                }
            }

            self.await_state(
                leader,
                STATE_MEMTABLE_WRITER_LEADER | STATE_PARALLEL_MEMTABLE_WRITER | STATE_COMPLETED,
                &EABGL_CTX,
            );
        } else {
            let head = self.newest_writer.load(Ordering::Acquire);
            let list_emptied = head == last_writer
                && self
                    .newest_writer
                    .compare_exchange(
                        head,
                        std::ptr::null_mut(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();

            if !list_emptied {
                // Either the loaded head was already newer, or a writer
                // pushed between the load and the CAS. Only a departing
                // leader removes nodes, so no CAS retry is needed.
                let head = self.newest_writer.load(Ordering::Acquire);
                debug_assert_ne!(head, last_writer);

                self.create_missing_newer_links(head);

                // The next leader did not self-identify, because the
                // list was non-empty when it enqueued; hand off here.
                let next_leader = unsafe { (*last_writer).link_newer.load(Ordering::Acquire) };
                debug_assert!(!next_leader.is_null());
                unsafe {
                    debug_assert_eq!(
                        (*next_leader).link_older.load(Ordering::Acquire),
                        last_writer
                    );
                    (*next_leader)
                        .link_older
                        .store(std::ptr::null_mut(), Ordering::Release);
                    self.set_state(&*next_leader, STATE_GROUP_LEADER);
                }
            }

            // Complete followers tail to head. Read link_older before the
            // state write: once marked completed, the owning thread may
            // return and deallocate the writer.
            let mut w_ptr = last_writer;
            while w_ptr != leader_ptr {
                let w = unsafe { &*w_ptr };
                w.set_status(status.clone());
                let next = w.link_older.load(Ordering::Acquire);
                self.set_state(w, STATE_COMPLETED);
                w_ptr = next;
            }
        }
    }

    // === Write stall ===

    /// Prepend the stall sentinel, then fail any already-pending
    /// `no_slowdown` writers. The walk stops at the first writer bound to
    /// a write group: stalling never retroactively fails a committing
    /// group.
    pub fn begin_write_stall(&self) {
        let stall = self.stall_ptr();
        self.link_one(unsafe { &*stall }, &self.newest_writer);

        let mut prev = stall;
        let mut w_ptr = unsafe { (*prev).link_older.load(Ordering::Acquire) };
        while !w_ptr.is_null() {
            let w = unsafe { &*w_ptr };
            if !w.write_group.load(Ordering::Acquire).is_null() {
                break;
            }
            if w.no_slowdown {
                let older = w.link_older.load(Ordering::Acquire);
                unsafe {
                    (*prev).link_older.store(older, Ordering::Release);
                }
                w.set_status(Err(Error::incomplete("Write stall")));
                self.set_state(w, STATE_COMPLETED);
                w_ptr = older;
            } else {
                prev = w_ptr;
                w_ptr = w.link_older.load(Ordering::Acquire);
            }
        }
    }

    /// Remove the stall sentinel and wake all waiting enqueuers.
    pub fn end_write_stall(&self) {
        let guard = self.stall_mu.lock();
        debug_assert_eq!(self.newest_writer.load(Ordering::Relaxed), self.stall_ptr());
        let resumed = unsafe { (*self.stall_ptr()).link_older.load(Ordering::Acquire) };
        self.newest_writer.store(resumed, Ordering::Release);
        drop(guard);
        self.stall_cv.notify_all();
    }

    // === Unbatched barriers ===

    /// Serialize an administrative operation (e.g. WAL rotation) against
    /// the write stream.
    ///
    /// Releases the caller's mutex guard, enqueues the batch-less writer,
    /// waits for leadership (and, pipelined, drains the memtable queue),
    /// then re-acquires the mutex.
    pub fn enter_unbatched<'a, T>(
        &self,
        w: &Writer,
        mu: &'a Mutex<T>,
        guard: MutexGuard<'a, T>,
    ) -> MutexGuard<'a, T> {
        debug_assert!(w.batch.is_none());
        drop(guard);

        let linked_as_leader = self.link_one(w, &self.newest_writer);
        if !linked_as_leader {
            // The previous leader will not pick a batch-less writer as a
            // follower.
            self.await_state(w, STATE_GROUP_LEADER, &EU_CTX);
        }
        if self.enable_pipelined_write {
            self.wait_for_memtable_writers();
        }

        mu.lock()
    }

    /// Symmetric exit for [`WriteCoordinator::enter_unbatched`].
    pub fn exit_unbatched(&self, w: &Writer) {
        if let Err(actual) = self.newest_writer.compare_exchange(
            w.as_ptr(),
            std::ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            self.create_missing_newer_links(actual);
            let next_leader = unsafe { w.link_newer.load(Ordering::Acquire) };
            debug_assert!(!next_leader.is_null());
            unsafe {
                (*next_leader)
                    .link_older
                    .store(std::ptr::null_mut(), Ordering::Release);
                self.set_state(&*next_leader, STATE_GROUP_LEADER);
            }
        }
    }

    /// Drain the memtable-stage queue (pipelined mode).
    fn wait_for_memtable_writers(&self) {
        debug_assert!(self.enable_pipelined_write);
        if self.newest_memtable_writer.load(Ordering::Acquire).is_null() {
            return;
        }
        let w = Writer::new_unbatched(WriteOptions::default());
        if !self.link_one(&w, &self.newest_memtable_writer) {
            self.await_state(&w, STATE_MEMTABLE_WRITER_LEADER, &WFMW_CTX);
        }
        self.newest_memtable_writer
            .store(std::ptr::null_mut(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WriteBatch;
    use std::sync::atomic::AtomicU8;
    use std::sync::Arc;

    fn batched_writer(bytes: usize, options: WriteOptions) -> Writer {
        let mut batch = WriteBatch::new();
        batch.put(b"key".as_slice(), vec![0u8; bytes]);
        Writer::new(batch, options)
    }

    fn coordinator(options: &Options) -> WriteCoordinator {
        WriteCoordinator::new(options)
    }

    #[test]
    fn test_first_writer_becomes_leader() {
        let coord = coordinator(&Options::default());
        let w = batched_writer(10, WriteOptions::default());

        coord.join_batch_group(&w);
        assert_eq!(w.state(), STATE_GROUP_LEADER);

        let group = WriteGroup::new();
        let size = coord.enter_as_batch_group_leader(&w, &group);
        assert_eq!(group.size(), 1);
        assert_eq!(size, w.batch_size());

        coord.exit_as_batch_group_leader(&group, Ok(()));
    }

    #[test]
    fn test_group_collects_compatible_followers() {
        let coord = coordinator(&Options::default());

        let leader = batched_writer(500, WriteOptions::default());
        coord.join_batch_group(&leader);

        // Enqueue followers directly; joining would block this thread.
        let f1 = batched_writer(600, WriteOptions::default());
        let f2 = batched_writer(700, WriteOptions::default());
        assert!(!coord.link_one(&f1, &coord.newest_writer));
        assert!(!coord.link_one(&f2, &coord.newest_writer));

        let group = WriteGroup::new();
        let size = coord.enter_as_batch_group_leader(&leader, &group);
        assert_eq!(group.size(), 3);
        assert_eq!(size, leader.batch_size() + f1.batch_size() + f2.batch_size());
        assert_eq!(group.last_writer_ptr(), f2.as_ptr());

        coord.exit_as_batch_group_leader(&group, Ok(()));
        assert_eq!(f1.state(), STATE_COMPLETED);
        assert_eq!(f2.state(), STATE_COMPLETED);
    }

    #[test]
    fn test_group_cutoff_on_sync_mismatch() {
        let coord = coordinator(&Options::default());

        let leader = batched_writer(100, WriteOptions::default());
        coord.join_batch_group(&leader);

        let sync_writer = batched_writer(100, WriteOptions {
            sync: true,
            ..Default::default()
        });
        let trailing = batched_writer(100, WriteOptions::default());
        coord.link_one(&sync_writer, &coord.newest_writer);
        coord.link_one(&trailing, &coord.newest_writer);

        let group = WriteGroup::new();
        coord.enter_as_batch_group_leader(&leader, &group);

        // The sync writer breaks the group; nothing past it joins either.
        assert_eq!(group.size(), 1);

        coord.exit_as_batch_group_leader(&group, Ok(()));
        // The sync writer inherits leadership.
        assert_eq!(sync_writer.state(), STATE_GROUP_LEADER);

        let group2 = WriteGroup::new();
        coord.enter_as_batch_group_leader(&sync_writer, &group2);
        assert_eq!(group2.size(), 2);
        coord.exit_as_batch_group_leader(&group2, Ok(()));
        assert_eq!(trailing.state(), STATE_COMPLETED);
    }

    #[test]
    fn test_group_cutoff_on_size_overflow() {
        let coord = coordinator(&Options::default());

        let leader = batched_writer(200_000, WriteOptions::default());
        coord.join_batch_group(&leader);

        let big = batched_writer(900_001, WriteOptions::default());
        coord.link_one(&big, &coord.newest_writer);

        let group = WriteGroup::new();
        coord.enter_as_batch_group_leader(&leader, &group);
        assert_eq!(group.size(), 1);

        coord.exit_as_batch_group_leader(&group, Ok(()));
        assert_eq!(big.state(), STATE_GROUP_LEADER);
        let group2 = WriteGroup::new();
        coord.enter_as_batch_group_leader(&big, &group2);
        coord.exit_as_batch_group_leader(&group2, Ok(()));
    }

    #[test]
    fn test_small_leader_limits_group_growth() {
        assert_eq!(WriteCoordinator::max_group_size(100), 100 + (128 << 10));
        assert_eq!(WriteCoordinator::max_group_size(200_000), 1 << 20);
    }

    #[test]
    fn test_stall_rejects_no_slowdown_writer() {
        let coord = coordinator(&Options::default());
        coord.begin_write_stall();

        let w = batched_writer(10, WriteOptions {
            no_slowdown: true,
            ..Default::default()
        });
        coord.join_batch_group(&w);

        assert_eq!(w.state(), STATE_COMPLETED);
        assert_eq!(w.status(), Err(Error::incomplete("Write stall")));

        coord.end_write_stall();

        // The queue is clean afterwards: a fresh writer leads.
        let w2 = batched_writer(10, WriteOptions::default());
        coord.join_batch_group(&w2);
        assert_eq!(w2.state(), STATE_GROUP_LEADER);
        let group = WriteGroup::new();
        coord.enter_as_batch_group_leader(&w2, &group);
        coord.exit_as_batch_group_leader(&group, Ok(()));
    }

    #[test]
    fn test_stall_fails_pending_no_slowdown_writers() {
        let coord = coordinator(&Options::default());

        // A leader holds the queue; two followers behind it, one of them
        // no_slowdown.
        let leader = batched_writer(10, WriteOptions::default());
        coord.join_batch_group(&leader);
        let group = WriteGroup::new();
        coord.enter_as_batch_group_leader(&leader, &group);

        let nos = batched_writer(10, WriteOptions {
            no_slowdown: true,
            ..Default::default()
        });
        let plain = batched_writer(10, WriteOptions::default());
        coord.link_one(&nos, &coord.newest_writer);
        coord.link_one(&plain, &coord.newest_writer);

        coord.begin_write_stall();

        // The pending no_slowdown writer was spliced out and failed; the
        // plain writer and committing leader were untouched.
        assert_eq!(nos.state(), STATE_COMPLETED);
        assert!(nos.status().unwrap_err().is_incomplete());
        assert_eq!(plain.state(), STATE_INIT);
        assert!(leader.write_group.load(Ordering::Acquire) == group.as_ptr());

        coord.end_write_stall();
        coord.exit_as_batch_group_leader(&group, Ok(()));
        assert_eq!(plain.state(), STATE_GROUP_LEADER);
        let group2 = WriteGroup::new();
        coord.enter_as_batch_group_leader(&plain, &group2);
        coord.exit_as_batch_group_leader(&group2, Ok(()));
    }

    #[test]
    fn test_await_state_spin_fast_path() {
        let coord = coordinator(&Options::default());
        let w = batched_writer(1, WriteOptions::default());
        coord.set_state(&w, STATE_GROUP_LEADER);

        static CTX: AdaptationContext = AdaptationContext::new("test_spin");
        let state = coord.await_state(&w, STATE_GROUP_LEADER, &CTX);
        assert_eq!(state, STATE_GROUP_LEADER);
    }

    #[test]
    fn test_await_state_blocks_and_wakes() {
        let options = Options::default();
        let coord = Arc::new(coordinator(&options));
        let w = Arc::new(batched_writer(1, WriteOptions::default()));

        let coord2 = coord.clone();
        let w2 = w.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            coord2.set_state(&w2, STATE_COMPLETED);
        });

        static CTX: AdaptationContext = AdaptationContext::new("test_block");
        let state = coord.await_state(&w, STATE_COMPLETED, &CTX);
        assert_eq!(state, STATE_COMPLETED);
        waker.join().unwrap();
    }

    #[test]
    fn test_adaptive_yield_credit_penalized_after_slow_yields() {
        // slow_yield_usec == 0 makes every yield "slow": after three the
        // wait adapts (update_ctx forced) and falls back to blocking, and
        // the failed yield phase costs one full credit step.
        let mut options = Options::default();
        options.enable_write_thread_adaptive_yield = true;
        options.write_thread_max_yield_usec = 10_000;
        options.write_thread_slow_yield_usec = 0;
        let coord = Arc::new(coordinator(&options));
        let w = Arc::new(batched_writer(1, WriteOptions::default()));

        static CTX: AdaptationContext = AdaptationContext::new("test_credit");
        assert_eq!(CTX.yield_credit(), 0);

        let coord2 = coord.clone();
        let w2 = w.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            coord2.set_state(&w2, STATE_COMPLETED);
        });

        let state = coord.await_state(&w, STATE_COMPLETED, &CTX);
        assert_eq!(state, STATE_COMPLETED);
        waker.join().unwrap();

        assert_eq!(CTX.yield_credit(), -131072);
    }

    #[test]
    fn test_negative_credit_skips_yield_phase() {
        // With deeply negative credit and sampling vanishingly unlikely
        // to fire every time, the wait should still block and return.
        let mut options = Options::default();
        options.write_thread_max_yield_usec = 10_000;
        let coord = Arc::new(coordinator(&options));

        static CTX: AdaptationContext = AdaptationContext::new("test_negative");
        CTX.yield_credit.store(i32::MIN / 2, Ordering::Relaxed);

        let w = Arc::new(batched_writer(1, WriteOptions::default()));
        let coord2 = coord.clone();
        let w2 = w.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            coord2.set_state(&w2, STATE_COMPLETED);
        });

        let state = coord.await_state(&w, STATE_COMPLETED, &CTX);
        assert_eq!(state, STATE_COMPLETED);
        waker.join().unwrap();
    }

    #[test]
    fn test_enter_exit_unbatched() {
        let coord = coordinator(&Options::default());
        let mu = Mutex::new(0u32);

        let w = Writer::new_unbatched(WriteOptions::default());
        let guard = mu.lock();
        let guard = coord.enter_unbatched(&w, &mu, guard);
        assert_eq!(*guard, 0);
        drop(guard);
        coord.exit_unbatched(&w);

        // Queue is empty again.
        let w2 = batched_writer(1, WriteOptions::default());
        coord.join_batch_group(&w2);
        assert_eq!(w2.state(), STATE_GROUP_LEADER);
        let group = WriteGroup::new();
        coord.enter_as_batch_group_leader(&w2, &group);
        coord.exit_as_batch_group_leader(&group, Ok(()));
    }

    #[test]
    fn test_set_state_wakes_locked_waiting() {
        let coord = Arc::new(coordinator(&Options::default()));
        let observed = Arc::new(AtomicU8::new(0));

        let w = Arc::new(batched_writer(1, WriteOptions::default()));
        let w2 = w.clone();
        let coord2 = coord.clone();
        let observed2 = observed.clone();
        let waiter = std::thread::spawn(move || {
            static CTX: AdaptationContext = AdaptationContext::new("test_wake");
            let state = coord2.await_state(&w2, STATE_COMPLETED, &CTX);
            observed2.store(state, Ordering::SeqCst);
        });

        // Give the waiter time to reach the blocking phase.
        std::thread::sleep(Duration::from_millis(30));
        coord.set_state(&w, STATE_COMPLETED);
        waiter.join().unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), STATE_COMPLETED);
    }
}

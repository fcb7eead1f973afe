//! Group-commit writer coordination.
//!
//! Concurrent writers enqueue onto a lock-free intrusive list; the first
//! to land becomes the group leader, batches the followers behind it, and
//! commits the whole group in one WAL append. Followers park in an
//! adaptive spin/yield/block wait until the leader hands them a terminal
//! state. See [`WriteCoordinator`] for the protocol.

mod coordinator;
mod writer;

pub use coordinator::WriteCoordinator;
pub use writer::{
    AdaptationContext, WriteCallback, WriteGroup, Writer, STATE_COMPLETED, STATE_GROUP_LEADER,
    STATE_INIT, STATE_LOCKED_WAITING, STATE_MEMTABLE_WRITER_LEADER,
    STATE_PARALLEL_MEMTABLE_WRITER,
};

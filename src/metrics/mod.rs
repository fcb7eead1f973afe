//! Metrics and observability for the write path and block layer.
//!
//! Provides atomic metric primitives and the `Stats` sink this core
//! increments: WAL append accounting, group-commit shape, write-stall
//! rejections, and read-amplification estimates.

mod collector;
mod stats;

pub use collector::{Counter, Gauge, Histogram};
pub use stats::{Stats, StatsSnapshot};

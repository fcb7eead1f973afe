//! Shared utilities: coding, checksums, comparators, randomness.

pub mod coding;
pub mod comparator;
pub mod crc;
pub mod random;

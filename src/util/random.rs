//! Small pseudo-random number source.
//!
//! The core needs cheap randomness in two places: the read-amplification
//! bitmap shifts its sampling grid by a random offset, and the adaptive
//! wait samples its yield-credit update at a fixed probability. Neither
//! needs cryptographic quality, so a xorshift generator with a thread-local
//! instance suffices.

use std::cell::Cell;

/// Xorshift pseudo-random generator.
#[derive(Debug, Clone)]
pub struct Random {
    state: Cell<u64>,
}

impl Random {
    /// Create a generator from a non-zero seed.
    pub fn new(seed: u64) -> Self {
        Self {
            state: Cell::new(seed.max(1)),
        }
    }

    /// Next raw 64-bit value.
    pub fn next_u64(&self) -> u64 {
        let mut x = self.state.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state.set(x);
        x
    }

    /// Uniformly distributed value in `[0, n)`. Returns 0 for `n == 0`.
    pub fn uniform(&self, n: u64) -> u64 {
        if n == 0 {
            0
        } else {
            self.next_u64() % n
        }
    }

    /// True with probability `1/n`. Always false for `n == 0`.
    pub fn one_in(&self, n: u64) -> bool {
        n != 0 && self.uniform(n) == 0
    }
}

thread_local! {
    static TLS_RANDOM: Random = {
        // Derive a per-thread seed from the thread id's hash.
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        Random::new(hasher.finish() | 1)
    };
}

/// Run a closure against this thread's generator.
pub fn with_tls_random<T>(f: impl FnOnce(&Random) -> T) -> T {
    TLS_RANDOM.with(f)
}

//! See <https://docs.rs/crate/crossbeam-utils/latest>

use std::cell::Cell;
use std::fmt;

/// The maximum exponent of spin count.
const SPIN_LIMIT: u32 = 5;

/// Performs exponential backoff in spin loops.
///
/// Backing off in spin loops reduces contention and improves overall
/// performance. Each step of the back-off procedure takes roughly twice as
/// long as the previous one, until it gives up and yields the thread to the
/// OS scheduler.
pub struct Backoff {
    step: Cell<u32>,
}

impl Backoff {
    /// Creates a new `Backoff`.
    #[inline(always)]
    pub const fn new() -> Self {
        Self { step: Cell::new(0) }
    }

    /// Backs off in a lock-free loop.
    ///
    /// Use when retrying an operation because another thread made progress.
    #[inline(always)]
    pub fn spin(&self) {
        let step = 1 << self.step.get();
        for _ in 0..step {
            std::hint::spin_loop();
        }

        if self.step.get() < SPIN_LIMIT {
            self.step.set(self.step.get() + 1);
        }
    }

    /// Backs off in a blocking loop.
    ///
    /// Use when waiting for another thread to make progress. Past the spin
    /// limit this yields the thread to the OS scheduler instead of spinning.
    #[inline]
    pub fn snooze(&self) {
        if self.step.get() < SPIN_LIMIT {
            let step = 1 << (self.step.get() << 1);
            for _ in 0..step {
                std::hint::spin_loop();
            }
            self.step.set(self.step.get() + 1);
        } else {
            std::thread::yield_now();
        }
    }

    /// Returns `true` once the spin limit has been reached.
    #[inline(always)]
    pub fn is_completed(&self) -> bool {
        self.step.get() > SPIN_LIMIT
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backoff").field("step", &self.step).finish()
    }
}

impl Default for Backoff {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

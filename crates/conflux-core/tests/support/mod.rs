//! Shared test primitives.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Installs a test-writer subscriber so dispatcher lifecycle logs show up
/// in failing test output. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Raised when a latch does not reach zero within its wait budget.
#[derive(Debug, thiserror::Error)]
#[error("latch did not drain within {waited:?}: {remaining} of {expected} still pending")]
pub struct IncompleteDrain {
    pub expected: u64,
    pub remaining: u64,
    pub waited: Duration,
}

/// Counts terminal events down to zero so tests can synchronize on
/// pipeline completion instead of sleeping.
pub struct CompletionLatch {
    expected: u64,
    remaining: Mutex<u64>,
    zero: Condvar,
}

impl CompletionLatch {
    pub fn new(count: u64) -> Self {
        Self {
            expected: count,
            remaining: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    pub fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        if *remaining > 0 {
            *remaining -= 1;
            if *remaining == 0 {
                self.zero.notify_all();
            }
        }
    }

    pub fn remaining(&self) -> u64 {
        *self.remaining.lock()
    }

    /// Blocks until the count reaches zero or the budget elapses.
    pub fn wait_for(&self, budget: Duration) -> Result<(), IncompleteDrain> {
        let start = Instant::now();
        let deadline = start + budget;
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            if self.zero.wait_until(&mut remaining, deadline).timed_out() {
                return Err(IncompleteDrain {
                    expected: self.expected,
                    remaining: *remaining,
                    waited: start.elapsed(),
                });
            }
        }
        Ok(())
    }
}

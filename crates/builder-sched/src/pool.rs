// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Thread-pool primitives: a counting semaphore for backpressure and a
//! generation-stamped parker for idle workers.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Counting semaphore bounding in-flight actions.
///
/// Output buffering is proportional to in-flight actions, so the pool caps
/// them regardless of worker count — including actions dispatched to remote
/// workers, which hold a permit for their whole round trip.
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    /// Semaphore with `permits` initial permits.
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cv: Condvar::new(),
        }
    }

    /// Block until a permit is available, then take it.
    pub fn acquire(&self) -> SemaphoreGuard<'_> {
        let mut permits = self
            .permits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while *permits == 0 {
            permits = self
                .cv
                .wait(permits)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        *permits -= 1;
        SemaphoreGuard { semaphore: self }
    }

    fn release(&self) {
        let mut permits = self
            .permits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *permits += 1;
        drop(permits);
        self.cv.notify_one();
    }
}

/// RAII permit; drop returns it.
#[derive(Debug)]
pub struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// Generation-stamped parking spot for idle workers.
///
/// A worker reads the generation, re-checks its queues, then parks *against
/// that generation*: a wake between check and park bumps the generation and
/// the park returns immediately, so wakeups cannot be lost. Parks also time
/// out, bounding the cost of any wake the protocol misses.
#[derive(Debug, Default)]
pub struct Parker {
    generation: Mutex<u64>,
    cv: Condvar,
}

impl Parker {
    /// Create a parker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current wake generation. Read *before* the final emptiness check.
    pub fn generation(&self) -> u64 {
        *self
            .generation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Park until the generation advances past `seen`, or the timeout.
    pub fn park(&self, seen: u64, timeout: Duration) {
        let mut generation = self
            .generation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while *generation == seen {
            let (next, wait) = self
                .cv
                .wait_timeout(generation, timeout)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            generation = next;
            if wait.timed_out() {
                break;
            }
        }
    }

    /// Advance the generation and wake every parked worker.
    pub fn wake_all(&self) {
        let mut generation = self
            .generation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *generation += 1;
        drop(generation);
        self.cv.notify_all();
    }
}

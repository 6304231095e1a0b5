// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Counting semaphore with close semantics.
//!
//! The single suspension primitive of the crate: queue push/pop, pool
//! acquisition, and reception waits all block here. Closing a semaphore
//! wakes every waiter with [`Error::Shutdown`] and fails all later
//! operations, which is how bus destruction unblocks stuck threads.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct State {
    permits: usize,
    closed: bool,
}

pub struct Semaphore {
    state: Mutex<State>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(State {
                permits,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Take one permit, blocking until one is available.
    pub fn acquire(&self) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(Error::Shutdown);
            }
            if state.permits > 0 {
                state.permits -= 1;
                return Ok(());
            }
            self.cond.wait(&mut state);
        }
    }

    /// Take one permit, waiting at most `rel`.
    ///
    /// Returns `TimedOut` when the relative timeout expires and `Shutdown`
    /// once the semaphore is closed.
    pub fn acquire_timeout(&self, rel: Duration) -> Result<()> {
        let deadline = match Instant::now().checked_add(rel) {
            Some(deadline) => deadline,
            // Timeout beyond the representable range degrades to untimed.
            None => return self.acquire(),
        };

        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(Error::Shutdown);
            }
            if state.permits > 0 {
                state.permits -= 1;
                return Ok(());
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                // A post or close may have raced the wakeup.
                if state.closed {
                    return Err(Error::Shutdown);
                }
                if state.permits > 0 {
                    state.permits -= 1;
                    return Ok(());
                }
                return Err(Error::TimedOut);
            }
        }
    }

    /// Take one permit without blocking. `Ok(false)` when none is available.
    pub fn try_acquire(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Shutdown);
        }
        if state.permits > 0 {
            state.permits -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Return one permit and wake a waiter.
    ///
    /// Posting on a closed semaphore is allowed and has no observable
    /// effect beyond the counter; release paths run during shutdown.
    pub fn post(&self) {
        let mut state = self.state.lock();
        state.permits += 1;
        drop(state);
        self.cond.notify_one();
    }

    /// Close the semaphore and wake every waiter with `Shutdown`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.cond.notify_all();
    }

    /// Snapshot of the permit count. Stale by the time the caller acts.
    pub fn permits(&self) -> usize {
        self.state.lock().permits
    }
}

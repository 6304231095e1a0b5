// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounded blocking FIFO over a fixed ring buffer.
//!
//! Producers block when the queue is full, consumers block when it is empty.
//! Occupancy is carried by a pair of counting semaphores: `slots` counts free
//! slots (initialized to capacity), `items` counts queued elements
//! (initialized to 0). A producer waits on `slots` then posts `items`; a
//! consumer waits on `items` then posts `slots`.
//!
//! Ordering: FIFO across all completed push/pop pairs on the same queue.

use super::semaphore::Semaphore;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::time::Duration;

struct Ring<T> {
    elements: Vec<Option<T>>,
    head: usize,
    tail: usize,
    len: usize,
}

impl<T: Copy> Ring<T> {
    fn push_back(&mut self, item: T) {
        debug_assert!(self.len < self.elements.len());
        self.elements[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.elements.len();
        self.len += 1;
    }

    fn pop_front(&mut self) -> Option<T> {
        let item = self.elements[self.head].take()?;
        self.head = (self.head + 1) % self.elements.len();
        self.len -= 1;
        Some(item)
    }

    fn front(&self) -> Option<T> {
        self.elements[self.head]
    }
}

/// Fixed-capacity FIFO with blocking and timed operations.
pub struct BlockingQueue<T: Copy> {
    ring: Mutex<Ring<T>>,
    /// Free slots; producers wait here.
    slots: Semaphore,
    /// Occupied slots; consumers wait here.
    items: Semaphore,
    capacity: usize,
}

impl<T: Copy> BlockingQueue<T> {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArgument("queue capacity must be > 0"));
        }

        Ok(Self {
            ring: Mutex::new(Ring {
                elements: vec![None; capacity],
                head: 0,
                tail: 0,
                len: 0,
            }),
            slots: Semaphore::new(capacity),
            items: Semaphore::new(0),
            capacity,
        })
    }

    /// Append `item`, blocking while the queue is full.
    ///
    /// Fails only with `Shutdown` once the queue is closed.
    pub fn push(&self, item: T) -> Result<()> {
        self.slots.acquire()?;
        self.ring.lock().push_back(item);
        self.items.post();
        Ok(())
    }

    /// Append `item` without blocking. `WouldBlock` when the queue is full.
    pub fn try_push(&self, item: T) -> Result<()> {
        if !self.slots.try_acquire()? {
            return Err(Error::WouldBlock);
        }
        self.ring.lock().push_back(item);
        self.items.post();
        Ok(())
    }

    /// Remove and return the front element, blocking while empty.
    ///
    /// Fails only with `Shutdown` once the queue is closed.
    pub fn pop(&self) -> Result<T> {
        self.items.acquire()?;
        self.take_front()
    }

    /// As [`pop`](Self::pop), waiting at most `rel` before `TimedOut`.
    pub fn timed_pop(&self, rel: Duration) -> Result<T> {
        self.items.acquire_timeout(rel)?;
        self.take_front()
    }

    /// Copy of the front element, or `None` when empty.
    ///
    /// Advisory under concurrency: another consumer may pop the element
    /// before the caller acts on it.
    pub fn peek(&self) -> Option<T> {
        self.ring.lock().front()
    }

    /// Block until non-empty, then return a copy of the front element
    /// without removing it.
    pub fn wait_peek(&self) -> Result<T> {
        self.items.acquire()?;
        let front = self.ring.lock().front();
        self.items.post();
        // A held item permit implies a resident front element.
        debug_assert!(front.is_some());
        front.ok_or(Error::Shutdown)
    }

    /// As [`wait_peek`](Self::wait_peek) with a relative timeout.
    pub fn timed_wait_peek(&self, rel: Duration) -> Result<T> {
        self.items.acquire_timeout(rel)?;
        let front = self.ring.lock().front();
        self.items.post();
        debug_assert!(front.is_some());
        front.ok_or(Error::Shutdown)
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_slots(&self) -> usize {
        self.capacity - self.ring.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().len == 0
    }

    pub fn is_full(&self) -> bool {
        let ring = self.ring.lock();
        ring.len == self.capacity
    }

    /// Close the queue: every blocked and future push/pop fails with
    /// `Shutdown`. Queued elements are not drained.
    pub fn close(&self) {
        self.slots.close();
        self.items.close();
    }

    fn take_front(&self) -> Result<T> {
        let front = self.ring.lock().pop_front();
        self.slots.post();
        debug_assert!(front.is_some());
        front.ok_or(Error::Shutdown)
    }
}

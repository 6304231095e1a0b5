// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reference-counted fixed-capacity buffer pool.
//!
//! Pre-allocates `capacity` buffers of `buffer_size` bytes in one contiguous
//! slab and hands them out by [`BufferId`]. Acquisition blocks when the pool
//! is exhausted; release decrements the buffer's reference count and reclaims
//! the buffer only at zero. Explicit `ref_add`/`ref_remove` let a single
//! acquisition be shared among several consumers, each of which owes exactly
//! one `release`.
//!
//! # Accounting
//!
//! At all times outside an in-progress acquire/release:
//! free buffers + allocated buffers = capacity, and the capacity semaphore
//! holds one permit per free buffer. A buffer's refcount is positive iff the
//! buffer is allocated.

use super::semaphore::Semaphore;
use crate::error::{Error, Result};
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::cell::UnsafeCell;

/// Identifier of one buffer within its pool.
///
/// Plain index into the pool's slab; never owns the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u16);

struct SlotTable {
    /// Per-buffer reference counts; decrements clamp at zero.
    refs: Vec<u32>,
    /// Membership in the allocated set.
    in_use: Vec<bool>,
    /// Allocated-set size, maintained incrementally.
    allocated: usize,
}

/// Fixed-capacity pool of equal-sized, reference-counted buffers.
pub struct BufferPool {
    storage: UnsafeCell<Vec<u8>>,
    buffer_size: usize,
    capacity: usize,
    /// Ids of free buffers. Popped only by permit holders, so a granted
    /// permit always finds an id here.
    freelist: ArrayQueue<u16>,
    slots: Mutex<SlotTable>,
    /// Permits = number of free buffers; acquirers block here.
    sem: Semaphore,
}

// SAFETY: BufferPool is Send + Sync because:
// - storage is written only through buffer_mut/fill, whose exclusivity per
//   buffer is part of the acquire/release protocol (a buffer is written by
//   its single holder before any reader sees it)
// - all bookkeeping (freelist, slot table, semaphore) is internally
//   synchronized
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// Create a pool of `capacity` buffers of `buffer_size` bytes each.
    pub fn new(buffer_size: usize, capacity: usize) -> Result<Self> {
        if buffer_size == 0 {
            return Err(Error::InvalidArgument("buffer size must be > 0"));
        }
        if capacity == 0 {
            return Err(Error::InvalidArgument("pool capacity must be > 0"));
        }
        if capacity > usize::from(u16::MAX) {
            return Err(Error::InvalidArgument("pool capacity exceeds u16 id range"));
        }

        let freelist = ArrayQueue::new(capacity);
        for id in 0..capacity {
            let id = u16::try_from(id)
                .map_err(|_| Error::InvalidArgument("pool capacity exceeds u16 id range"))?;
            // Capacity matches the loop count, push cannot fail.
            let _ = freelist.push(id);
        }

        Ok(Self {
            storage: UnsafeCell::new(vec![0u8; buffer_size * capacity]),
            buffer_size,
            capacity,
            freelist,
            slots: Mutex::new(SlotTable {
                refs: vec![0; capacity],
                in_use: vec![false; capacity],
                allocated: 0,
            }),
            sem: Semaphore::new(capacity),
        })
    }

    /// Acquire one buffer, blocking while the pool is exhausted.
    ///
    /// The returned buffer has reference count 1.
    pub fn acquire(&self) -> Result<BufferId> {
        self.sem.acquire()?;
        self.claim_free_id()
    }

    /// Acquire without blocking. `WouldBlock` when no buffer is free.
    pub fn try_acquire(&self) -> Result<BufferId> {
        if !self.sem.try_acquire()? {
            return Err(Error::WouldBlock);
        }
        self.claim_free_id()
    }

    /// Drop one reference; reclaim the buffer when the count reaches zero.
    ///
    /// `NotAMember` when `id` is out of range or names a free buffer.
    pub fn release(&self, id: BufferId) -> Result<()> {
        let idx = self.index_of(id)?;
        let mut slots = self.slots.lock();
        if !slots.in_use[idx] {
            return Err(Error::NotAMember);
        }

        slots.refs[idx] = slots.refs[idx].saturating_sub(1);
        if slots.refs[idx] > 0 {
            return Ok(());
        }

        slots.in_use[idx] = false;
        slots.allocated -= 1;
        drop(slots);

        // Push before post so a woken acquirer always finds an id.
        if self.freelist.push(id.0).is_err() {
            // Unreachable: the in_use guard rejects duplicate releases.
            log::debug!("[pool] freelist rejected buffer {} on release", id.0);
            return Ok(());
        }
        self.sem.post();
        Ok(())
    }

    /// Add one reference to an allocated buffer.
    ///
    /// Used by fan-out to hand a single acquisition to several consumers.
    pub fn ref_add(&self, id: BufferId) -> Result<()> {
        let idx = self.index_of(id)?;
        let mut slots = self.slots.lock();
        if !slots.in_use[idx] {
            return Err(Error::NotAMember);
        }
        slots.refs[idx] = slots.refs[idx].saturating_add(1);
        Ok(())
    }

    /// Drop one reference without reclaiming, clamped at zero.
    ///
    /// Reclamation happens only through [`release`](Self::release).
    pub fn ref_remove(&self, id: BufferId) -> Result<()> {
        let idx = self.index_of(id)?;
        let mut slots = self.slots.lock();
        if !slots.in_use[idx] {
            return Err(Error::NotAMember);
        }
        slots.refs[idx] = slots.refs[idx].saturating_sub(1);
        Ok(())
    }

    /// Current reference count of an allocated buffer.
    pub fn ref_query(&self, id: BufferId) -> Result<u32> {
        let idx = self.index_of(id)?;
        let slots = self.slots.lock();
        if !slots.in_use[idx] {
            return Err(Error::NotAMember);
        }
        Ok(slots.refs[idx])
    }

    /// Read access to a buffer's bytes.
    ///
    /// The slice stays valid for the pool's lifetime but its contents are
    /// only meaningful while the caller holds a reference to `id`.
    ///
    /// # Panics
    /// Panics if `id` is out of range.
    pub fn buffer(&self, id: BufferId) -> &[u8] {
        let idx = usize::from(id.0);
        assert!(idx < self.capacity, "buffer id out of range");

        let offset = idx * self.buffer_size;
        // SAFETY:
        // 1. storage was allocated in new() and lives as long as the pool.
        // 2. offset math is bounded by capacity and buffer_size.
        // 3. Only an immutable slice is created; writers synchronize via the
        //    acquire/release protocol (a buffer is written before fan-out and
        //    read-only afterwards).
        let data = unsafe { &*self.storage.get() };
        &data[offset..offset + self.buffer_size]
    }

    /// Write access to a buffer's bytes.
    ///
    /// The caller must be the buffer's only holder (refcount 1, no
    /// descriptor published yet); the acquire/release protocol makes the
    /// access exclusive.
    ///
    /// # Panics
    /// Panics if `id` is out of range.
    #[allow(clippy::mut_from_ref)]
    pub fn buffer_mut(&self, id: BufferId) -> &mut [u8] {
        let idx = usize::from(id.0);
        assert!(idx < self.capacity, "buffer id out of range");

        let offset = idx * self.buffer_size;
        // SAFETY:
        // 1. storage was allocated in new() and lives as long as the pool.
        // 2. offset math is bounded by capacity and buffer_size.
        // 3. Exclusivity: the caller holds the buffer at refcount 1 before
        //    any descriptor referencing it is published, so no other thread
        //    reads or writes this region.
        let data = unsafe { &mut *self.storage.get() };
        &mut data[offset..offset + self.buffer_size]
    }

    /// Copy `payload` into the front of the buffer.
    pub fn fill(&self, id: BufferId, payload: &[u8]) -> Result<()> {
        if payload.len() > self.buffer_size {
            return Err(Error::InvalidArgument("payload exceeds buffer size"));
        }
        self.index_of(id)?;
        self.buffer_mut(id)[..payload.len()].copy_from_slice(payload);
        Ok(())
    }

    /// Number of allocated buffers.
    pub fn len(&self) -> usize {
        self.slots.lock().allocated
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of free buffers.
    pub fn available(&self) -> usize {
        self.freelist.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    /// Wake blocked acquirers with `Shutdown` and fail later acquisitions.
    /// Release paths keep working so in-flight buffers drain cleanly.
    pub fn close(&self) {
        self.sem.close();
    }

    fn claim_free_id(&self) -> Result<BufferId> {
        // A granted permit guarantees a free id on the list.
        let id = match self.freelist.pop() {
            Some(id) => id,
            None => return Err(Error::Shutdown),
        };

        let mut slots = self.slots.lock();
        let idx = usize::from(id);
        slots.in_use[idx] = true;
        slots.refs[idx] = 1;
        slots.allocated += 1;
        Ok(BufferId(id))
    }

    fn index_of(&self, id: BufferId) -> Result<usize> {
        let idx = usize::from(id.0);
        if idx >= self.capacity {
            return Err(Error::NotAMember);
        }
        Ok(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_invalid_construction() {
        assert!(BufferPool::new(0, 4).is_err());
        assert!(BufferPool::new(64, 0).is_err());
        assert!(BufferPool::new(64, usize::from(u16::MAX) + 1).is_err());
    }

    #[test]
    fn test_acquire_release_round_trip() {
        let pool = BufferPool::new(64, 4).expect("pool creation");
        assert_eq!(pool.available(), 4);

        let id = pool.acquire().expect("acquire");
        assert_eq!(pool.ref_query(id), Ok(1));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.available(), 3);

        pool.release(id).expect("release");
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.ref_query(id), Err(Error::NotAMember));
    }

    #[test]
    fn test_refcount_shared_release() {
        let pool = BufferPool::new(32, 2).expect("pool creation");
        let id = pool.acquire().expect("acquire");

        pool.ref_add(id).expect("ref_add");
        pool.ref_add(id).expect("ref_add");
        assert_eq!(pool.ref_query(id), Ok(3));

        pool.release(id).expect("first release");
        assert_eq!(pool.ref_query(id), Ok(2));
        pool.release(id).expect("second release");
        assert_eq!(pool.ref_query(id), Ok(1));
        assert_eq!(pool.available(), 1);

        pool.release(id).expect("final release");
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_ref_add_remove_cancels() {
        let pool = BufferPool::new(16, 4).expect("pool creation");
        let id = pool.acquire().expect("acquire");

        for _ in 0..3 {
            pool.ref_add(id).expect("ref_add");
        }
        for _ in 0..3 {
            pool.ref_remove(id).expect("ref_remove");
        }
        assert_eq!(pool.ref_query(id), Ok(1));

        pool.release(id).expect("release");
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_ref_remove_never_reclaims() {
        let pool = BufferPool::new(16, 2).expect("pool creation");
        let id = pool.acquire().expect("acquire");

        pool.ref_remove(id).expect("ref_remove to zero");
        assert_eq!(pool.ref_query(id), Ok(0));
        // Still allocated; only release reclaims.
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.available(), 1);

        pool.release(id).expect("release");
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_release_of_free_buffer_rejected() {
        let pool = BufferPool::new(16, 2).expect("pool creation");
        assert_eq!(pool.release(BufferId(0)), Err(Error::NotAMember));
        assert_eq!(pool.release(BufferId(9)), Err(Error::NotAMember));
        assert_eq!(pool.ref_add(BufferId(0)), Err(Error::NotAMember));
        // State unchanged.
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_double_release_rejected() {
        let pool = BufferPool::new(16, 2).expect("pool creation");
        let id = pool.acquire().expect("acquire");
        pool.release(id).expect("release");
        assert_eq!(pool.release(id), Err(Error::NotAMember));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_try_acquire_exhausted() {
        let pool = BufferPool::new(16, 1).expect("pool creation");
        let id = pool.acquire().expect("acquire");
        assert_eq!(pool.try_acquire(), Err(Error::WouldBlock));
        pool.release(id).expect("release");
        pool.try_acquire().expect("acquire after release");
    }

    #[test]
    fn test_exhaustion_blocks_until_release() {
        let pool = Arc::new(BufferPool::new(16, 1).expect("pool creation"));
        let held = pool.acquire().expect("acquire");

        let p = Arc::clone(&pool);
        let waiter = thread::spawn(move || {
            let start = Instant::now();
            let id = p.acquire()?;
            Ok::<_, Error>((id, start.elapsed()))
        });

        thread::sleep(Duration::from_millis(30));
        pool.release(held).expect("release");

        let (id, waited) = waiter.join().expect("waiter thread").expect("acquire");
        assert!(waited >= Duration::from_millis(20));
        pool.release(id).expect("release");
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_close_wakes_blocked_acquirer() {
        let pool = Arc::new(BufferPool::new(16, 1).expect("pool creation"));
        let _held = pool.acquire().expect("acquire");

        let p = Arc::clone(&pool);
        let waiter = thread::spawn(move || p.acquire());
        thread::sleep(Duration::from_millis(10));
        pool.close();

        assert_eq!(waiter.join().expect("waiter thread"), Err(Error::Shutdown));
    }

    #[test]
    fn test_fill_and_read_back() {
        let pool = BufferPool::new(8, 2).expect("pool creation");
        let id = pool.acquire().expect("acquire");

        pool.fill(id, b"ABCD").expect("fill");
        assert_eq!(&pool.buffer(id)[..4], b"ABCD");

        assert_eq!(
            pool.fill(id, &[0u8; 9]),
            Err(Error::InvalidArgument("payload exceeds buffer size"))
        );
        pool.release(id).expect("release");
    }

    #[test]
    fn test_accounting_invariant() {
        let pool = BufferPool::new(16, 4).expect("pool creation");
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(pool.acquire().expect("acquire"));
            assert_eq!(pool.len() + pool.available(), pool.capacity());
            assert_eq!(pool.sem_permits(), pool.available());
        }
        for id in held {
            pool.release(id).expect("release");
            assert_eq!(pool.len() + pool.available(), pool.capacity());
            assert_eq!(pool.sem_permits(), pool.available());
        }
    }

    impl BufferPool {
        fn sem_permits(&self) -> usize {
            self.sem.permits()
        }
    }
}

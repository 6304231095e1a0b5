// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Many-to-many in-process message bus with zero-copy fan-out.
//!
//! The bus owns a set of buffer pools (sorted ascending by buffer size) and
//! a bounded table of receive queues. Subscribers bind (queue, packet id)
//! pairs; a publication reserves a buffer from the smallest fitting pool,
//! is written once, and fans out to every subscribed queue as a descriptor,
//! multiplying the buffer's reference count instead of copying the payload.
//!
//! # Architecture
//!
//! ```text
//! publisher -> Bus.reserve() -> BufferPool.acquire()   (blocks on exhaustion)
//!      v
//! write payload once
//!      v
//! Bus.publish_release() -> ref_add x (k-1) -> try_push Descriptor x k
//!      v                                          v
//! subscribers: RxQueue.wait_front() / pop_front() -> BufferPool.release()
//! ```
//!
//! The buffer returns to its pool when the last subscriber pops it.
//!
//! # Ordering
//!
//! - Per receive queue: descriptors pop in the order fan-out pushed them.
//! - Per publisher and packet id: a publisher's earlier publication is seen
//!   before its later one by every subscriber, because fan-out completes
//!   before the publish call returns.
//! - Across publishers: no global order. Synchronous fan-out serializes
//!   whole fan-outs under the bus mutex; `service_async` drops the mutex
//!   before the per-queue pushes, so two publishers' fan-outs may
//!   interleave.
//!
//! # Lock order
//!
//! bus mutex -> receive-queue locks -> pool mutex, never reversed.

mod rxq;

pub use rxq::{Descriptor, RxQueue};

use crate::error::{Error, Result};
use crate::rt::pool::{BufferId, BufferPool};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Packet identifier chosen by publishers; opaque to the bus, used only for
/// subscription matching.
pub type PacketId = u32;

/// Ceiling on subscriptions per allowed receive queue.
const MAX_SUBSCRIPTIONS_PER_RXQ: usize = 64;

/// Construction-time description of one buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSpec {
    /// Size of each buffer in bytes.
    pub buffer_size: usize,
    /// Number of buffers.
    pub count: usize,
}

/// Bus behavior flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusFlags {
    /// Drop the bus mutex between per-queue pushes during fan-out, letting
    /// subscribers start consuming before fan-out completes.
    pub service_async: bool,
}

/// Bus construction parameters.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Pool descriptions; sorted by the bus ascending by buffer size.
    pub pools: Vec<PoolSpec>,
    /// Maximum number of receive queues ever created.
    pub max_rxqs: usize,
    pub flags: BusFlags,
    /// Human-readable name, used in logs only.
    pub name: String,
}

/// Counters accumulated since construction. Relaxed snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusStats {
    /// Completed publish_release calls.
    pub published: u64,
    /// Descriptors successfully enqueued.
    pub delivered: u64,
    /// Descriptors dropped because a target queue was full.
    pub dropped: u64,
}

/// One (packet id, queue) binding. The vector holding these is kept sorted
/// by pid, stable by insertion order for equal pids, so fan-out walks a
/// contiguous range.
struct Subscription {
    pid: PacketId,
    rxq: usize,
}

struct BusInner {
    rxqs: Vec<Arc<RxQueue>>,
    subs: Vec<Subscription>,
}

/// A reserved, writable buffer awaiting publication.
///
/// Obtained from [`Bus::reserve`]; consumed by [`Bus::publish_release`].
/// Dropping an unconsumed reservation releases the buffer back to its pool.
pub struct Reservation {
    pool: Arc<BufferPool>,
    pool_idx: u8,
    buffer: BufferId,
    consumed: bool,
}

impl Reservation {
    /// Writable view of the reserved buffer.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        self.pool.buffer_mut(self.buffer)
    }

    /// Capacity of the reserved buffer in bytes.
    pub fn capacity(&self) -> usize {
        self.pool.buffer_size()
    }

    pub fn buffer_id(&self) -> BufferId {
        self.buffer
    }

    /// Index of the owning pool in the bus's pool table.
    pub fn pool_index(&self) -> usize {
        usize::from(self.pool_idx)
    }

    fn consume(mut self) -> (Arc<BufferPool>, u8, BufferId) {
        self.consumed = true;
        (Arc::clone(&self.pool), self.pool_idx, self.buffer)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.consumed {
            if let Err(err) = self.pool.release(self.buffer) {
                log::debug!(
                    "[bus] dropped reservation failed to release buffer {}: {}",
                    self.buffer.0,
                    err
                );
            }
        }
    }
}

/// The publish/subscribe bus.
pub struct Bus {
    name: String,
    flags: BusFlags,
    /// Sorted ascending by buffer size; immutable after construction.
    pools: Arc<[Arc<BufferPool>]>,
    largest_buffer: usize,
    max_rxqs: usize,
    inner: Mutex<BusInner>,
    shut: AtomicBool,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Bus {
    pub fn new(config: BusConfig) -> Result<Self> {
        if config.pools.is_empty() {
            return Err(Error::InvalidArgument("pool list is empty"));
        }
        if config.pools.len() > usize::from(u8::MAX) {
            return Err(Error::InvalidArgument("too many pools"));
        }
        if config.max_rxqs == 0 {
            return Err(Error::InvalidArgument("max_rxqs must be > 0"));
        }

        // Smallest-fitting-pool selection needs the table sorted; callers
        // may pass specs in any order.
        let mut specs = config.pools;
        specs.sort_by_key(|spec| spec.buffer_size);

        let pools = specs
            .iter()
            .map(|spec| BufferPool::new(spec.buffer_size, spec.count).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let largest_buffer = match pools.last() {
            Some(pool) => pool.buffer_size(),
            None => return Err(Error::InvalidArgument("pool list is empty")),
        };

        log::debug!(
            "[bus] '{}' created: {} pools (largest {} B), max {} rxqs, async={}",
            config.name,
            pools.len(),
            largest_buffer,
            config.max_rxqs,
            config.flags.service_async
        );

        Ok(Self {
            name: config.name,
            flags: config.flags,
            pools: pools.into(),
            largest_buffer,
            max_rxqs: config.max_rxqs,
            inner: Mutex::new(BusInner {
                rxqs: Vec::new(),
                subs: Vec::new(),
            }),
            shut: AtomicBool::new(false),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Allocate a receive queue of the given capacity.
    ///
    /// Queues live until bus shutdown. Fails with `CapacityExceeded` once
    /// `max_rxqs` queues exist.
    pub fn rxq_init(&self, capacity: usize) -> Result<Arc<RxQueue>> {
        if self.shut.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }

        let mut inner = self.inner.lock();
        if inner.rxqs.len() == self.max_rxqs {
            return Err(Error::CapacityExceeded);
        }

        let id = inner.rxqs.len();
        let rxq = Arc::new(RxQueue::new(id, capacity, Arc::clone(&self.pools))?);
        inner.rxqs.push(Arc::clone(&rxq));
        log::trace!("[bus] '{}' rxq {} created, capacity {}", self.name, id, capacity);
        Ok(rxq)
    }

    /// Bind `rxq` to packet id `pid`.
    pub fn subscribe(&self, rxq: &Arc<RxQueue>, pid: PacketId) -> Result<()> {
        let mut inner = self.inner.lock();
        let id = Self::queue_index(&inner, rxq)?;

        let lo = inner.subs.partition_point(|s| s.pid < pid);
        let hi = inner.subs.partition_point(|s| s.pid <= pid);
        if inner.subs[lo..hi].iter().any(|s| s.rxq == id) {
            return Err(Error::AlreadySubscribed);
        }
        if inner.subs.len() >= self.max_rxqs * MAX_SUBSCRIPTIONS_PER_RXQ {
            return Err(Error::CapacityExceeded);
        }

        // Insert after existing entries for the same pid: fan-out order for
        // one pid is subscription order.
        inner.subs.insert(hi, Subscription { pid, rxq: id });
        log::trace!("[bus] '{}' rxq {} subscribed to pid {}", self.name, id, pid);
        Ok(())
    }

    /// Remove the (queue, pid) binding. Removing an absent pair is Ok.
    pub fn unsubscribe(&self, rxq: &Arc<RxQueue>, pid: PacketId) -> Result<()> {
        let mut inner = self.inner.lock();
        let id = Self::queue_index(&inner, rxq)?;

        let lo = inner.subs.partition_point(|s| s.pid < pid);
        let hi = inner.subs.partition_point(|s| s.pid <= pid);
        if let Some(pos) = inner.subs[lo..hi].iter().position(|s| s.rxq == id) {
            inner.subs.remove(lo + pos);
            log::trace!("[bus] '{}' rxq {} unsubscribed from pid {}", self.name, id, pid);
        }
        Ok(())
    }

    /// Reserve a writable buffer from the smallest pool fitting `size`,
    /// blocking while that pool is exhausted.
    pub fn reserve(&self, size: usize) -> Result<Reservation> {
        let (idx, pool) = self.pool_for(size)?;
        let buffer = pool.acquire()?;
        Ok(Reservation {
            pool: Arc::clone(pool),
            pool_idx: idx,
            buffer,
            consumed: false,
        })
    }

    /// As [`reserve`](Self::reserve) but `WouldBlock` instead of blocking.
    pub fn try_reserve(&self, size: usize) -> Result<Reservation> {
        let (idx, pool) = self.pool_for(size)?;
        let buffer = pool.try_acquire()?;
        Ok(Reservation {
            pool: Arc::clone(pool),
            pool_idx: idx,
            buffer,
            consumed: false,
        })
    }

    /// Publish by copy: reserve, memcpy `payload`, fan out.
    pub fn publish(&self, pid: PacketId, payload: &[u8]) -> Result<()> {
        let mut reservation = self.reserve(payload.len())?;
        reservation.payload_mut()[..payload.len()].copy_from_slice(payload);
        self.publish_release(pid, reservation, payload.len())
    }

    /// As [`publish`](Self::publish) but `WouldBlock` when the fitting pool
    /// is exhausted.
    pub fn try_publish(&self, pid: PacketId, payload: &[u8]) -> Result<()> {
        let mut reservation = self.try_reserve(payload.len())?;
        reservation.payload_mut()[..payload.len()].copy_from_slice(payload);
        self.publish_release(pid, reservation, payload.len())
    }

    /// Fan a reserved, written buffer out to every subscriber of `pid`.
    ///
    /// The reservation must hold the buffer at reference count 1 with no
    /// other thread holding a reference (true for any unshared
    /// [`Reservation`]). With zero subscribers the buffer is reclaimed
    /// immediately. A full target queue drops that queue's delivery,
    /// refunds its reference, and the call finally reports
    /// `PartialDelivery`; the remaining queues still receive the packet.
    pub fn publish_release(
        &self,
        pid: PacketId,
        reservation: Reservation,
        len: usize,
    ) -> Result<()> {
        if len == 0 {
            return Err(Error::InvalidArgument("publish size must be > 0"));
        }
        if len > reservation.capacity() {
            return Err(Error::PayloadTooLarge {
                size: len,
                max: reservation.capacity(),
            });
        }
        let desc_len =
            u32::try_from(len).map_err(|_| Error::InvalidArgument("publish size exceeds u32"))?;

        let (pool, pool_idx, buffer) = reservation.consume();

        let inner = self.inner.lock();
        let lo = inner.subs.partition_point(|s| s.pid < pid);
        let hi = inner.subs.partition_point(|s| s.pid <= pid);
        let fanout = hi - lo;

        if fanout == 0 {
            drop(inner);
            pool.release(buffer)?;
            self.published.fetch_add(1, Ordering::Relaxed);
            log::trace!("[bus] '{}' pid {} has no subscribers", self.name, pid);
            return Ok(());
        }

        // One reference per subscriber; the acquisition itself carries the
        // first.
        for _ in 1..fanout {
            pool.ref_add(buffer)?;
        }

        let desc = Descriptor {
            buffer,
            len: desc_len,
            pid,
            pool: pool_idx,
        };

        let mut failed = 0usize;
        let mut delivered = 0u64;
        if self.flags.service_async {
            let targets: Vec<Arc<RxQueue>> = inner.subs[lo..hi]
                .iter()
                .map(|s| Arc::clone(&inner.rxqs[s.rxq]))
                .collect();
            drop(inner);
            for queue in &targets {
                match queue.deliver(desc) {
                    Ok(()) => delivered += 1,
                    Err(err) => {
                        failed += 1;
                        log::debug!(
                            "[bus] '{}' delivery to rxq {} failed: {}",
                            self.name,
                            queue.id(),
                            err
                        );
                        pool.release(buffer)?;
                    }
                }
            }
        } else {
            for sub in &inner.subs[lo..hi] {
                let queue = &inner.rxqs[sub.rxq];
                match queue.deliver(desc) {
                    Ok(()) => delivered += 1,
                    Err(err) => {
                        failed += 1;
                        log::debug!(
                            "[bus] '{}' delivery to rxq {} failed: {}",
                            self.name,
                            queue.id(),
                            err
                        );
                        pool.release(buffer)?;
                    }
                }
            }
            drop(inner);
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        self.delivered.fetch_add(delivered, Ordering::Relaxed);
        if failed > 0 {
            self.dropped.fetch_add(failed as u64, Ordering::Relaxed);
            return Err(Error::PartialDelivery { failed });
        }
        Ok(())
    }

    /// Close every receive queue and pool, waking blocked publishers and
    /// subscribers with `Shutdown`. Idempotent; also invoked by `Drop`.
    pub fn shutdown(&self) {
        if self.shut.swap(true, Ordering::SeqCst) {
            return;
        }

        let rxqs: Vec<Arc<RxQueue>> = self.inner.lock().rxqs.clone();
        for queue in &rxqs {
            queue.close();
        }
        for pool in self.pools.iter() {
            pool.close();
        }
        log::debug!("[bus] '{}' shut down, {} rxqs closed", self.name, rxqs.len());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pool table, sorted ascending by buffer size.
    pub fn pools(&self) -> &[Arc<BufferPool>] {
        &self.pools
    }

    pub fn rxq_count(&self) -> usize {
        self.inner.lock().rxqs.len()
    }

    pub fn max_rxqs(&self) -> usize {
        self.max_rxqs
    }

    pub fn largest_buffer_size(&self) -> usize {
        self.largest_buffer
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn queue_index(inner: &BusInner, rxq: &Arc<RxQueue>) -> Result<usize> {
        match inner.rxqs.get(rxq.id()) {
            Some(own) if Arc::ptr_eq(own, rxq) => Ok(rxq.id()),
            _ => Err(Error::InvalidArgument("queue does not belong to this bus")),
        }
    }

    /// Smallest pool whose buffer size fits `size`.
    fn pool_for(&self, size: usize) -> Result<(u8, &Arc<BufferPool>)> {
        if size == 0 {
            return Err(Error::InvalidArgument("publish size must be > 0"));
        }
        let idx = self
            .pools
            .partition_point(|pool| pool.buffer_size() < size);
        match self.pools.get(idx) {
            Some(pool) => {
                let idx = u8::try_from(idx)
                    .map_err(|_| Error::InvalidArgument("too many pools"))?;
                Ok((idx, pool))
            }
            None => Err(Error::PayloadTooLarge {
                size,
                max: self.largest_buffer,
            }),
        }
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Receive queue and delivery descriptor.
//!
//! Each subscriber owns one [`RxQueue`] and drains [`Descriptor`] records
//! from it. A descriptor is a weak reference into a pool buffer: lookup
//! only, never ownership. Popping a descriptor performs the subscriber's
//! single paired release, which is what keeps the fan-out reference count
//! balanced.

use crate::error::{Error, Result};
use crate::rt::pool::{BufferId, BufferPool};
use crate::rt::queue::BlockingQueue;
use std::sync::Arc;
use std::time::Duration;

use super::PacketId;

/// Delivery record pushed into a receive queue during fan-out.
#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    /// Buffer holding the payload.
    pub buffer: BufferId,
    /// Payload length in bytes (may be less than the buffer size).
    pub len: u32,
    /// Packet id the publication was made under.
    pub pid: PacketId,
    /// Index of the originating pool in the bus's pool table.
    pub pool: u8,
}

/// Bounded FIFO of delivery descriptors, one per subscriber.
///
/// Created through `Bus::rxq_init` and valid until bus shutdown.
pub struct RxQueue {
    id: usize,
    queue: BlockingQueue<Descriptor>,
    pools: Arc<[Arc<BufferPool>]>,
}

impl RxQueue {
    pub(super) fn new(
        id: usize,
        capacity: usize,
        pools: Arc<[Arc<BufferPool>]>,
    ) -> Result<Self> {
        Ok(Self {
            id,
            queue: BlockingQueue::new(capacity)?,
            pools,
        })
    }

    /// Stable id of this queue within its bus.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Block until a delivery is available and return a copy of the front
    /// descriptor without removing it.
    pub fn wait_front(&self) -> Result<Descriptor> {
        self.queue.wait_peek()
    }

    /// As [`wait_front`](Self::wait_front), waiting at most `rel`.
    pub fn timed_wait_front(&self, rel: Duration) -> Result<Descriptor> {
        self.queue.timed_wait_peek(rel)
    }

    /// Remove the front descriptor and release its buffer reference.
    ///
    /// This is the subscriber's one release obligation per received
    /// descriptor. Blocks while the queue is empty.
    pub fn pop_front(&self) -> Result<Descriptor> {
        let desc = self.queue.pop()?;
        self.pool_of(&desc)?.release(desc.buffer)?;
        Ok(desc)
    }

    /// Payload bytes of a delivered descriptor.
    ///
    /// Valid while the caller still holds the delivery (i.e. before its
    /// `pop_front`); afterwards the buffer may be reused.
    pub fn payload(&self, desc: &Descriptor) -> Result<&[u8]> {
        let pool = self.pool_of(desc)?;
        let len = usize::try_from(desc.len).map_err(|_| Error::NotAMember)?;
        if len > pool.buffer_size() {
            return Err(Error::NotAMember);
        }
        Ok(&pool.buffer(desc.buffer)[..len])
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn free_slots(&self) -> usize {
        self.queue.free_slots()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Non-blocking descriptor enqueue used by fan-out.
    pub(super) fn deliver(&self, desc: Descriptor) -> Result<()> {
        self.queue.try_push(desc)
    }

    pub(super) fn close(&self) {
        self.queue.close();
    }

    fn pool_of(&self, desc: &Descriptor) -> Result<&Arc<BufferPool>> {
        self.pools.get(usize::from(desc.pool)).ok_or(Error::NotAMember)
    }
}

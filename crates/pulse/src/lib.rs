// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # pulse - zero-copy in-process publish/subscribe bus
//!
//! A many-to-many message bus for resource-constrained and real-time
//! deployments. All memory is allocated at construction time; the publish
//! and receive paths never touch the allocator. A publication is written
//! once into a pooled buffer and fans out to every subscriber as a small
//! descriptor, with a per-buffer reference count standing in for per-
//! subscriber copies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pulse::{Bus, BusConfig, BusFlags, PoolSpec};
//!
//! fn main() -> pulse::Result<()> {
//!     let bus = Bus::new(BusConfig {
//!         pools: vec![PoolSpec { buffer_size: 64, count: 8 }],
//!         max_rxqs: 4,
//!         flags: BusFlags::default(),
//!         name: "sensors".to_string(),
//!     })?;
//!
//!     let rxq = bus.rxq_init(16)?;
//!     bus.subscribe(&rxq, 7)?;
//!
//!     bus.publish(7, b"hello")?;
//!
//!     let desc = rxq.wait_front()?;
//!     assert_eq!(rxq.payload(&desc)?, b"hello");
//!     rxq.pop_front()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                              Bus                                   |
//! |  subscription table (sorted by packet id) | receive-queue table    |
//! +--------------------------------------------------------------------+
//! |                        Runtime primitives                          |
//! |  BufferPool (refcounted, blocking acquire)                         |
//! |  BlockingQueue (ring buffer + full/empty counting semaphores)      |
//! |  Semaphore (parking_lot condvar, close-aware)                      |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Bus`] | Owns the pools, receive queues, and subscription table |
//! | [`RxQueue`] | One subscriber's bounded FIFO of delivery descriptors |
//! | [`Descriptor`] | Weak reference to a delivered payload |
//! | [`Reservation`] | Writable buffer grant for zero-copy publication |
//! | [`BufferPool`] | Fixed-capacity reference-counted buffer allocator |
//! | [`BlockingQueue`] | Bounded blocking FIFO used for the receive queues |
//!
//! ## Guarantees
//!
//! - Per receive queue, descriptors pop in fan-out order (FIFO).
//! - A single publisher's packets on one packet id are seen in publish
//!   order by every subscriber.
//! - A buffer returns to its pool exactly when the last subscriber pops
//!   its descriptor; with zero subscribers it returns immediately.
//! - Destroying the bus wakes every blocked publisher and subscriber with
//!   [`Error::Shutdown`].

pub mod bus;
pub mod error;
pub mod rt;

pub use bus::{
    Bus, BusConfig, BusFlags, BusStats, Descriptor, PacketId, PoolSpec, Reservation, RxQueue,
};
pub use error::{Error, Result};
pub use rt::pool::{BufferId, BufferPool};
pub use rt::queue::BlockingQueue;
pub use rt::semaphore::Semaphore;

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Channels and message pools.
//!
//! A channel is a FIFO of messages plus the actors waiting on it, tagged
//! with the message type it transports. A *pool-backed* channel
//! additionally owns an array of equal-sized message slots and acts as the
//! allocator for them; a *transport-only* channel has no storage of its
//! own and merely moves messages that belong to some other channel's pool.
//!
//! A single [`Queue`] per channel holds either queued messages or waiting
//! actors, never both — an actor only waits because the channel had
//! nothing to give it, and a message is only queued because nobody was
//! waiting. Representing the queue as a sum type makes the states
//! mutually exclusive by construction instead of by comment.
//!
//! For a pool-backed channel the same queue doubles as the free list:
//! releasing a message pushes it back onto its parent channel's queue,
//! where allocation will find it once the storage array has been carved
//! empty. Message payload bytes are never touched here; a message is a
//! `(channel, slot)` handle and the slot-to-address mapping is plain
//! arithmetic on the pool's base address.

use crate::{ActorId, MsgRef};

/// Placement of a pool-backed channel's slot storage, supplied by the
/// boot glue from whatever memory the linker gave it.
#[derive(Copy, Clone, Debug)]
pub struct PoolConfig {
    /// Base address of the slot array. Must be aligned to `block_size`.
    pub base: usize,
    /// Size of one slot in bytes; a power of two, since a bound message
    /// becomes a hardware protection region.
    pub block_size: usize,
    /// Number of slots in the array.
    pub block_count: u16,
}

/// One channel. See the module docs for the pool-backed/transport-only
/// distinction.
#[derive(Debug)]
pub struct Channel<'k> {
    msg_type: u16,
    pub(crate) queue: Queue,
    pub(crate) pool: Option<Pool<'k>>,
}

impl<'k> Channel<'k> {
    /// Creates a transport-only channel for messages of type `msg_type`.
    ///
    /// # Panics
    ///
    /// If `msg_type` is zero, which is reserved for "no type recorded".
    pub fn new(msg_type: u16) -> Self {
        assert!(msg_type != 0);
        Channel {
            msg_type,
            queue: Queue::Empty,
            pool: None,
        }
    }

    /// Creates a pool-backed channel. `links` provides the kernel-side
    /// per-slot bookkeeping and must have exactly one entry per block.
    ///
    /// # Panics
    ///
    /// If `msg_type` is zero, the block size is not a power of two, the
    /// base is not naturally aligned, or `links` has the wrong length.
    pub fn with_pool(
        msg_type: u16,
        config: PoolConfig,
        links: &'k mut [Option<MsgRef>],
    ) -> Self {
        assert!(msg_type != 0);
        assert!(
            config.block_size.is_power_of_two()
                && config.base & (config.block_size - 1) == 0
        );
        assert!(links.len() == usize::from(config.block_count));
        Channel {
            msg_type,
            queue: Queue::Empty,
            pool: Some(Pool {
                base: config.base,
                block_size: config.block_size,
                carved: 0,
                links,
            }),
        }
    }

    /// Type tag of the messages this channel transports.
    pub fn msg_type(&self) -> u16 {
        self.msg_type
    }

    /// Block size of the backing pool, if this channel has one.
    pub fn block_size(&self) -> Option<usize> {
        self.pool.as_ref().map(|p| p.block_size)
    }
}

/// Allocation state of a pool-backed channel's storage.
#[derive(Debug)]
pub(crate) struct Pool<'k> {
    base: usize,
    block_size: usize,
    /// Slots handed out from the array so far. Slots below this index are
    /// in circulation (somewhere in a queue or a mailbox); slots at or
    /// above it are untouched storage.
    carved: u16,
    /// Per-slot queue links, indexed by slot.
    links: &'k mut [Option<MsgRef>],
}

impl Pool<'_> {
    /// Takes the next untouched slot from the array, if one remains.
    pub(crate) fn carve(&mut self) -> Option<u16> {
        if usize::from(self.carved) < self.links.len() {
            let slot = self.carved;
            self.carved += 1;
            Some(slot)
        } else {
            None
        }
    }

    pub(crate) fn link(&self, slot: u16) -> Option<MsgRef> {
        self.links[usize::from(slot)]
    }

    pub(crate) fn set_link(&mut self, slot: u16, next: Option<MsgRef>) {
        self.links[usize::from(slot)] = next;
    }

    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }

    pub(crate) fn addr_of(&self, slot: u16) -> usize {
        self.base + usize::from(slot) * self.block_size
    }

    pub(crate) fn uncarved(&self) -> usize {
        self.links.len() - usize::from(self.carved)
    }
}

/// Contents of a channel's queue. Queued messages and waiting actors are
/// mutually exclusive.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Queue {
    Empty,
    Messages { head: MsgRef, tail: MsgRef },
    Waiters { head: ActorId, tail: ActorId },
}

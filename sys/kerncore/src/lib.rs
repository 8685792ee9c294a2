// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hardware-independent core of the actor runtime.
//!
//! This crate contains the parts of the kernel that can be reasoned about
//! (and unit-tested) without any notion of privilege, memory protection, or
//! a particular interrupt controller:
//!
//! - the scheduler: per-priority ready FIFOs with an O(1) occupancy bitmap,
//!   and a bounded timer ring ([`sched`], [`runtime`]);
//! - message pools, channels, and the wait-queue discipline that moves
//!   messages between them ([`msg`], [`runtime`]);
//! - a 32-vector software interrupt controller for platforms that only
//!   offer a single usable IRQ ([`pic`]);
//! - generic region arithmetic shared with the protection layer
//!   ([`region`]).
//!
//! The protected-actor layer in the `kern` crate drives all of this through
//! [`runtime::Runtime`], which owns the tables and upholds the ownership
//! invariant: every message is in exactly one of a pool free queue, a
//! channel queue, or an actor's mailbox.
//!
//! Nothing here performs a memory access on behalf of an actor; messages
//! are tracked purely as (channel, slot) handles, and turning a handle into
//! an address is a single multiplication done for the protection layer's
//! benefit.

// Allow std-y things to be used in test. Note that this attribute is a bit
// of a trap for the programmer, because rust-analyzer by default seems to
// build things with test set. This means it's easy to introduce code
// incompatible with no_std without your editor hassling you about it.
// Beware.
#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

pub mod msg;
pub mod pic;
pub mod region;
pub mod runtime;
pub mod sched;

pub use msg::{Channel, PoolConfig};
pub use pic::Gpic;
pub use runtime::Runtime;
pub use sched::{ActorKind, SchedSlot};

/// Number of interrupt vectors, and therefore distinct priority levels,
/// the runtime multiplexes. Vectors map one-to-one onto priorities.
pub const VECTOR_COUNT: usize = 32;

/// Largest number of CPUs the runtime will track wakeups for. Single-core
/// builds simply leave the other entries idle.
pub const CPU_MAX: usize = 4;

/// Capacity of the timer ring. Exceeding it is a configuration error and
/// treated as a fatal kernel bug.
pub const TIMERQ_MAX: usize = 16;

/// Identifies an actor by its index in the actor tables.
///
/// The runtime and the protection layer keep parallel tables indexed by
/// this id; the id itself carries no generation or permission information.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct ActorId(pub u16);

impl ActorId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Identifies a channel by its index in the channel table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct ChanId(pub u16);

impl ChanId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Handle to one message: the pool-backed channel whose storage holds it,
/// plus the slot index within that storage.
///
/// A message keeps this identity for its whole life, regardless of which
/// channel it is currently queued on or which actor holds it. The parent
/// channel is where `free` returns it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MsgRef {
    pub chan: ChanId,
    pub slot: u16,
}

/// A request to assert interrupt vector `vect` on CPU `cpu`.
///
/// Scheduling operations accumulate these inside the [`Runtime`]; the
/// platform layer drains them before returning from a kernel entry and
/// asserts each one, locally or through a cross-CPU doorbell.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IrqRequest {
    pub cpu: u8,
    pub vect: u8,
}

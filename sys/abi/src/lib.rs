// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between kernel and actors.
//!
//! Everything in this crate is visible from both sides of the privilege
//! boundary: the syscall word encoding, the usermode view of a message
//! header, priorities, region attributes, and the task descriptor table
//! format the boot glue hands to the kernel.

#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of low bits of a syscall word that carry the argument. The
/// remaining top bits carry the operation number.
pub const SYSCALL_ARG_BITS: u32 = 28;

/// Mask selecting the argument part of a syscall word.
pub const SYSCALL_ARG_MASK: u32 = (1 << SYSCALL_ARG_BITS) - 1;

/// Operations an actor can request from the kernel.
///
/// A syscall is a single machine word: `(op << 28) | (arg & 0x0fff_ffff)`.
/// The numeric values are ABI and must not be reordered: the kernel treats
/// any value above `Sysnum::Free` as an actor exception, and the split
/// between asynchronous and synchronous calls is "everything up to and
/// including `Subscribe` is asynchronous."
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Sysnum {
    /// Suspend for `arg` ticks; `arg == 0` merely reschedules the caller.
    /// Asynchronous: the actor is re-entered on wake.
    Delay = 0,
    /// Release the current message, then obtain one from channel `arg`,
    /// suspending until one is available. Asynchronous.
    Subscribe = 1,
    /// Release the current message, then obtain one from channel `arg`
    /// without blocking. Synchronous; returns the message or null.
    TryPop = 2,
    /// Move the owned message into channel `arg` if the types match.
    /// Synchronous.
    Push = 3,
    /// Release the owned message back to its pool. Synchronous.
    Free = 4,
}

impl Sysnum {
    /// Largest operation number that suspends the caller. Calls above this
    /// complete on the caller's existing frame.
    pub const LAST_ASYNC: u32 = Sysnum::Subscribe as u32;

    /// Checks whether this call completes synchronously, i.e. the caller
    /// keeps running on the same frame and receives a result register.
    pub fn is_synchronous(self) -> bool {
        self as u32 > Self::LAST_ASYNC
    }
}

impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Delay),
            1 => Ok(Self::Subscribe),
            2 => Ok(Self::TryPop),
            3 => Ok(Self::Push),
            4 => Ok(Self::Free),
            _ => Err(()),
        }
    }
}

/// Packs an operation and its argument into a syscall word. The argument
/// is truncated to its low 28 bits.
pub const fn syscall_word(op: Sysnum, arg: u32) -> u32 {
    ((op as u32) << SYSCALL_ARG_BITS) | (arg & SYSCALL_ARG_MASK)
}

/// Splits a syscall word into its raw operation number and argument. The
/// operation is *not* validated; the kernel treats out-of-range values as
/// an actor exception.
pub const fn syscall_split(word: u32) -> (u32, u32) {
    (word >> SYSCALL_ARG_BITS, word & SYSCALL_ARG_MASK)
}

/// Indicates priority of an actor, equal to the interrupt vector that
/// schedules it.
///
/// Priorities are small numbers; numerically *higher* priorities preempt
/// lower ones, matching the bit order of the interrupt controller (the
/// scheduler picks the most significant pending bit). Priority 0 is
/// reserved for traps and priority 1 for the kernel tick, so actors use
/// 2 and up.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means preempts or
/// merely numerically greater.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Default,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Serialize,
    Deserialize,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Priority level reserved for synchronous traps and faults.
    pub const TRAP: Self = Self(0);
    /// Priority level reserved for the kernel tick.
    pub const TICK: Self = Self(1);
    /// Lowest level assignable to an actor.
    pub const FIRST_ACTOR: Self = Self(2);

    /// Checks if `self` preempts `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 > other.0
    }
}

/// Usermode view of a message header.
///
/// The kernel and the owning actor share this layout; the actor sees it at
/// the base of its message region. Only `size` and `poisoned` carry
/// meaning across the boundary, and both are written by the kernel: `size`
/// at bind (it holds the full block size, header included), `poisoned` at
/// release. The middle words are reserved for the kernel and read as zero
/// from usermode.
///
/// The payload begins immediately after the header. Total message size is
/// the pool's block size, a power of two.
#[derive(
    Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct MsgHeader {
    /// Size in bytes of the whole message, header included. Valid while
    /// the message is bound to the reading actor.
    pub size: usize,
    reserved: [usize; 2],
    /// Nonzero if the previous owner of this message crashed while holding
    /// it; the payload may be partially mutated and must not be trusted.
    pub poisoned: usize,
}

impl MsgHeader {
    pub const WORDS: usize = 4;
}

/// Byte offset of the payload within a message.
pub const MSG_PAYLOAD_OFFSET: usize = core::mem::size_of::<MsgHeader>();

bitflags::bitflags! {
    /// Flags describing what can be done with a hardware memory region.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct RegionAttributes: u32 {
        /// Region can be read by the actor that holds it.
        const READ = 1 << 0;
        /// Region can be written by the actor that holds it.
        const WRITE = 1 << 1;
        /// Region can contain executable code for the actor that holds it.
        const EXECUTE = 1 << 2;
        /// Region contains memory mapped registers. This affects cache
        /// behavior on devices that include it.
        const DEVICE = 1 << 3;

        const RESERVED = !((1 << 4) - 1);
    }
}

impl RegionAttributes {
    /// Read-only executable memory: actor code and constants.
    pub const RO: Self = Self::READ.union(Self::EXECUTE);
    /// Ordinary read-write data memory.
    pub const RW: Self = Self::READ.union(Self::WRITE);
    /// Uncached peripheral memory.
    pub const DEV: Self = Self::READ.union(Self::WRITE).union(Self::DEVICE);
}

/// Record describing a single actor's memory, as placed by the boot glue.
///
/// The kernel accepts a table of these (an opaque artifact of the memory
/// map) and does not interpret the contents beyond the checks in
/// [`TaskDesc::validate`]. The flash base doubles as the entry point:
/// by convention each actor's code begins at the base of its flash slice.
#[derive(
    Copy,
    Clone,
    Debug,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Serialize,
    Deserialize,
)]
#[repr(C)]
pub struct TaskDesc {
    /// Base address of the actor's code region; also its entry point.
    pub flash_base: usize,
    /// Size of the code region in bytes. Power of two.
    pub flash_size: usize,
    /// Base address of the actor's private data region.
    pub sram_base: usize,
    /// Size of the data region in bytes. Power of two.
    pub sram_size: usize,
}

impl TaskDesc {
    /// Checks the hardware constraints on a descriptor: sizes must be
    /// powers of two and each base naturally aligned to its size.
    pub fn validate(&self) -> bool {
        region_shape_ok(self.flash_base, self.flash_size)
            && region_shape_ok(self.sram_base, self.sram_size)
    }
}

/// Checks that `size` is a nonzero power of two and `base` is naturally
/// aligned to it, the shape every protection unit we target requires.
pub const fn region_shape_ok(base: usize, size: usize) -> bool {
    size != 0 && size & (size - 1) == 0 && base & (size - 1) == 0
}

/// Description of a fault taken by an actor, reported to the fault policy
/// hook and available to debuggers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FaultInfo {
    /// The actor accessed memory outside its region set. The faulting
    /// address is included when the hardware provides one.
    MemoryAccess { address: Option<usize> },
    /// The bus signalled an error completing an access.
    BusError,
    /// The actor executed an undefined or privileged instruction.
    IllegalInstruction,
    /// Integer division by zero (on ports that trap it).
    DivideByZero,
    /// The actor issued a syscall word with an out-of-range operation.
    BadSyscall(u32),
}

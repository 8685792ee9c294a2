// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Protected-actor kernel.
//!
//! This crate layers hardware memory protection over the runtime in
//! `kerncore`: actors are short usermode routines, each confined to a
//! handful of protection regions, scheduled by interrupt priority and
//! re-entered once per delivered message. The pieces:
//!
//! - [`actor`]: the per-actor protection state — entry point, the
//!   five-slot region set, message binding, restart bookkeeping;
//! - [`kernel`]: the per-CPU execution state (running actor, preemption
//!   stack, per-priority stacks, idle view) and the interrupt-entry path
//!   that launches actors;
//! - [`syscalls`]: dispatch of the single-word syscall ABI;
//! - [`fault`]: conversion of actor faults into poisoned-message release
//!   and policy-driven restart;
//! - [`startup`]: boot-glue helpers for wiring tables together;
//! - [`arch`]: the port layer — ARMv7-M on bare metal, a deterministic
//!   simulation everywhere else (which is what the test suite drives).
//!
//! # Design principles
//!
//! 1. Static configuration: every table is allocated by the boot glue and
//!    handed in by reference; the kernel never allocates.
//! 2. One kernel object. All entry points take `&mut Kernel`; the only
//!    globals live in the port layer, where the hardware forces them.
//! 3. Faults are local. An actor crash releases its resources (message
//!    poisoned, wait-queue entry unlinked) and restarts it; the kernel
//!    and its peers keep going.
//! 4. A preference for simple and clear algorithms over fast and clever
//!    algorithms.

#![cfg_attr(all(not(test), target_os = "none"), no_std)]

/// Kernel invariant check. A failure here is a kernel bug, never an actor
/// bug, and takes the system down through the panic path.
macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("kernel assertion failed");
        }
    };
}
pub(crate) use uassert;

pub mod arch;

pub mod actor;
pub mod fault;
pub mod kernel;
pub mod profiling;
pub mod startup;
pub mod syscalls;
mod umem;

#[cfg(target_os = "none")]
pub mod fail;

pub use actor::{Actor, REGIONS_PER_ACTOR};
pub use fault::Hooks;
pub use kernel::{CpuContext, Kernel};

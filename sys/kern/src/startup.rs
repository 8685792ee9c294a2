// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.
//!
//! The kernel does not own its configuration; the boot glue does. A
//! board (or the host harness) brings the system up in this order, per
//! CPU:
//!
//! 1. Allocate the tables statically: scheduling slots and channels for
//!    `kerncore`, the parallel [`crate::Actor`] records, and one
//!    [`crate::CpuContext`] per CPU, then assemble the [`Kernel`].
//! 2. [`Kernel::set_stack`] for every priority level that will host
//!    actors, and [`Kernel::init_cpu`] to install the idle region view.
//! 3. Create channels' storage and the actors:
//!    [`Kernel::actor_init`] with each task descriptor (and
//!    [`Kernel::actor_allow`] for any extra grant),
//!    [`Kernel::privileged_init`] for kernel-context actors.
//! 4. Hand control to the port: [`start_kernel`] on bare metal, or the
//!    simulation driver in [`crate::arch`] on a host.
//!
//! Nothing runs during steps 1–3; actors only become live when the port
//! starts delivering their vectors.

#[allow(unused_imports)]
use crate::kernel::Kernel;

/// The bare-metal kernel entry point: publishes the kernel to the
/// interrupt handlers, drops the boot mask, and parks the CPU in the
/// protected idle loop. Actors take it from here.
///
/// # Safety
///
/// Must be called exactly once per CPU, after the boot sequence above is
/// complete, with interrupts still masked from reset. `kernel` must
/// never be touched by thread-mode code again.
#[cfg(target_os = "none")]
pub unsafe fn start_kernel(kernel: &'static mut Kernel<'static>) -> ! {
    crate::arch::install(kernel);
    crate::arch::start_idle()
}

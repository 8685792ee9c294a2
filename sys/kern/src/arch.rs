// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here
//! in the `arch` module, magically tailored for the current target.
//!
//! Every port module defines the same set of names:
//!
//! - `Frame`/`FramePtr` and `FRAME_SIZE`: the synthetic exception frame,
//!   `frame_alloc`, `frame_set_arg`;
//! - `Region` (with `Region::DISABLED`) and `region_init`,
//!   `apply_regions`, `update_region`: protection-unit programming;
//! - `set_intr_level`, `interrupt_request`, `cpu_this`: the priority
//!   mask, vector raising (local or via doorbell), and CPU identity;
//! - `install`, plus the port's way of entering the dispatch loop.
//!
//! On bare-metal ARM this drives the real NVIC/MPU. Everywhere else we
//! compile the deterministic host simulation, which the test suite and
//! the demo glue use as their "hardware".

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "none", target_arch = "arm"))] {
        pub mod arm_m;
        pub use arm_m::*;
    } else if #[cfg(target_os = "none")] {
        compile_error!("support for this architecture not implemented");
    } else {
        pub mod host;
        pub use host::*;
    }
}

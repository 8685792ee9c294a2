// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-actor protection state.
//!
//! An [`Actor`] is the protection layer's record of one usermode task:
//! where its code lives (which doubles as its entry point), the hardware
//! region set installed whenever it runs, and the small amount of state
//! that survives between activations — the restart request and the size
//! of the currently bound message.
//!
//! Scheduling state for the same task lives in the `kerncore` table under
//! the same index; the two records never move.

use abi::{FaultInfo, RegionAttributes, TaskDesc};

use crate::arch::{self, Region};

/// Fixed slots in an actor's region set. The hardware is reprogrammed
/// from this array in index order on every context switch, so the indices
/// are part of the port contract.
pub const REGION_FLASH: usize = 0;
pub const REGION_SRAM: usize = 1;
pub const REGION_STACK: usize = 2;
pub const REGION_MSG: usize = 3;
pub const REGION_USER: usize = 4;

/// Number of region slots per actor: code, data, stack, the currently
/// bound message, and one optional boot-glue grant.
pub const REGIONS_PER_ACTOR: usize = 5;

/// Protection-layer state of one actor.
#[derive(Debug)]
pub struct Actor {
    /// Usermode entry point; the base of the flash region.
    entry: usize,
    /// Hardware region set, kept ready to load. The message slot is
    /// rewritten on every bind/unbind; the rest changes only at init.
    regions: [Region; REGIONS_PER_ACTOR],
    /// Tells the next frame we build to carry the restart marker, so the
    /// usermode trampoline re-initializes data/bss.
    restart_req: bool,
    /// Size of the currently bound message; `None` while the message
    /// region is disabled.
    bound_size: Option<usize>,
    /// Most recent fault, for the policy hook and debuggers.
    last_fault: Option<FaultInfo>,
}

impl Actor {
    /// Creates an empty record; [`Actor::configure`] must run before the
    /// actor is first activated.
    pub const fn new() -> Self {
        Actor {
            entry: 0,
            regions: [Region::DISABLED; REGIONS_PER_ACTOR],
            restart_req: true,
            bound_size: None,
            last_fault: None,
        }
    }

    /// Fills in the static part of the region set from the actor's task
    /// descriptor and its priority level's stack.
    ///
    /// Region shape constraints (power-of-two, natural alignment) are
    /// enforced by the port's `region_init`, because what is expressible
    /// is the protection unit's call; a hardware port will refuse a
    /// malformed descriptor table here.
    pub(crate) fn configure(
        &mut self,
        desc: &TaskDesc,
        stack_base: usize,
        stack_size: usize,
    ) {
        self.entry = desc.flash_base;
        self.restart_req = true;
        self.bound_size = None;
        self.regions[REGION_FLASH] = arch::region_init(
            desc.flash_base,
            desc.flash_size,
            RegionAttributes::RO,
        );
        self.regions[REGION_SRAM] = arch::region_init(
            desc.sram_base,
            desc.sram_size,
            RegionAttributes::RW,
        );
        self.regions[REGION_STACK] =
            arch::region_init(stack_base, stack_size, RegionAttributes::RW);
        self.regions[REGION_MSG] = Region::DISABLED;
        self.regions[REGION_USER] = Region::DISABLED;
    }

    /// Grants one extra region (peripheral or shared memory) on top of
    /// the standard triple. Boot-glue only.
    ///
    /// # Panics
    ///
    /// If the region is not a naturally aligned power of two.
    pub(crate) fn allow(
        &mut self,
        base: usize,
        size: usize,
        attributes: RegionAttributes,
    ) {
        uassert!(abi::region_shape_ok(base, size));
        self.regions[REGION_USER] = arch::region_init(base, size, attributes);
    }

    /// Enables the message region over `[addr, addr + size)` and records
    /// the exposed size.
    pub(crate) fn map_message(&mut self, addr: usize, size: usize) {
        self.regions[REGION_MSG] =
            arch::region_init(addr, size, RegionAttributes::RW);
        self.bound_size = Some(size);
    }

    /// Disables the message region.
    pub(crate) fn unmap_message(&mut self) {
        self.regions[REGION_MSG] = Region::DISABLED;
        self.bound_size = None;
    }

    pub(crate) fn set_restart_req(&mut self) {
        self.restart_req = true;
    }

    pub(crate) fn take_restart_req(&mut self) -> bool {
        core::mem::replace(&mut self.restart_req, false)
    }

    pub(crate) fn record_fault(&mut self, fault: FaultInfo) {
        self.last_fault = Some(fault);
    }

    pub fn entry(&self) -> usize {
        self.entry
    }

    /// The region set as it would be loaded into the hardware.
    pub fn regions(&self) -> &[Region; REGIONS_PER_ACTOR] {
        &self.regions
    }

    /// Exposed size of the bound message, if one is mapped.
    pub fn bound_size(&self) -> Option<usize> {
        self.bound_size
    }

    /// Whether the next activation will carry the restart marker.
    pub fn restart_pending(&self) -> bool {
        self.restart_req
    }

    /// Most recent fault taken by this actor, if any.
    pub fn last_fault(&self) -> Option<FaultInfo> {
        self.last_fault
    }
}

impl Default for Actor {
    fn default() -> Self {
        Self::new()
    }
}

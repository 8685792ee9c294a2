// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Actor fault handling and the boot-glue policy hooks.
//!
//! A fault never propagates: whatever the actor did — wild access, bad
//! instruction, unknown syscall — the kernel releases the actor's message
//! with the poison mark set, consults the policy hook, and resumes the
//! preempted predecessor. The system invariants hold again by the time
//! [`Kernel::actor_exception`] returns; the only trace of the crash is
//! the poisoned message and the recorded fault.
//!
//! Two policies ship with the kernel. [`restart_policy`] (the default)
//! re-enqueues the actor immediately with the restart marker set, so its
//! next activation re-initializes data/bss and begins from the entry
//! point. [`halt_policy`] drops the actor until something privileged
//! calls [`Kernel::actor_restart`] — the shape a supervisor wants.
//!
//! The channel validation hook lives here too, because it is the same
//! kind of boot-glue policy: it turns the small-integer handles actors
//! pass in syscalls into channel ids, and may refuse handles per actor or
//! per direction. Refusal is silent by design. A correct caller never
//! triggers it, and a fuzzed or fault-injected caller must not be able to
//! destabilize anything by trying; a refused operation is
//! indistinguishable from losing a benign race.

use abi::FaultInfo;
use kerncore::{ActorId, ChanId};

use crate::arch::FramePtr;
use crate::kernel::Kernel;

/// Boot-glue policy hooks. Plain function pointers so the table can live
/// in flash and carries no state; anything stateful belongs in the
/// supervisor actor, not in the kernel.
#[derive(Copy, Clone)]
pub struct Hooks {
    /// Maps `(actor, handle, is_write)` to a channel. `None` makes the
    /// syscall a silent no-op.
    pub channel_validate:
        fn(&Kernel<'_>, ActorId, u32, bool) -> Option<ChanId>,
    /// Invoked after a faulted actor's message has been released. May
    /// re-enqueue the actor, or leave it dropped.
    pub actor_error: fn(&mut Kernel<'_>, ActorId),
}

impl Default for Hooks {
    fn default() -> Self {
        Hooks {
            channel_validate: validate_any,
            actor_error: restart_policy,
        }
    }
}

/// Default validation: any in-range handle names the channel with that
/// index, readable and writable by every actor.
pub fn validate_any(
    kernel: &Kernel<'_>,
    _actor: ActorId,
    handle: u32,
    _is_write: bool,
) -> Option<ChanId> {
    if (handle as usize) < kernel.runtime().chan_count() {
        Some(ChanId(handle as u16))
    } else {
        None
    }
}

/// Default fault policy: restart in place. The actor goes back on its
/// ready queue at once; the restart marker makes its next entry a clean
/// one.
pub fn restart_policy(kernel: &mut Kernel<'_>, id: ActorId) {
    kernel.actor_restart(id);
}

/// Alternative fault policy: leave the actor dropped. Nothing will run
/// it again until [`Kernel::actor_restart`] is called from privileged
/// code.
pub fn halt_policy(_kernel: &mut Kernel<'_>, _id: ActorId) {}

impl Kernel<'_> {
    /// Common exit for every actor fault: trap vectors, bus errors, and
    /// unknown syscall opcodes all end up here with the running actor
    /// identified. Releases the bound message as poisoned, applies the
    /// policy, and unwinds to the preempted predecessor.
    pub fn actor_exception(
        &mut self,
        cpu: usize,
        fault: FaultInfo,
    ) -> FramePtr {
        let me = match self.cpus[cpu].running() {
            Some(me) => me,
            // Faults taken outside an actor are kernel bugs.
            None => panic!(),
        };
        self.actors[me.index()].record_fault(fault);
        self.message_release(me, true);

        let hook = self.hooks.actor_error;
        hook(self, me);

        let frame = self.restore_prev(cpu);
        self.post_wakes();
        frame
    }

    /// Port entry for hardware fault vectors. Identical to an exception
    /// raised from syscall dispatch; this alias exists so ports read
    /// naturally.
    pub fn trap_handler(
        &mut self,
        cpu: usize,
        fault: FaultInfo,
    ) -> FramePtr {
        self.actor_exception(cpu, fault)
    }
}

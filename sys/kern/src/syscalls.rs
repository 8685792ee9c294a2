// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Syscall dispatch.
//!
//! A syscall arrives as a single word: operation in the top four bits,
//! argument in the rest. The split between the two kinds of call decides
//! what the port gets back:
//!
//! - *Synchronous* calls (`TryPop`, `Push`, `Free`) finish on the spot.
//!   The caller's frame gets its argument register patched with the
//!   current mailbox pointer (or null) and is returned unchanged, so the
//!   actor continues at the instruction after the trap.
//! - *Asynchronous* calls (`Delay`, `Subscribe`) suspend the caller. The
//!   actor's frame is abandoned — it will get a fresh one, and a fresh
//!   entry, when next scheduled — and the preempted predecessor's frame
//!   comes back instead.
//!
//! An out-of-range operation is not an error return; it is an actor
//! exception, same as a memory fault.
//!
//! Capability failures inside a call (bad channel handle, message type
//! mismatch) are deliberately silent: the operation degrades to a no-op
//! and the actor keeps its message and keeps running. See the fault
//! module for the reasoning.

use core::convert::TryFrom;

use abi::{syscall_split, FaultInfo, Sysnum};
use kerncore::ActorId;

use crate::actor::REGION_MSG;
use crate::arch::{self, FramePtr};
use crate::kernel::Kernel;
use crate::profiling;

impl Kernel<'_> {
    /// Syscall entry, called by the port with the trapped word and the
    /// caller's frame. Returns the frame to resume.
    pub fn svc_handler(
        &mut self,
        cpu: usize,
        word: u32,
        frame: FramePtr,
    ) -> FramePtr {
        profiling::event_syscall_enter(word);
        let me = match self.cpus[cpu].running() {
            Some(me) => me,
            // Only usermode can trap here, and usermode implies a
            // running actor.
            None => panic!(),
        };

        let (op, arg) = syscall_split(word);
        let next = match Sysnum::try_from(op) {
            Err(()) => self.actor_exception(cpu, FaultInfo::BadSyscall(op)),
            Ok(sysnum) => {
                match sysnum {
                    Sysnum::Delay => self.sys_delay(me, arg),
                    Sysnum::Subscribe => self.sys_subscribe(me, arg),
                    Sysnum::TryPop => self.sys_try_pop(me, arg),
                    Sysnum::Push => self.sys_push(me, arg),
                    Sysnum::Free => self.sys_free(me),
                }
                if sysnum.is_synchronous() {
                    arch::frame_set_arg(frame, self.mailbox_addr(me));
                    frame
                } else {
                    self.restore_prev(cpu)
                }
            }
        };

        self.post_wakes();
        profiling::event_syscall_exit();
        next
    }

    /// DELAY: park the caller on the timer, or straight back onto the
    /// ready queue for zero ticks. The held message, if any, stays held.
    fn sys_delay(&mut self, me: ActorId, ticks: u32) {
        self.rt.timeout(me, ticks);
    }

    /// SUBSCRIBE: trade the current message for the next one out of
    /// `chan`. Allocation from the pool side is tried first, then the
    /// queue; if both come up empty the actor stays parked on the
    /// channel. An invalid handle degrades to a bare reschedule so the
    /// actor still gets its next activation.
    fn sys_subscribe(&mut self, me: ActorId, handle: u32) {
        let validate = self.hooks.channel_validate;
        let Some(chan) = validate(self, me, handle, false) else {
            self.rt.activate(me);
            return;
        };
        self.message_release(me, false);

        let mut msg = self.rt.message_alloc(chan);
        if msg.is_none() {
            msg = self.rt.queue_pop(chan, Some(me));
        }
        if let Some(m) = msg {
            self.rt.deliver(me, m);
            self.rt.activate(me);
        }
    }

    /// TRY_POP: like SUBSCRIBE but non-blocking and synchronous; the
    /// caller observes its new mailbox (or null) in the return register.
    fn sys_try_pop(&mut self, me: ActorId, handle: u32) {
        let validate = self.hooks.channel_validate;
        let Some(chan) = validate(self, me, handle, false) else {
            return;
        };
        self.message_release(me, false);
        if let Some(m) = self.rt.message_alloc(chan) {
            self.rt.deliver(me, m);
            self.message_bind(me);
        }
        arch::update_region(
            REGION_MSG,
            &self.actors[me.index()].regions()[REGION_MSG],
        );
    }

    /// PUSH: move the held message into `chan` if the types agree.
    fn sys_push(&mut self, me: ActorId, handle: u32) {
        let validate = self.hooks.channel_validate;
        let Some(chan) = validate(self, me, handle, true) else {
            return;
        };
        self.channel_push(me, chan);
        arch::update_region(
            REGION_MSG,
            &self.actors[me.index()].regions()[REGION_MSG],
        );
    }

    /// FREE: give the held message back to its pool.
    fn sys_free(&mut self, me: ActorId) {
        self.message_release(me, false);
        arch::update_region(
            REGION_MSG,
            &self.actors[me.index()].regions()[REGION_MSG],
        );
    }
}

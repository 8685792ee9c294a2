// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel object and the interrupt-entry path.
//!
//! [`Kernel`] ties the generic runtime to the protection layer: the
//! parallel actor table, the per-CPU execution contexts, and the policy
//! hooks. Every port entry point — interrupt, syscall, trap, tick — takes
//! `&mut Kernel` and runs under the port's critical section; there is no
//! interior locking.
//!
//! # Execution model
//!
//! Actors run to completion or suspension, stacked strictly by priority.
//! When the interrupt handler launches an actor at level `p`, it records
//! whatever was running before (frame and actor, possibly the idle
//! context) in `preempted[p]`. Exactly one entry per level can be live,
//! because a second actor at `p` cannot start until the first leaves — the
//! interrupt controller keeps level `p` masked while it runs. This is also
//! why one stack per *priority* suffices: the frame we build for the next
//! actor at `p` can only be built after the previous one's frame is dead.
//!
//! Suspension (an asynchronous syscall) or completion pops that entry:
//! the predecessor's region set and interrupt mask are reinstated and its
//! frame returned to the port, which resumes it as if nothing happened.

use abi::TaskDesc;
use kerncore::runtime::Runtime;
use kerncore::{ActorId, ActorKind, VECTOR_COUNT};

use crate::actor::{Actor, REGIONS_PER_ACTOR, REGION_FLASH, REGION_STACK};
use crate::arch::{self, FramePtr, Region};
use crate::fault::Hooks;
use crate::profiling;
use crate::umem;

/// Placement of the stack shared by all actors of one priority level on
/// one CPU.
#[derive(Copy, Clone, Debug, Default)]
pub struct StackDesc {
    pub base: usize,
    pub size: usize,
}

/// One preemption-stack slot: what was displaced when an actor at this
/// level started.
#[derive(Copy, Clone, Debug)]
struct Preempted {
    frame: FramePtr,
    actor: Option<ActorId>,
}

impl Preempted {
    const EMPTY: Self = Preempted {
        frame: FramePtr::NULL,
        actor: None,
    };
}

/// Per-CPU execution state.
pub struct CpuContext {
    /// The protected actor currently in usermode on this CPU, or `None`
    /// in idle or privileged context.
    running: Option<ActorId>,
    /// Region set for the idle view: the idle loop's code and a stack
    /// just big enough for one saved context. Installed whenever the
    /// preemption stack runs dry.
    idle_regions: [Region; REGIONS_PER_ACTOR],
    /// One displaced-context slot per priority level.
    preempted: [Preempted; VECTOR_COUNT],
    /// One stack per priority level; see the module docs for why that is
    /// enough.
    stacks: [StackDesc; VECTOR_COUNT],
}

impl CpuContext {
    pub const fn new() -> Self {
        CpuContext {
            running: None,
            idle_regions: [Region::DISABLED; REGIONS_PER_ACTOR],
            preempted: [Preempted::EMPTY; VECTOR_COUNT],
            stacks: [StackDesc { base: 0, size: 0 }; VECTOR_COUNT],
        }
    }

    /// The actor currently in usermode on this CPU.
    pub fn running(&self) -> Option<ActorId> {
        self.running
    }

    /// True when no displaced context is recorded at any level — the
    /// state the CPU must be in whenever it idles.
    pub fn preemption_stack_empty(&self) -> bool {
        self.preempted
            .iter()
            .all(|p| p.actor.is_none() && p.frame == FramePtr::NULL)
    }

    pub fn stack(&self, vect: u8) -> StackDesc {
        self.stacks[usize::from(vect)]
    }
}

impl Default for CpuContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel: runtime, protection records, per-CPU contexts, policy.
pub struct Kernel<'k> {
    pub(crate) rt: Runtime<'k>,
    pub(crate) actors: &'k mut [Actor],
    pub(crate) cpus: &'k mut [CpuContext],
    pub(crate) hooks: Hooks,
}

impl<'k> Kernel<'k> {
    /// Assembles the kernel from boot-glue-owned tables. The actor table
    /// must parallel the runtime's scheduling table index for index.
    pub fn new(
        rt: Runtime<'k>,
        actors: &'k mut [Actor],
        cpus: &'k mut [CpuContext],
        hooks: Hooks,
    ) -> Self {
        uassert!(actors.len() == rt.actor_count());
        uassert!(!cpus.is_empty());
        Kernel {
            rt,
            actors,
            cpus,
            hooks,
        }
    }

    /// Read access to the runtime, mostly for instrumentation and tests.
    pub fn runtime(&self) -> &Runtime<'k> {
        &self.rt
    }

    pub fn actor(&self, id: ActorId) -> &Actor {
        &self.actors[id.index()]
    }

    pub fn cpu(&self, cpu: usize) -> &CpuContext {
        &self.cpus[cpu]
    }

    /// Assigns the stack shared by all priority-`vect` actors on `cpu`.
    /// Must happen before any actor at that level is created.
    ///
    /// # Panics
    ///
    /// If the size is not a power of two or cannot hold a single saved
    /// context.
    pub fn set_stack(&mut self, cpu: usize, vect: u8, stack: StackDesc) {
        uassert!(abi::region_shape_ok(stack.base, stack.size));
        uassert!(stack.size >= arch::FRAME_SIZE);
        uassert!(vect > abi::Priority::TICK.0);
        self.cpus[cpu].stacks[usize::from(vect)] = stack;
    }

    /// Builds the idle region view for `cpu` (idle code plus a minimal
    /// stack) and installs it, so that even the idle loop runs under
    /// protection. Called once per CPU during boot, on that CPU.
    pub fn init_cpu(
        &mut self,
        cpu: usize,
        idle_code: StackDesc,
        idle_stack: StackDesc,
    ) {
        let ctx = &mut self.cpus[cpu];
        ctx.idle_regions[REGION_FLASH] = arch::region_init(
            idle_code.base,
            idle_code.size,
            abi::RegionAttributes::RO,
        );
        ctx.idle_regions[REGION_STACK] = arch::region_init(
            idle_stack.base,
            idle_stack.size,
            abi::RegionAttributes::RW,
        );
        arch::apply_regions(&ctx.idle_regions);
        arch::set_intr_level(abi::Priority::TICK.0);
    }

    /// Completes a protected actor's setup from its task descriptor and
    /// enqueues it for its first activation. The scheduler will get to it
    /// once its vector is unmasked; nothing runs from here.
    pub fn actor_init(&mut self, id: ActorId, desc: &TaskDesc) {
        uassert!(matches!(self.rt.kind(id), ActorKind::Protected));
        let vect = self.rt.vect(id);
        uassert!(vect >= abi::Priority::FIRST_ACTOR.0);
        let stack = self.cpus[usize::from(self.rt.cpu(id))].stack(vect);
        uassert!(stack.size != 0);
        self.actors[id.index()].configure(desc, stack.base, stack.size);
        self.rt.activate(id);
        self.post_wakes();
    }

    /// Grants `id` one extra hardware region. Boot-glue only; takes
    /// effect the next time the actor is dispatched.
    pub fn actor_allow(
        &mut self,
        id: ActorId,
        base: usize,
        size: usize,
        attributes: abi::RegionAttributes,
    ) {
        self.actors[id.index()].allow(base, size, attributes);
    }

    /// Enqueues a privileged actor for execution. Its callback will run
    /// in kernel context when its vector is serviced.
    pub fn privileged_init(&mut self, id: ActorId) {
        uassert!(matches!(self.rt.kind(id), ActorKind::Privileged(_)));
        self.rt.activate(id);
        self.post_wakes();
    }

    /// Forcibly restarts an actor: the next activation re-enters its
    /// entry point with the restart marker set. Used by the halt policy's
    /// supervisor to revive a dropped actor, and usable from privileged
    /// context generally.
    pub fn actor_restart(&mut self, id: ActorId) {
        self.actors[id.index()].set_restart_req();
        self.rt.cancel_wait(id);
        self.rt.activate(id);
        self.post_wakes();
    }

    /// Kernel tick entry, called from the platform timer interrupt.
    /// Expired sleepers are activated before this returns, so their
    /// vectors are pending ahead of any work the current tick's actors
    /// schedule.
    pub fn tick(&mut self, _cpu: usize) {
        profiling::event_timer_isr_enter();
        self.rt.tick();
        self.post_wakes();
        profiling::event_timer_isr_exit();
    }

    /// Current kernel time in ticks.
    pub fn now(&self) -> u64 {
        self.rt.now()
    }

    /// Interrupt entry for vector `vect` on `cpu`. Services ready actors
    /// at that level: privileged ones run to completion in place; the
    /// first protected one displaces `prev_frame` and becomes the running
    /// actor, and its fresh frame is returned for the port to resume.
    /// Returns `prev_frame` unchanged if the level had no protected work
    /// (a spurious wakeup, or privileged callbacks only).
    pub fn intr_handler(
        &mut self,
        cpu: usize,
        vect: u8,
        prev_frame: FramePtr,
    ) -> FramePtr {
        profiling::event_isr_enter();
        let mut frame = prev_frame;

        while let Some((next, last)) = self.rt.pop_head(cpu as u8, vect) {
            match self.rt.kind(next) {
                ActorKind::Privileged(func) => {
                    // Kernel-context callback; keep draining the level.
                    func(&mut self.rt, next);
                }
                ActorKind::Protected => {
                    let level = usize::from(vect);
                    let ctx = &mut self.cpus[cpu];
                    uassert!(ctx.preempted[level].frame == FramePtr::NULL);
                    ctx.preempted[level] = Preempted {
                        frame,
                        actor: ctx.running,
                    };
                    ctx.running = Some(next);
                    frame = self.frame_create(cpu, next);
                    arch::set_intr_level(vect);
                    self.message_bind(next);
                    arch::apply_regions(self.actors[next.index()].regions());
                    arch::frame_set_arg(frame, self.mailbox_addr(next));
                    profiling::event_context_switch(next.index());

                    if !last {
                        // More work at this level; re-assert so it runs
                        // as soon as this actor leaves.
                        arch::interrupt_request(self.rt.cpu(next), vect);
                    }
                    break;
                }
            }
        }

        self.post_wakes();
        profiling::event_isr_exit();
        frame
    }

    /// Builds a fresh usermode frame for `id` at the top of its
    /// priority's stack, consuming the restart request if one is set.
    fn frame_create(&mut self, cpu: usize, id: ActorId) -> FramePtr {
        let stack = self.cpus[cpu].stack(self.rt.vect(id));
        uassert!(stack.base != 0);
        let restart = self.actors[id.index()].take_restart_req();
        arch::frame_alloc(
            stack.base + stack.size,
            self.actors[id.index()].entry(),
            restart,
        )
    }

    /// Pops the preemption-stack slot of the departing running actor and
    /// reinstates its predecessor: region set, interrupt mask, frame. A
    /// `None` predecessor means the CPU drops back to the idle view.
    pub(crate) fn restore_prev(&mut self, cpu: usize) -> FramePtr {
        let ctx = &mut self.cpus[cpu];
        let me = match ctx.running {
            Some(me) => me,
            // Only a running protected actor can leave.
            None => panic!(),
        };
        let level = usize::from(self.rt.vect(me));
        let slot = core::mem::replace(
            &mut ctx.preempted[level],
            Preempted::EMPTY,
        );
        ctx.running = slot.actor;

        match slot.actor {
            None => {
                arch::set_intr_level(abi::Priority::TRAP.0);
                arch::apply_regions(&ctx.idle_regions);
            }
            Some(prev) => {
                arch::set_intr_level(self.rt.vect(prev));
                arch::apply_regions(self.actors[prev.index()].regions());
            }
        }
        profiling::event_context_switch(match slot.actor {
            Some(prev) => prev.index(),
            None => usize::MAX,
        });
        slot.frame
    }

    /// Address passed to the actor as its sole argument: the bound
    /// message, or null.
    pub(crate) fn mailbox_addr(&self, id: ActorId) -> usize {
        match self.rt.mailbox(id) {
            Some(m) => self.rt.msg_addr(m),
            None => 0,
        }
    }

    /// Exposes a freshly delivered message to its new owner: records the
    /// exposed size in the header and enables the message region. No-op
    /// if nothing is delivered or the message is already bound.
    pub(crate) fn message_bind(&mut self, id: ActorId) {
        let Some(m) = self.rt.mailbox(id) else {
            return;
        };
        if self.actors[id.index()].bound_size().is_some() {
            return;
        }
        let addr = self.rt.msg_addr(m);
        let size = self.rt.msg_size(m);
        // Safety: `addr..addr + size` is pool storage owned by the
        // kernel, and the message was just taken off a queue, so no actor
        // has it mapped.
        unsafe {
            umem::write_msg_size(addr, size);
        }
        self.actors[id.index()].map_message(addr, size);
    }

    /// Hides the bound message from its (former) owner again. The caller
    /// is responsible for pushing the returned handle somewhere legal.
    fn message_unbind(&mut self, id: ActorId) {
        let Some(m) = self.rt.mailbox(id) else {
            return;
        };
        if self.actors[id.index()].bound_size().is_some() {
            let addr = self.rt.msg_addr(m);
            // Safety: same storage argument as in `message_bind`; the
            // region is being torn down.
            unsafe {
                umem::write_msg_size(addr, 0);
            }
            self.actors[id.index()].unmap_message();
        }
    }

    /// Releases `id`'s current message, if any: unbind, mark the poison
    /// word, and hand the message back to its parent pool (which may
    /// forward it straight to a waiter). Idempotent when no message is
    /// held.
    pub(crate) fn message_release(&mut self, id: ActorId, poisoned: bool) {
        self.message_unbind(id);
        let Some(m) = self.rt.take_mailbox(id) else {
            return;
        };
        let addr = self.rt.msg_addr(m);
        // Safety: unbound above, so the owning actor no longer has the
        // region mapped; the storage is kernel-owned.
        unsafe {
            umem::write_msg_poisoned(addr, poisoned);
        }
        self.rt.message_free(m);
    }

    /// Moves `id`'s message into `dst` if the type tags agree; on
    /// mismatch the message simply stays with the sender. Either way the
    /// channel never sees an ill-typed message.
    pub(crate) fn channel_push(
        &mut self,
        id: ActorId,
        dst: kerncore::ChanId,
    ) {
        let Some(m) = self.rt.mailbox(id) else {
            return;
        };
        if self.rt.chan_type(m.chan) != self.rt.chan_type(dst) {
            return;
        }
        self.message_unbind(id);
        let m = match self.rt.take_mailbox(id) {
            Some(m) => m,
            None => panic!(),
        };
        let addr = self.rt.msg_addr(m);
        // Safety: unbound above; kernel-owned storage.
        unsafe {
            umem::write_msg_poisoned(addr, false);
        }
        self.rt.queue_push(dst, m);
    }

    /// Forwards accumulated vector requests to the interrupt layer.
    /// Every public entry point ends with this, so an actor readied
    /// during the call has its vector pending before control leaves the
    /// kernel.
    pub(crate) fn post_wakes(&mut self) {
        self.rt.drain_wakes(|req| {
            arch::interrupt_request(req.cpu, req.vect);
        });
    }
}

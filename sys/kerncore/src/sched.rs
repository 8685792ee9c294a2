// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduler structures: per-actor scheduling state, the ready FIFOs, and
//! the timer ring.
//!
//! Two flavors of runnable entity share the ready queues. *Privileged*
//! actors carry a kernel-context callback and are executed in place by the
//! interrupt handler. *Protected* actors carry no callback; the protection
//! layer in `kern` resumes them in usermode. The scheduler does not care
//! which is which beyond storing the distinction.
//!
//! Ready queues are intrusive singly-linked FIFOs threaded through the
//! `next` field of [`SchedSlot`], one per priority, with a bitmap of
//! non-empty priorities so picking the top level is a single
//! count-leading-zeros. An actor is on at most one list at a time — ready
//! queue or a channel wait queue — which is what lets one link field
//! serve both.

use crate::runtime::Runtime;
use crate::{ActorId, ChanId, MsgRef, TIMERQ_MAX, VECTOR_COUNT};

/// Kernel-context callback of a privileged actor. Runs on the kernel
/// stack with the runtime borrowed; whatever it activates is dispatched
/// after it returns.
pub type PrivFn = fn(&mut Runtime<'_>, ActorId);

/// What happens when this actor is popped from a ready queue.
#[derive(Copy, Clone, Debug)]
pub enum ActorKind {
    /// Call this function in kernel context.
    Privileged(PrivFn),
    /// Hand the actor to the protection layer for usermode execution.
    Protected,
}

/// Per-actor scheduling state. The protection layer keeps its own record
/// per actor; the two tables are indexed by the same [`ActorId`].
#[derive(Debug)]
pub struct SchedSlot {
    kind: ActorKind,
    vect: u8,
    cpu: u8,
    mailbox: Option<MsgRef>,
    /// Intrusive link for whichever list the actor currently sits on.
    next: Option<ActorId>,
    /// Channel whose wait queue the actor sits on, if suspended there.
    waiting_on: Option<ChanId>,
    /// True while the actor sits on a ready FIFO. Guards against the
    /// corruption a double activation would cause.
    queued: bool,
}

impl SchedSlot {
    /// Creates scheduling state for an actor serviced by `vect` on `cpu`.
    ///
    /// # Panics
    ///
    /// If `vect` does not fit the controller.
    pub fn new(kind: ActorKind, vect: u8, cpu: u8) -> Self {
        assert!(usize::from(vect) < VECTOR_COUNT);
        SchedSlot {
            kind,
            vect,
            cpu,
            mailbox: None,
            next: None,
            waiting_on: None,
            queued: false,
        }
    }

    /// True while the actor sits on a ready FIFO.
    pub fn is_queued(&self) -> bool {
        self.queued
    }

    pub fn kind(&self) -> &ActorKind {
        &self.kind
    }

    /// Interrupt vector, and therefore priority, of this actor.
    pub fn vect(&self) -> u8 {
        self.vect
    }

    pub fn cpu(&self) -> u8 {
        self.cpu
    }

    /// The message currently delivered to this actor, if any.
    pub fn mailbox(&self) -> Option<MsgRef> {
        self.mailbox
    }

    pub(crate) fn set_mailbox(&mut self, m: Option<MsgRef>) {
        self.mailbox = m;
    }

    pub(crate) fn next(&self) -> Option<ActorId> {
        self.next
    }

    pub(crate) fn take_next(&mut self) -> Option<ActorId> {
        self.next.take()
    }

    pub(crate) fn set_next(&mut self, n: Option<ActorId>) {
        self.next = n;
    }

    pub(crate) fn waiting_on(&self) -> Option<ChanId> {
        self.waiting_on
    }

    pub(crate) fn set_waiting_on(&mut self, c: Option<ChanId>) {
        self.waiting_on = c;
    }
}

/// The ready FIFOs: one intrusive list per priority plus the occupancy
/// bitmap.
#[derive(Debug)]
pub(crate) struct RunQueue {
    heads: [Option<ActorId>; VECTOR_COUNT],
    tails: [Option<ActorId>; VECTOR_COUNT],
    ready_map: u32,
}

impl RunQueue {
    pub(crate) const fn new() -> Self {
        RunQueue {
            heads: [None; VECTOR_COUNT],
            tails: [None; VECTOR_COUNT],
            ready_map: 0,
        }
    }

    /// Links `id` at the tail of its priority's FIFO. Returns `true` if
    /// the priority was previously empty, i.e. its vector needs to be
    /// requested.
    pub(crate) fn push(
        &mut self,
        slots: &mut [SchedSlot],
        id: ActorId,
    ) -> bool {
        let vect = usize::from(slots[id.index()].vect);
        assert!(!slots[id.index()].queued);
        slots[id.index()].queued = true;
        slots[id.index()].next = None;

        let newly_ready = match self.tails[vect] {
            Some(tail) => {
                slots[tail.index()].next = Some(id);
                false
            }
            None => {
                self.heads[vect] = Some(id);
                true
            }
        };
        self.tails[vect] = Some(id);
        self.ready_map |= 1 << vect;
        newly_ready
    }

    /// Dequeues the head actor at `vect`. The boolean is `true` iff the
    /// queue is now empty, which tells the interrupt handler whether to
    /// re-assert the vector before resuming usermode.
    pub(crate) fn pop(
        &mut self,
        slots: &mut [SchedSlot],
        vect: u8,
    ) -> Option<(ActorId, bool)> {
        let vect = usize::from(vect);
        let head = self.heads[vect]?;
        let next = slots[head.index()].take_next();
        slots[head.index()].queued = false;
        self.heads[vect] = next;
        if next.is_none() {
            self.tails[vect] = None;
            self.ready_map &= !(1 << vect);
        }
        Some((head, next.is_none()))
    }

    /// Highest non-empty priority, if any. Only used for assertions and
    /// idle detection; dispatch itself is driven by the interrupt
    /// controller.
    pub(crate) fn top(&self) -> Option<u8> {
        if self.ready_map == 0 {
            None
        } else {
            Some((31 - self.ready_map.leading_zeros()) as u8)
        }
    }
}

/// A bounded ring of sleeping actors. Expiry scans the whole ring; with
/// `TIMERQ_MAX` slots this is cheaper than keeping it sorted, and the
/// kernel tick is the only scanner.
#[derive(Debug)]
pub(crate) struct TimerRing {
    slots: [Option<TimerEntry>; TIMERQ_MAX],
    now: u64,
}

#[derive(Copy, Clone, Debug)]
struct TimerEntry {
    actor: ActorId,
    deadline: u64,
}

impl TimerRing {
    pub(crate) const fn new() -> Self {
        TimerRing {
            slots: [None; TIMERQ_MAX],
            now: 0,
        }
    }

    pub(crate) fn now(&self) -> u64 {
        self.now
    }

    /// Parks `actor` until `ticks` ticks from now. Returns `false` if the
    /// ring is full, which the caller treats as a fatal configuration
    /// error.
    pub(crate) fn insert(&mut self, actor: ActorId, ticks: u32) -> bool {
        let deadline = self.now + u64::from(ticks);
        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(TimerEntry { actor, deadline });
                return true;
            }
        }
        false
    }

    /// Advances time by one tick and hands every expired actor to `wake`.
    pub(crate) fn advance(&mut self, mut wake: impl FnMut(ActorId)) {
        self.now += 1;
        for slot in self.slots.iter_mut() {
            if let Some(e) = slot {
                if e.deadline <= self.now {
                    let actor = e.actor;
                    *slot = None;
                    wake(actor);
                }
            }
        }
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The runtime proper: actors, channels, and the operations connecting
//! them.
//!
//! [`Runtime`] owns the scheduling table and the channel table and is the
//! only place that moves a message between its three legal homes — parent
//! pool queue, some channel's queue, an actor's mailbox. Every entry point
//! of the protection layer funnels through here, always under the
//! platform's critical section, so none of this state needs interior
//! mutability.
//!
//! Two details are worth calling out:
//!
//! - *Direct hand-off.* Pushing into a channel with a waiting actor (or
//!   freeing a message back to a pool someone is waiting on) moves the
//!   message straight into the waiter's mailbox and schedules the waiter.
//!   The message is never observable in the queue in between, which is
//!   what keeps ownership single.
//! - *Deferred vector requests.* Operations that make an actor runnable
//!   record the needed interrupt vector in a per-CPU wake bitmap instead
//!   of poking the controller mid-update. The platform layer drains the
//!   bitmap with [`Runtime::drain_wakes`] before leaving the kernel, which
//!   also gives cross-CPU wakeups a single place to become doorbell IPIs.

use crate::msg::{Pool, Queue};
use crate::sched::{RunQueue, TimerRing};
use crate::{
    ActorId, ActorKind, ChanId, Channel, IrqRequest, MsgRef, SchedSlot,
    CPU_MAX, TIMERQ_MAX,
};

pub struct Runtime<'k> {
    slots: &'k mut [SchedSlot],
    channels: &'k mut [Channel<'k>],
    /// Ready FIFOs are bound per CPU: an actor is only ever popped by
    /// the CPU it is assigned to. Any CPU may *push* (under the global
    /// critical section), which is how cross-CPU wakeups happen.
    runqs: [RunQueue; CPU_MAX],
    timers: TimerRing,
    wake_map: [u32; CPU_MAX],
}

impl<'k> Runtime<'k> {
    /// Assembles a runtime over boot-glue-owned tables. The tables live
    /// for the life of the system; nothing is ever added or removed.
    pub fn new(
        slots: &'k mut [SchedSlot],
        channels: &'k mut [Channel<'k>],
    ) -> Self {
        const EMPTY_QUEUE: RunQueue = RunQueue::new();
        Runtime {
            slots,
            channels,
            runqs: [EMPTY_QUEUE; CPU_MAX],
            timers: TimerRing::new(),
            wake_map: [0; CPU_MAX],
        }
    }

    /// Current kernel time in ticks.
    pub fn now(&self) -> u64 {
        self.timers.now()
    }

    pub fn actor_count(&self) -> usize {
        self.slots.len()
    }

    pub fn chan_count(&self) -> usize {
        self.channels.len()
    }

    pub fn kind(&self, id: ActorId) -> ActorKind {
        *self.slots[id.index()].kind()
    }

    pub fn vect(&self, id: ActorId) -> u8 {
        self.slots[id.index()].vect()
    }

    pub fn cpu(&self, id: ActorId) -> u8 {
        self.slots[id.index()].cpu()
    }

    /// The message currently delivered to `id`, if any.
    pub fn mailbox(&self, id: ActorId) -> Option<MsgRef> {
        self.slots[id.index()].mailbox()
    }

    /// Removes and returns `id`'s delivered message, transferring
    /// ownership to the caller (who must re-home it promptly).
    pub fn take_mailbox(&mut self, id: ActorId) -> Option<MsgRef> {
        let m = self.slots[id.index()].mailbox();
        self.slots[id.index()].set_mailbox(None);
        m
    }

    /// Places `m` into `id`'s mailbox. The caller has just obtained `m`
    /// from a pool or queue and the actor must not already hold one.
    pub fn deliver(&mut self, id: ActorId, m: MsgRef) {
        assert!(self.slots[id.index()].mailbox().is_none());
        self.slots[id.index()].set_mailbox(Some(m));
    }

    /// Message type tag of a channel.
    pub fn chan_type(&self, chan: ChanId) -> u16 {
        self.channels[chan.index()].msg_type()
    }

    /// Address of a message's first byte. The protection layer uses this
    /// to place the message region and the header words.
    pub fn msg_addr(&self, m: MsgRef) -> usize {
        self.pool_ref(m).addr_of(m.slot)
    }

    /// Full size in bytes of a message, i.e. its pool's block size.
    pub fn msg_size(&self, m: MsgRef) -> usize {
        self.pool_ref(m).block_size()
    }

    /// Highest priority with a ready actor on `cpu`, if any.
    pub fn top_ready(&self, cpu: u8) -> Option<u8> {
        self.runqs[usize::from(cpu)].top()
    }

    /// Makes `id` runnable at the tail of its priority's FIFO. If the
    /// priority was idle, records a vector request for the actor's CPU.
    ///
    /// # Panics
    ///
    /// If the actor is already ready, or currently parked on a wait
    /// queue; waiters must be woken through their channel (or
    /// [`Runtime::cancel_wait`]), never activated directly over it.
    pub fn activate(&mut self, id: ActorId) {
        assert!(self.slots[id.index()].waiting_on().is_none());
        let cpu = self.slots[id.index()].cpu();
        if self.runqs[usize::from(cpu)].push(self.slots, id) {
            let vect = self.slots[id.index()].vect();
            self.wake_map[usize::from(cpu)] |= 1 << vect;
        }
    }

    /// Parks `id` for `ticks` ticks. Zero ticks degenerates to an
    /// immediate reactivation, putting the caller behind its
    /// same-priority peers.
    ///
    /// # Panics
    ///
    /// If the timer ring is full; its capacity is a static configuration
    /// choice (`TIMERQ_MAX`) and overrunning it is a kernel-level bug.
    pub fn timeout(&mut self, id: ActorId, ticks: u32) {
        if ticks == 0 {
            self.activate(id);
        } else {
            let ok = self.timers.insert(id, ticks);
            assert!(ok, "timer ring exhausted");
        }
    }

    /// Dequeues one ready actor at `vect` on `cpu`. The boolean is
    /// `true` iff the queue is now empty; if it is `false` the interrupt
    /// handler re-asserts the vector so the remaining actors run in
    /// turn.
    pub fn pop_head(&mut self, cpu: u8, vect: u8) -> Option<(ActorId, bool)> {
        self.runqs[usize::from(cpu)].pop(self.slots, vect)
    }

    /// Advances kernel time by one tick, reactivating every expired
    /// sleeper. Expirations are activated here, before the tick handler
    /// returns, so work they trigger is ahead of anything scheduled later
    /// in the same tick.
    pub fn tick(&mut self) {
        let mut expired = [None; TIMERQ_MAX];
        let mut n = 0;
        self.timers.advance(|a| {
            expired[n] = Some(a);
            n += 1;
        });
        for a in expired.into_iter().flatten() {
            self.activate(a);
        }
    }

    /// Hands every recorded vector request to `f` and clears them. Called
    /// by the platform layer on its way out of the kernel.
    pub fn drain_wakes(&mut self, mut f: impl FnMut(IrqRequest)) {
        for (cpu, map) in self.wake_map.iter_mut().enumerate() {
            while *map != 0 {
                let vect = (31 - map.leading_zeros()) as u8;
                *map &= !(1 << vect);
                f(IrqRequest {
                    cpu: cpu as u8,
                    vect,
                });
            }
        }
    }

    /// Obtains a message from `chan` without blocking: first an untouched
    /// slot from the backing array, then whatever its queue holds.
    /// Returns `None` if the channel can offer nothing, which for a
    /// transport-only channel simply means "queue empty".
    pub fn message_alloc(&mut self, chan: ChanId) -> Option<MsgRef> {
        let carved = self.channels[chan.index()]
            .pool
            .as_mut()
            .and_then(Pool::carve);
        match carved {
            Some(slot) => Some(MsgRef { chan, slot }),
            None => self.queue_pop(chan, None),
        }
    }

    /// Returns `m` to its parent channel's queue. If an actor is waiting
    /// there, the message goes directly into its mailbox instead and the
    /// waiter is scheduled.
    pub fn message_free(&mut self, m: MsgRef) {
        self.queue_push(m.chan, m);
    }

    /// Appends `m` to `chan`'s queue, or hands it straight to the
    /// longest-waiting actor if the queue holds waiters. Type agreement
    /// between the message and the channel is the protection layer's
    /// concern; this layer moves what it is told to move.
    pub fn queue_push(&mut self, chan: ChanId, m: MsgRef) {
        debug_assert!(self.link_of(m).is_none());
        match self.channels[chan.index()].queue {
            Queue::Waiters { head, tail } => {
                let next = self.slots[head.index()].take_next();
                self.channels[chan.index()].queue = match next {
                    Some(n) => Queue::Waiters { head: n, tail },
                    None => Queue::Empty,
                };
                self.slots[head.index()].set_waiting_on(None);
                debug_assert!(self.slots[head.index()].mailbox().is_none());
                self.slots[head.index()].set_mailbox(Some(m));
                self.activate(head);
            }
            Queue::Messages { head, tail } => {
                self.set_link(tail, Some(m));
                self.channels[chan.index()].queue =
                    Queue::Messages { head, tail: m };
            }
            Queue::Empty => {
                self.channels[chan.index()].queue =
                    Queue::Messages { head: m, tail: m };
            }
        }
    }

    /// Dequeues the head message of `chan`. If the queue has no messages
    /// and `waiter` is supplied, the actor is parked on the channel and
    /// will receive the next message pushed (or freed) into it.
    pub fn queue_pop(
        &mut self,
        chan: ChanId,
        waiter: Option<ActorId>,
    ) -> Option<MsgRef> {
        match self.channels[chan.index()].queue {
            Queue::Messages { head, tail } => {
                let next = self.link_of(head);
                self.set_link(head, None);
                self.channels[chan.index()].queue = match next {
                    Some(n) => Queue::Messages { head: n, tail },
                    None => {
                        debug_assert!(head == tail);
                        Queue::Empty
                    }
                };
                Some(head)
            }
            Queue::Waiters { head, tail } => {
                if let Some(w) = waiter {
                    assert!(!self.slots[w.index()].is_queued());
                    self.slots[tail.index()].set_next(Some(w));
                    self.slots[w.index()].set_waiting_on(Some(chan));
                    self.channels[chan.index()].queue =
                        Queue::Waiters { head, tail: w };
                }
                None
            }
            Queue::Empty => {
                if let Some(w) = waiter {
                    assert!(!self.slots[w.index()].is_queued());
                    self.slots[w.index()].set_waiting_on(Some(chan));
                    self.channels[chan.index()].queue =
                        Queue::Waiters { head: w, tail: w };
                }
                None
            }
        }
    }

    /// Unlinks `id` from whatever wait queue it is parked on, if any.
    /// Used when an actor is forcibly restarted so it cannot be both
    /// ready and waiting.
    pub fn cancel_wait(&mut self, id: ActorId) {
        let Some(chan) = self.slots[id.index()].waiting_on() else {
            return;
        };
        let Queue::Waiters { head, tail } = self.channels[chan.index()].queue
        else {
            // waiting_on said so; the queue must agree.
            panic!();
        };

        if head == id {
            let next = self.slots[id.index()].take_next();
            self.channels[chan.index()].queue = match next {
                Some(n) => Queue::Waiters { head: n, tail },
                None => Queue::Empty,
            };
        } else {
            // Walk to the predecessor. Wait queues are short; this is the
            // cold path (fault recovery only).
            let mut cursor = head;
            loop {
                let next = self.slots[cursor.index()].next();
                match next {
                    Some(n) if n == id => break,
                    Some(n) => cursor = n,
                    None => panic!(),
                }
            }
            let after = self.slots[id.index()].take_next();
            self.slots[cursor.index()].set_next(after);
            if tail == id {
                self.channels[chan.index()].queue = Queue::Waiters {
                    head,
                    tail: cursor,
                };
            }
        }
        self.slots[id.index()].set_waiting_on(None);
    }

    /// Number of messages available from `chan`'s pool side: untouched
    /// slots plus its own messages sitting back in its queue. Diagnostic
    /// and test instrumentation.
    pub fn pool_free_count(&self, chan: ChanId) -> usize {
        let Some(pool) = self.channels[chan.index()].pool.as_ref() else {
            return 0;
        };
        let mut count = pool.uncarved();
        let mut cursor = match self.channels[chan.index()].queue {
            Queue::Messages { head, .. } => Some(head),
            _ => None,
        };
        while let Some(m) = cursor {
            if m.chan == chan {
                count += 1;
            }
            cursor = self.link_of(m);
        }
        count
    }

    /// Number of messages queued on `chan`, regardless of origin.
    pub fn queue_len(&self, chan: ChanId) -> usize {
        let mut count = 0;
        let mut cursor = match self.channels[chan.index()].queue {
            Queue::Messages { head, .. } => Some(head),
            _ => None,
        };
        while let Some(m) = cursor {
            count += 1;
            cursor = self.link_of(m);
        }
        count
    }

    fn pool_ref(&self, m: MsgRef) -> &Pool<'k> {
        match self.channels[m.chan.index()].pool.as_ref() {
            Some(p) => p,
            // A MsgRef is only minted by carving a pool-backed channel.
            None => panic!(),
        }
    }

    fn link_of(&self, m: MsgRef) -> Option<MsgRef> {
        self.pool_ref(m).link(m.slot)
    }

    fn set_link(&mut self, m: MsgRef, next: Option<MsgRef>) {
        match self.channels[m.chan.index()].pool.as_mut() {
            Some(p) => p.set_link(m.slot, next),
            None => panic!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::PoolConfig;
    use crate::ActorKind;

    const BLOCK: usize = 64;

    fn actor(vect: u8) -> SchedSlot {
        SchedSlot::new(ActorKind::Protected, vect, 0)
    }

    fn pool_chan(links: &mut [Option<MsgRef>]) -> Channel<'_> {
        let count = links.len() as u16;
        Channel::with_pool(
            1,
            PoolConfig {
                base: 0x2000_0000,
                block_size: BLOCK,
                block_count: count,
            },
            links,
        )
    }

    #[test]
    fn alloc_carves_then_drains_queue() {
        let mut links = [None; 2];
        let mut slots = [actor(2)];
        let mut chans = [pool_chan(&mut links)];
        let mut rt = Runtime::new(&mut slots, &mut chans);

        let ch = ChanId(0);
        let m0 = rt.message_alloc(ch).unwrap();
        let m1 = rt.message_alloc(ch).unwrap();
        assert_eq!(rt.message_alloc(ch), None);
        assert_eq!(rt.pool_free_count(ch), 0);

        rt.message_free(m0);
        assert_eq!(rt.pool_free_count(ch), 1);
        // Recycled, not re-carved.
        assert_eq!(rt.message_alloc(ch), Some(m0));
        rt.message_free(m1);
        rt.message_free(m0);
        assert_eq!(rt.pool_free_count(ch), 2);
    }

    #[test]
    fn msg_addr_and_size() {
        let mut links = [None; 2];
        let mut slots = [actor(2)];
        let mut chans = [pool_chan(&mut links)];
        let mut rt = Runtime::new(&mut slots, &mut chans);

        let m = rt.message_alloc(ChanId(0)).unwrap();
        assert_eq!(rt.msg_addr(m), 0x2000_0000);
        assert_eq!(rt.msg_size(m), BLOCK);
        let m2 = rt.message_alloc(ChanId(0)).unwrap();
        assert_eq!(rt.msg_addr(m2), 0x2000_0000 + BLOCK);
    }

    #[test]
    fn queue_is_fifo_across_pushes() {
        let mut links = [None; 3];
        let mut slots = [actor(2)];
        let mut chans = [pool_chan(&mut links), Channel::new(1)];
        let mut rt = Runtime::new(&mut slots, &mut chans);

        let transport = ChanId(1);
        let msgs: Vec<MsgRef> = (0..3)
            .map(|_| rt.message_alloc(ChanId(0)).unwrap())
            .collect();
        for &m in &msgs {
            rt.queue_push(transport, m);
        }
        assert_eq!(rt.queue_len(transport), 3);
        for &m in &msgs {
            assert_eq!(rt.queue_pop(transport, None), Some(m));
        }
        assert_eq!(rt.queue_pop(transport, None), None);
    }

    #[test]
    fn push_hands_off_to_waiter_directly() {
        let mut links = [None; 3];
        let mut slots = [actor(2), actor(3)];
        let mut chans = [pool_chan(&mut links), Channel::new(1)];
        let mut rt = Runtime::new(&mut slots, &mut chans);

        let transport = ChanId(1);
        let waiter = ActorId(1);
        assert_eq!(rt.queue_pop(transport, Some(waiter)), None);

        let m = rt.message_alloc(ChanId(0)).unwrap();
        rt.queue_push(transport, m);

        // Never visible in the queue; delivered and scheduled instead.
        assert_eq!(rt.queue_len(transport), 0);
        assert_eq!(rt.mailbox(waiter), Some(m));
        assert_eq!(rt.pop_head(0, 3), Some((waiter, true)));

        let mut wakes = Vec::new();
        rt.drain_wakes(|w| wakes.push(w));
        assert_eq!(wakes, vec![IrqRequest { cpu: 0, vect: 3 }]);
    }

    #[test]
    fn free_hands_off_to_pool_waiter() {
        let mut links = [None; 1];
        let mut slots = [actor(2), actor(3)];
        let mut chans = [pool_chan(&mut links)];
        let mut rt = Runtime::new(&mut slots, &mut chans);

        let ch = ChanId(0);
        let m = rt.message_alloc(ch).unwrap();
        // Pool empty; actor 1 waits on the channel.
        assert_eq!(rt.queue_pop(ch, Some(ActorId(1))), None);

        rt.message_free(m);
        assert_eq!(rt.mailbox(ActorId(1)), Some(m));
        // Hand-off bypassed the free queue entirely.
        assert_eq!(rt.pool_free_count(ch), 0);
    }

    #[test]
    fn waiters_are_served_fifo() {
        let mut links = [None; 3];
        let mut slots = [actor(2), actor(2), actor(2)];
        let mut chans = [pool_chan(&mut links), Channel::new(1)];
        let mut rt = Runtime::new(&mut slots, &mut chans);

        let transport = ChanId(1);
        for w in 0..3u16 {
            assert_eq!(rt.queue_pop(transport, Some(ActorId(w))), None);
        }
        for w in 0..3u16 {
            let m = rt.message_alloc(ChanId(0)).unwrap();
            rt.queue_push(transport, m);
            assert!(rt.mailbox(ActorId(w)).is_some(), "waiter {w}");
        }
    }

    #[test]
    fn cancel_wait_unlinks_middle_waiter() {
        let mut links = [None; 1];
        let mut slots = [actor(2), actor(2), actor(2)];
        let mut chans = [pool_chan(&mut links), Channel::new(1)];
        let mut rt = Runtime::new(&mut slots, &mut chans);

        let transport = ChanId(1);
        for w in 0..3u16 {
            assert_eq!(rt.queue_pop(transport, Some(ActorId(w))), None);
        }
        rt.cancel_wait(ActorId(1));

        let m = rt.message_alloc(ChanId(0)).unwrap();
        rt.queue_push(transport, m);
        assert_eq!(rt.mailbox(ActorId(0)), Some(m));
        // Actor 2 is now head; actor 1 is out of the line entirely.
        rt.take_mailbox(ActorId(0));
        rt.message_free(m);
        let m = rt.message_alloc(ChanId(0)).unwrap();
        rt.queue_push(transport, m);
        assert_eq!(rt.mailbox(ActorId(2)), Some(m));
        assert_eq!(rt.mailbox(ActorId(1)), None);
    }

    #[test]
    fn timeout_zero_is_activate() {
        let mut links = [None; 1];
        let mut slots = [actor(5)];
        let mut chans = [pool_chan(&mut links)];
        let mut rt = Runtime::new(&mut slots, &mut chans);

        rt.timeout(ActorId(0), 0);
        assert_eq!(rt.pop_head(0, 5), Some((ActorId(0), true)));
    }

    #[test]
    fn timer_expiry_reactivates() {
        let mut links = [None; 1];
        let mut slots = [actor(5)];
        let mut chans = [pool_chan(&mut links)];
        let mut rt = Runtime::new(&mut slots, &mut chans);

        rt.timeout(ActorId(0), 2);
        rt.tick();
        assert_eq!(rt.pop_head(0, 5), None);
        rt.tick();
        assert_eq!(rt.now(), 2);
        assert_eq!(rt.pop_head(0, 5), Some((ActorId(0), true)));
    }

    #[test]
    fn single_ownership_is_preserved() {
        // Exercise a full circulation and check, at every step, that the
        // message is in exactly one place.
        let mut links = [None; 1];
        let mut slots = [actor(2), actor(3)];
        let mut chans = [pool_chan(&mut links), Channel::new(1)];
        let mut rt = Runtime::new(&mut slots, &mut chans);

        let pool = ChanId(0);
        let transport = ChanId(1);
        let everywhere = |rt: &Runtime<'_>| {
            let in_pool = rt.pool_free_count(pool);
            let queued = rt.queue_len(transport);
            let boxed = [ActorId(0), ActorId(1)]
                .iter()
                .filter(|a| rt.mailbox(**a).is_some())
                .count();
            in_pool + queued + boxed
        };

        assert_eq!(everywhere(&rt), 1); // free in pool
        let m = rt.message_alloc(pool).unwrap();
        // In flight: owned by the caller, shows up nowhere.
        assert_eq!(everywhere(&rt), 0);
        rt.deliver(ActorId(0), m);
        assert_eq!(everywhere(&rt), 1); // bound
        let m = rt.take_mailbox(ActorId(0)).unwrap();
        rt.queue_push(transport, m);
        assert_eq!(everywhere(&rt), 1); // queued
        let m = rt.queue_pop(transport, None).unwrap();
        rt.message_free(m);
        assert_eq!(everywhere(&rt), 1); // free again
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Usermode side of the kernel interface.
//!
//! An actor is one function, `fn(msg_or_null) -> syscall_word`, entered
//! once per delivered event. Two ways to talk to the kernel follow from
//! that shape:
//!
//! - *Asynchronous* requests ([`sleep_for`], [`subscribe_to`]) are just
//!   words; the actor **returns** them. The kernel tears the activation
//!   down and re-enters the function from the top when the request
//!   completes — there is no stack to come back to.
//! - *Synchronous* requests ([`try_pop`], [`push`], [`free`]) trap
//!   immediately and the actor continues with the result in hand.
//!
//! Because every asynchronous wait re-enters from the top, an actor that
//! needs to make progress across waits keeps a resumption point in its
//! private data — see [`Coroutine`] for the supported pattern. All
//! per-activation locals must be reconstructible from that state plus
//! the delivered message.
//!
//! Messages arrive as a pointer to a [`MsgHeader`] followed by payload.
//! Check [`is_poisoned`] before trusting payload bytes: a poisoned
//! message was released by a crashed owner and may be half-written.

#![cfg_attr(target_os = "none", no_std)]

use core::sync::atomic::{AtomicU32, Ordering};

pub use abi::{MsgHeader, Sysnum, MSG_PAYLOAD_OFFSET};
use abi::syscall_word;

/// Builds the word for "wake me in `ticks` ticks" (or a bare reschedule
/// for zero). Return it from the actor function.
pub fn sleep_for(ticks: u32) -> u32 {
    syscall_word(Sysnum::Delay, ticks)
}

/// Builds the word for "deliver me the next message from channel
/// `chan`". Return it from the actor function; the reply arrives as the
/// next activation's argument.
pub fn subscribe_to(chan: u32) -> u32 {
    syscall_word(Sysnum::Subscribe, chan)
}

/// Releases the current message and takes whatever channel `chan` can
/// offer right now. Null means empty-handed (the previous message is
/// gone regardless).
pub fn try_pop(chan: u32) -> *mut MsgHeader {
    sys_call(syscall_word(Sysnum::TryPop, chan)) as *mut MsgHeader
}

/// Sends the currently owned message to channel `chan`. On success the
/// result is null; if the kernel refused (wrong message type for the
/// channel), the message stays owned and comes back.
pub fn push(chan: u32) -> *mut MsgHeader {
    sys_call(syscall_word(Sysnum::Push, chan)) as *mut MsgHeader
}

/// Returns the currently owned message to its pool. Harmless when
/// nothing is owned.
pub fn free() {
    let _ = sys_call(syscall_word(Sysnum::Free, 0));
}

/// Pointer to the payload bytes of a message.
///
/// # Safety
///
/// `msg` must be the live message the kernel delivered to this actor.
pub unsafe fn payload_ptr(msg: *mut MsgHeader) -> *mut u8 {
    msg.cast::<u8>().add(MSG_PAYLOAD_OFFSET)
}

/// Payload capacity of a message: its full size minus the header.
///
/// # Safety
///
/// `msg` must be the live message the kernel delivered to this actor.
pub unsafe fn payload_len(msg: *const MsgHeader) -> usize {
    (*msg).size.saturating_sub(MSG_PAYLOAD_OFFSET)
}

/// True if the message was released by a crashed owner; its payload must
/// not be trusted.
///
/// # Safety
///
/// `msg` must be the live message the kernel delivered to this actor.
pub unsafe fn is_poisoned(msg: *const MsgHeader) -> bool {
    (*msg).poisoned != 0
}

/// Resumption point of a stackless actor, kept in the actor's private
/// data so it survives between activations (and is wiped, with the rest
/// of data, by a restart).
///
/// The pattern:
///
/// ```ignore
/// static STEP: Coroutine = Coroutine::new();
///
/// fn pump(msg: usize) -> u32 {
///     match STEP.point() {
///         0 => STEP.advance(1, subscribe_to(REQUESTS)),
///         1 => {
///             // `msg` is the subscription delivery; handle it, then
///             // wait for the next one.
///             handle(msg);
///             STEP.advance(1, subscribe_to(REQUESTS))
///         }
///         _ => STEP.advance(0, sleep_for(0)),
///     }
/// }
/// ```
pub struct Coroutine(AtomicU32);

impl Coroutine {
    pub const fn new() -> Self {
        Coroutine(AtomicU32::new(0))
    }

    /// The label to resume at.
    pub fn point(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    /// Records the next resumption point and passes the syscall word
    /// through, so `return STEP.advance(label, word)` reads like the
    /// await it is.
    pub fn advance(&self, next: u32, word: u32) -> u32 {
        self.0.store(next, Ordering::Relaxed);
        word
    }

    /// Back to the first label, for self-directed restarts.
    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

impl Default for Coroutine {
    fn default() -> Self {
        Self::new()
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "arm", target_os = "none"))] {
        /// Performs a synchronous trap with `word`, returning the
        /// kernel's result register.
        fn sys_call(word: u32) -> usize {
            let result: u32;
            // Safety: SVC with the kernel's single-word convention;
            // clobbers nothing beyond r0.
            unsafe {
                core::arch::asm!(
                    "svc #0",
                    inout("r0") word => result,
                );
            }
            result as usize
        }

        /// Drives an actor's main function forever: call, hand the
        /// returned word to the kernel, re-enter with the result. An
        /// asynchronous word never comes back here — the kernel discards
        /// this activation and the crt starts over at the entry point.
        ///
        /// This is the tail of the usermode crt; data/bss setup on a
        /// restart is the crt's (linker-dependent) business and happens
        /// before this is called.
        pub fn run_actor(main: fn(usize) -> u32, mut arg: usize) -> ! {
            loop {
                arg = sys_call(main(arg));
            }
        }
    } else {
        /// Host builds route the trap through a handler the simulation
        /// binds at startup; see [`host::bind`].
        fn sys_call(word: u32) -> usize {
            host::sys_call(word)
        }

        pub mod host {
            use std::cell::Cell;

            std::thread_local! {
                static SYSCALL: Cell<Option<fn(u32) -> usize>> =
                    const { Cell::new(None) };
            }

            /// Binds the simulated trap entry. The harness points this
            /// at its kernel port before running any actor.
            pub fn bind(handler: fn(u32) -> usize) {
                SYSCALL.with(|c| c.set(Some(handler)));
            }

            pub(crate) fn sys_call(word: u32) -> usize {
                let handler = SYSCALL
                    .with(|c| c.get())
                    .expect("no syscall handler bound");
                handler(word)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_packed() {
        assert_eq!(sleep_for(3), 3);
        assert_eq!(subscribe_to(2), (1 << 28) | 2);
    }

    #[test]
    fn coroutine_advances_and_passes_through() {
        let c = Coroutine::new();
        assert_eq!(c.point(), 0);
        let w = c.advance(7, sleep_for(1));
        assert_eq!(w, sleep_for(1));
        assert_eq!(c.point(), 7);
        c.reset();
        assert_eq!(c.point(), 0);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel online profiling support.
//!
//! This is intended to help measure the timing of kernel events, duration
//! of syscalls, and the like, as an aid to debugging or optimization
//! work.
//!
//! Because the kernel is SoC-independent, this module does not assume any
//! particular way of getting profiling information out of the kernel.
//! Instead, any target that wants to use profiling needs to populate an
//! `EventsTable` struct and provide it to
//! `kern::profiling::configure_events_table` from its startup routine. A
//! typical implementation sets and clears GPIOs so an external logic
//! analyzer can watch; be careful of probe effect and keep the handlers
//! fast.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Hooks that must be provided by the board setup code if it wants to
/// enable kernel profiling.
///
/// If you provide an `EventsTable`, you have to provide every hook. This
/// eliminates one null pointer check per *implemented* event; stub the
/// ones you don't care about with `|| ()`-shaped empty fns.
pub struct EventsTable {
    /// Called on entry to the syscall handler with the raw syscall word.
    pub syscall_enter: fn(u32),
    /// Called on exit from the syscall handler back to usermode.
    pub syscall_exit: fn(),
    /// Called on entry to the scheduling interrupt handler.
    pub isr_enter: fn(),
    /// Called on exit from the scheduling interrupt handler.
    pub isr_exit: fn(),
    /// Called on entry to the kernel's timer tick handler.
    pub timer_isr_enter: fn(),
    /// Called on exit from the kernel's timer tick handler.
    pub timer_isr_exit: fn(),
    /// Called whenever the running actor changes, with the actor's table
    /// index, or `usize::MAX` for the idle context.
    pub context_switch: fn(usize),
}

static EVENTS_TABLE: AtomicPtr<EventsTable> =
    AtomicPtr::new(core::ptr::null_mut());

/// Activates a table of profiling hooks. Normally called once during
/// board startup, before actors run.
pub fn configure_events_table(table: &'static EventsTable) {
    EVENTS_TABLE
        .store(table as *const _ as *mut _, Ordering::Relaxed);
}

fn table() -> Option<&'static EventsTable> {
    let p = EVENTS_TABLE.load(Ordering::Relaxed);
    // Safety: the pointer is only ever null or a &'static stored above.
    unsafe { p.cast_const().as_ref() }
}

pub(crate) fn event_syscall_enter(word: u32) {
    if let Some(t) = table() {
        (t.syscall_enter)(word);
    }
}

pub(crate) fn event_syscall_exit() {
    if let Some(t) = table() {
        (t.syscall_exit)();
    }
}

pub(crate) fn event_isr_enter() {
    if let Some(t) = table() {
        (t.isr_enter)();
    }
}

pub(crate) fn event_isr_exit() {
    if let Some(t) = table() {
        (t.isr_exit)();
    }
}

pub(crate) fn event_timer_isr_enter() {
    if let Some(t) = table() {
        (t.timer_isr_enter)();
    }
}

pub(crate) fn event_timer_isr_exit() {
    if let Some(t) = table() {
        (t.timer_isr_exit)();
    }
}

pub(crate) fn event_context_switch(actor_index: usize) {
    if let Some(t) = table() {
        (t.context_switch)(actor_index);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel-side writes into message storage.
//!
//! The kernel shares message memory with actors, but only two header
//! words cross the boundary: the exposed size (written at bind) and the
//! poison mark (written at release). Keeping the raw pointer work in one
//! place keeps the rest of the kernel free of it.
//!
//! All functions here require the caller to guarantee that `addr` is the
//! base of a slot inside pool storage registered with the kernel, and
//! that no actor currently has the slot mapped writable. Both hold at the
//! only call sites: bind (message freshly delivered) and unbind/release
//! (region just torn down).

use core::mem::size_of;

/// Word index of the poison mark within the header.
const POISONED_WORD: usize = abi::MsgHeader::WORDS - 1;

/// Writes the exposed-size word of the message at `addr`.
pub(crate) unsafe fn write_msg_size(addr: usize, size: usize) {
    let p = addr as *mut usize;
    core::ptr::write_volatile(p, size);
}

/// Writes the poison mark of the message at `addr`.
pub(crate) unsafe fn write_msg_poisoned(addr: usize, poisoned: bool) {
    let p = (addr + POISONED_WORD * size_of::<usize>()) as *mut usize;
    core::ptr::write_volatile(p, poisoned as usize);
}

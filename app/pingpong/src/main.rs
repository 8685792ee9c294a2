// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Two actors playing ping-pong over a pair of channels, on the
//! simulated machine.
//!
//! This is the boot-glue walkthrough: allocate the tables, size the
//! per-priority stacks, create the channels and actors, then drive the
//! tick. On hardware the same sequence runs from `main` before
//! `startup::start_kernel`; here the tick loop stands in for the timer
//! interrupt.

use std::sync::atomic::{AtomicUsize, Ordering};

use abi::TaskDesc;
use kern::arch::host;
use kern::kernel::{CpuContext, Kernel, StackDesc};
use kern::{Actor, Hooks};
use kerncore::msg::PoolConfig;
use kerncore::runtime::Runtime;
use kerncore::{ActorId, ActorKind, Channel, SchedSlot};
use userlib::{free, subscribe_to, try_pop, Coroutine, MsgHeader};

/// Message block size: header plus one counter word, rounded up to a
/// power of two.
const BLOCK: usize = 64;

/// Channel handles, as the actors see them.
const POOL: u32 = 0;
const PING: u32 = 1;
const PONG: u32 = 2;

#[repr(align(64))]
struct Blocks([u8; 2 * BLOCK]);

#[repr(align(256))]
struct Stack([u8; 256]);

static RALLIES: AtomicUsize = AtomicUsize::new(0);

fn counter(msg: *mut MsgHeader) -> &'static mut usize {
    // Safety: demo actors only call this on the message the kernel just
    // delivered to them.
    unsafe { &mut *userlib::payload_ptr(msg).cast::<usize>() }
}

/// Serves: allocate a ball, hit it to PING, then return every ball that
/// comes back on PONG.
fn ping(arg: usize) -> u32 {
    static STEP: Coroutine = Coroutine::new();
    match STEP.point() {
        0 => {
            let m = try_pop(POOL);
            assert!(!m.is_null());
            *counter(m) = 0;
            userlib::push(PING);
            STEP.advance(1, subscribe_to(PONG))
        }
        _ => {
            let m = arg as *mut MsgHeader;
            *counter(m) += 1;
            userlib::push(PING);
            STEP.advance(1, subscribe_to(PONG))
        }
    }
}

/// How long the match runs before pong pockets the ball.
const MATCH_LEN: usize = 10;

/// Returns every ball from PING to PONG, counting rallies and ending
/// the match after [`MATCH_LEN`] of them.
fn pong(arg: usize) -> u32 {
    static STEP: Coroutine = Coroutine::new();
    match STEP.point() {
        0 => STEP.advance(1, subscribe_to(PING)),
        _ => {
            let m = arg as *mut MsgHeader;
            // Safety: delivered message.
            if unsafe { userlib::is_poisoned(m) } {
                // A crashed peer's ball: throw it away and wait for a
                // fresh serve.
                free();
                return STEP.advance(1, subscribe_to(PING));
            }
            let n = RALLIES.fetch_add(1, Ordering::Relaxed) + 1;
            if n >= MATCH_LEN {
                free();
                return STEP.advance(1, subscribe_to(PING));
            }
            *counter(m) += 1;
            userlib::push(PONG);
            STEP.advance(1, subscribe_to(PING))
        }
    }
}

fn task_desc(entry: host::ActorEntry) -> TaskDesc {
    TaskDesc {
        flash_base: entry as usize,
        flash_size: 64,
        sram_base: 0x2000_0000,
        sram_size: 1024,
    }
}

fn main() {
    let mut storage = Blocks([0; 2 * BLOCK]);
    let mut links = [None; 2];
    let mut channels = [
        Channel::with_pool(
            1,
            PoolConfig {
                base: storage.0.as_mut_ptr() as usize,
                block_size: BLOCK,
                block_count: 2,
            },
            &mut links,
        ),
        Channel::new(1), // PING
        Channel::new(1), // PONG
    ];
    let mut slots = [
        SchedSlot::new(ActorKind::Protected, 2, 0),
        SchedSlot::new(ActorKind::Protected, 3, 0),
    ];
    let mut actors = [Actor::new(), Actor::new()];
    let mut cpus = [CpuContext::new()];

    host::select_cpu(0);
    userlib::host::bind(host::syscall);

    let rt = Runtime::new(&mut slots, &mut channels);
    let mut kernel = Kernel::new(rt, &mut actors, &mut cpus, Hooks::default());
    kernel.init_cpu(
        0,
        StackDesc {
            base: 0x0800_0000,
            size: 64,
        },
        StackDesc {
            base: 0x2000_f000,
            size: 64,
        },
    );

    let mut stack2 = Stack([0; 256]);
    let mut stack3 = Stack([0; 256]);
    kernel.set_stack(
        0,
        2,
        StackDesc {
            base: stack2.0.as_mut_ptr() as usize,
            size: stack2.0.len(),
        },
    );
    kernel.set_stack(
        0,
        3,
        StackDesc {
            base: stack3.0.as_mut_ptr() as usize,
            size: stack3.0.len(),
        },
    );

    kernel.actor_init(ActorId(1), &task_desc(pong));
    kernel.actor_init(ActorId(0), &task_desc(ping));

    // The rally is entirely event-driven; a handful of service passes
    // settles it, and ticks would only matter if someone slept.
    host::run(&mut kernel, 0);
    for _ in 0..3 {
        host::tick(&mut kernel, 0);
    }

    println!(
        "rallies: {}, pool free: {}",
        RALLIES.load(Ordering::Relaxed),
        kernel.runtime().pool_free_count(kerncore::ChanId(0)),
    );
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M.
//!
//! # How actors run here
//!
//! Actors are stackless, which makes this port unusually small: there is
//! no saved-register block per task. Launching an actor means fabricating
//! a hardware exception frame at the top of its priority's stack and
//! returning through it; suspending one means throwing that frame away
//! and returning through the predecessor's. Callee-saved registers never
//! need kernel attention — a preempted actor's live registers ride out
//! the nested exception exactly as the architecture intends, and a
//! suspended actor has, by contract, nothing live at all.
//!
//! - The stacked LR slot doubles as the *restart marker*: a nonzero
//!   value on entry tells the usermode crt to re-initialize data/bss
//!   (first activation, or first after a crash).
//! - Each scheduler vector is a real NVIC interrupt line, pended by
//!   software. One NVIC priority encodes one scheduler level.
//! - The exception return sequence acts as the barrier for MPU
//!   reprogramming, so no explicit DSB/ISB on the switch path.
//!
//! # Priority direction
//!
//! The scheduler counts up (level 31 preempts level 2); the NVIC counts
//! down (priority value 0 preempts 0xF0). The conversion is confined to
//! [`hw_prio`]; nothing else in the kernel knows about it. With
//! `PRIO_BITS` of 4, scheduler levels 2 through 14 are usable by actors:
//! level 15 would need BASEPRI 0, which the hardware treats as "masking
//! off".
//!
//! # Entry points
//!
//! The vector table (owned by the board crate) routes:
//!
//! - `SVCall` to the assembly thunk below, which forwards the stacked
//!   syscall word and frame to [`kern_svc_entry`];
//! - every scheduler vector's ISR to a two-instruction stub
//!   (`movs r0, #N; b kern_irq_dispatch`);
//! - `SysTick` to [`kern_tick_entry`] (ticks never switch frames
//!   directly — they pend vectors and let the NVIC do the rest);
//! - `MemoryManagement`/`BusFault`/`UsageFault` to the fault thunk.

use core::sync::atomic::{AtomicPtr, Ordering};

use abi::{FaultInfo, RegionAttributes};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::actor::REGIONS_PER_ACTOR;
use crate::kernel::Kernel;

/// Number of NVIC priority bits implemented on the SoCs we target.
pub const PRIO_BITS: u32 = 4;

/// Highest scheduler level expressible through BASEPRI on this port.
pub const LEVEL_MAX: u8 = (1 << PRIO_BITS) - 1;

/// Hardware-stacked exception frame.
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Frame {
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

/// Bytes reserved at the top of a priority stack for one frame.
pub const FRAME_SIZE: usize = core::mem::size_of::<Frame>();

/// Initially we just set the Thumb Mode bit, the minimum required.
const INITIAL_PSR: u32 = 1 << 24;

/// Opaque frame handle; compared by identity when the kernel unwinds.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FramePtr(*mut Frame);

impl FramePtr {
    pub const NULL: Self = FramePtr(core::ptr::null_mut());
}

/// Fabricates the synthetic frame that makes the next exception return
/// begin executing `entry` in unprivileged thread mode on this stack.
pub fn frame_alloc(stack_top: usize, entry: usize, restart: bool) -> FramePtr {
    // Exception frames are 8-byte aligned by architecture.
    let addr = (stack_top - FRAME_SIZE) & !7;
    let p = addr as *mut Frame;
    // Safety: the caller owns this priority stack and no frame is live
    // on it (the previous occupant has retired; see the kernel's
    // preemption-stack argument).
    unsafe {
        p.write(Frame {
            r0: 0,
            r1: 0,
            r2: 0,
            r3: 0,
            r12: 0,
            lr: restart as u32,
            pc: entry as u32 | 1, // thumb bit
            xpsr: INITIAL_PSR,
        });
    }
    FramePtr(p)
}

/// Patches the first-argument register of a frame.
pub fn frame_set_arg(frame: FramePtr, arg: usize) {
    uassert!(frame != FramePtr::NULL);
    // Safety: frames live in priority stacks owned by the kernel.
    unsafe {
        (*frame.0).r0 = arg as u32;
    }
}

/// PMSAv7 region descriptor, precomputed so the context switch is two
/// register writes per slot.
///
/// `repr(C)` to keep the register-image fields adjacent, which improves
/// code generation on the reprogram path.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct Region {
    rbar: u32,
    rasr: u32,
    base: usize,
    size: usize,
}

impl Region {
    pub const DISABLED: Self = Region {
        rbar: 0,
        rasr: 0,
        base: 0,
        size: 0,
    };

    pub fn enabled(&self) -> bool {
        self.size != 0
    }
}

impl kerncore::region::MemoryRegion for Region {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    fn base_addr(&self) -> usize {
        self.base
    }

    fn end_addr(&self) -> usize {
        self.base + self.size
    }
}

/// Encodes a region descriptor. Zero size disables the slot.
///
/// # Panics
///
/// If the region is not a power of two of at least 32 bytes, naturally
/// aligned — the shapes PMSAv7 can express.
pub fn region_init(
    base: usize,
    size: usize,
    attributes: RegionAttributes,
) -> Region {
    if size == 0 {
        return Region::DISABLED;
    }
    uassert!(abi::region_shape_ok(base, size));
    uassert!(size >= 32);

    let xn = !attributes.contains(RegionAttributes::EXECUTE);
    // AP encodings chosen so privileged code (i.e. us) always keeps
    // access to the memory.
    let ap = if attributes.contains(RegionAttributes::WRITE) {
        0b011
    } else if attributes.contains(RegionAttributes::READ) {
        0b010
    } else {
        0b001
    };
    // TEX/SCB per table B3-13 of the ARMv7-M ARM: device memory strongly
    // ordered-ish, normal memory write-back allocate, not shared.
    let (tex, scb) = if attributes.contains(RegionAttributes::DEVICE) {
        (0b000, 0b001)
    } else {
        (0b001, 0b011)
    };
    // The MPU wants log2(size) minus one in SIZE. Sizes are checked
    // powers of two above, so count zeros instead of looping.
    let l2size = 30 - (size as u32).leading_zeros();

    let rasr =
        (xn as u32) << 28 | ap << 24 | tex << 19 | scb << 16 | l2size << 1 | 1;
    Region {
        rbar: base as u32,
        rasr,
        base,
        size,
    }
}

/// Loads a full region set, slots 0 through `REGIONS_PER_ACTOR - 1`.
/// The MPU is disabled across the rewrite; the exception return that
/// follows kernel entry is the synchronization point.
pub fn apply_regions(regions: &[Region; REGIONS_PER_ACTOR]) {
    // Safety: MPU register pokes; values come from `region_init` and
    // only constrain unprivileged code.
    let mpu = unsafe { &*cortex_m::peripheral::MPU::PTR };
    cortex_m::interrupt::free(|_| unsafe {
        mpu.ctrl.write(0);
        for (i, region) in regions.iter().enumerate() {
            mpu.rnr.write(i as u32);
            mpu.rbar.write(region.rbar);
            mpu.rasr.write(region.rasr);
        }
        mpu.ctrl.write(MPU_CTRL_PRIVDEFENA | MPU_CTRL_ENABLE);
    });
}

/// Rewrites one region slot in place; used when only the message window
/// moved.
pub fn update_region(index: usize, region: &Region) {
    uassert!(index < REGIONS_PER_ACTOR);
    // Safety: as in `apply_regions`.
    let mpu = unsafe { &*cortex_m::peripheral::MPU::PTR };
    cortex_m::interrupt::free(|_| unsafe {
        mpu.rnr.write(index as u32);
        mpu.rbar.write(region.rbar);
        mpu.rasr.write(region.rasr);
    });
}

const MPU_CTRL_ENABLE: u32 = 1 << 0;
const MPU_CTRL_PRIVDEFENA: u32 = 1 << 2;

/// Scheduler level to NVIC priority byte. See the module docs for the
/// direction flip.
fn hw_prio(level: u8) -> u8 {
    uassert!(level < LEVEL_MAX);
    (LEVEL_MAX - level) << (8 - PRIO_BITS)
}

/// Sets the architectural mask so only levels above `level` preempt.
#[allow(unused_unsafe)]
pub fn set_intr_level(level: u8) {
    // Safety: BASEPRI write; raising or lowering the mask cannot violate
    // memory safety.
    unsafe {
        cortex_m::register::basepri::write(hw_prio(level));
    }
}

/// Configures and enables the NVIC line backing scheduler vector `vect`.
/// Boot glue calls this once per actor vector.
pub fn enable_vector(vect: u8) {
    // Safety: NVIC priority/enable pokes for a line whose ISR is the
    // dispatch stub; done before actors run.
    unsafe {
        let nvic = &*cortex_m::peripheral::NVIC::PTR;
        let v = usize::from(vect);
        nvic.ipr[v].write(hw_prio(vect));
        nvic.iser[v / 32].write(1 << (v % 32));
    }
}

/// Pends scheduler vector `vect`. This port is single-core, so the CPU
/// routing collapses.
pub fn interrupt_request(cpu: u8, vect: u8) {
    uassert!(cpu == 0);
    // Safety: ISPR write only pends an interrupt.
    unsafe {
        let nvic = &*cortex_m::peripheral::NVIC::PTR;
        let v = usize::from(vect);
        nvic.ispr[v / 32].write(1 << (v % 32));
    }
}

/// This CPU's identity.
pub fn cpu_this() -> u8 {
    0
}

/// The kernel, as seen from exception handlers. Thread-mode code must
/// not touch it after `install`.
static KERNEL: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Publishes the kernel for the exception entry points.
///
/// # Safety
///
/// Call once, before enabling any scheduler vector, with a kernel that
/// lives forever; thread-mode code must give up the reference.
pub unsafe fn install(kernel: &'static mut Kernel<'static>) {
    KERNEL.store(kernel as *mut Kernel<'_> as *mut (), Ordering::Release);
}

fn kernel() -> &'static mut Kernel<'static> {
    let p = KERNEL.load(Ordering::Acquire);
    uassert!(!p.is_null());
    // Safety: handlers are serialized by the exception model and
    // thread-mode code has relinquished the kernel per `install`.
    unsafe { &mut *(p as *mut Kernel<'static>) }
}

/// Rust side of the SVCall thunk: dispatch the syscall, hand back the
/// frame to resume.
#[no_mangle]
extern "C" fn kern_svc_entry(word: u32, frame: *mut Frame) -> *mut Frame {
    let next = kernel().svc_handler(0, word, FramePtr(frame));
    next.0
}

/// Rust side of the scheduler-vector stubs.
#[no_mangle]
extern "C" fn kern_irq_entry(vect: u32, frame: *mut Frame) -> *mut Frame {
    let next = kernel().intr_handler(0, vect as u8, FramePtr(frame));
    next.0
}

/// SysTick handler: advance kernel time. Never switches frames itself;
/// anything it wakes arrives through a pended vector.
#[no_mangle]
extern "C" fn kern_tick_entry() {
    kernel().tick(0);
}

/// Rust side of the fault thunk. Decodes the configurable fault status
/// register into the portable fault description.
#[no_mangle]
extern "C" fn kern_fault_entry(_frame: *mut Frame) -> *mut Frame {
    const CFSR: *const u32 = 0xE000_ED28 as *const u32;
    const MMFAR: *const u32 = 0xE000_ED34 as *const u32;
    // Safety: SCB status register reads.
    let (cfsr, mmfar) = unsafe {
        let c = core::ptr::read_volatile(CFSR);
        let m = core::ptr::read_volatile(MMFAR);
        // Write-one-to-clear so the next fault starts clean.
        core::ptr::write_volatile(CFSR as *mut u32, c);
        (c, m)
    };

    let fault = if cfsr & 0xff != 0 {
        FaultInfo::MemoryAccess {
            address: if cfsr & (1 << 7) != 0 {
                Some(mmfar as usize)
            } else {
                None
            },
        }
    } else if cfsr & 0xff00 != 0 {
        FaultInfo::BusError
    } else if cfsr & (1 << 25) != 0 {
        FaultInfo::DivideByZero
    } else {
        FaultInfo::IllegalInstruction
    };

    kernel().trap_handler(0, fault).0
}

/// Region occupied by the idle loop's code, for `Kernel::init_cpu`.
pub fn idle_code_region() -> (usize, usize) {
    extern "C" {
        static kern_idle_text: u8;
    }
    // Safety: address of a linker symbol.
    (unsafe { core::ptr::addr_of!(kern_idle_text) as usize }, 64)
}

/// Carves the idle stack out of the current (boot) stack: one aligned
/// frame's worth just below the live stack pointer. Call from `main`
/// while the stack is near its initial value.
pub fn idle_stack_region() -> (usize, usize) {
    const IDLE_STACK: usize = 64;
    let sp: usize;
    // Safety: reading SP has no side effects.
    unsafe {
        core::arch::asm!("mov {}, sp", out(reg) sp);
    }
    let base = (sp & !(IDLE_STACK - 1)) - IDLE_STACK;
    (base, IDLE_STACK)
}

/// Drops to the protected idle loop and never comes back: from here on,
/// the CPU alternates between idle and whatever the vectors deliver.
///
/// # Safety
///
/// Requires `install` and the per-CPU kernel init to have happened; must
/// be the last thing boot code does.
pub unsafe fn start_idle() -> ! {
    extern "C" {
        static kern_idle_text: u8;
    }
    // Thread mode becomes unprivileged here, once, so that even the idle
    // loop is subject to the MPU.
    let mut control = cortex_m::register::control::read();
    control.set_npriv(cortex_m::register::control::Npriv::Unprivileged);
    cortex_m::register::control::write(control);
    cortex_m::asm::isb();
    set_intr_level(abi::Priority::TRAP.0);
    let idle: extern "C" fn() -> ! = core::mem::transmute(
        core::ptr::addr_of!(kern_idle_text) as usize | 1,
    );
    idle()
}

// Exception thunks and the idle loop.
//
// SVCall: the syscall word is the stacked r0; the frame to resume comes
// back in r0 and becomes the new PSP. Scheduler vectors funnel through
// `kern_irq_dispatch` with the vector number in r0 (the board's per-line
// stubs are `movs r0, #N; b kern_irq_dispatch`). Faults pass the frame
// only.
core::arch::global_asm!(
    "
    .syntax unified
    .section .text.kern_thunks, \"ax\"

    .global SVCall
    .thumb_func
SVCall:
    mrs r1, psp
    ldr r0, [r1]
    push {{lr}}
    bl kern_svc_entry
    msr psp, r0
    pop {{pc}}

    .global kern_irq_dispatch
    .thumb_func
kern_irq_dispatch:
    mrs r1, psp
    push {{lr}}
    bl kern_irq_entry
    msr psp, r0
    pop {{pc}}

    .global kern_fault_dispatch
    .thumb_func
kern_fault_dispatch:
    mrs r0, psp
    push {{lr}}
    bl kern_fault_entry
    msr psp, r0
    pop {{pc}}

    .section .text.kern_idle, \"ax\"
    .align 6
    .global kern_idle_text
    .thumb_func
kern_idle_text:
1:  wfi
    b 1b
    "
);

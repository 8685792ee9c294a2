// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted port: a deterministic simulation of the machine, used by the
//! test suite and the demo glue.
//!
//! The "hardware" here is: per-CPU instances of the software interrupt
//! controller ([`kerncore::pic::Gpic`]), a recorded (not enforced)
//! protection unit, frames placed in real memory at the top of each
//! priority's stack, and a doorbell bitmap standing in for the
//! inter-processor interrupt. Multiple CPUs are simulated cooperatively
//! on one thread; [`run_until_quiet`] round-robins them the way silicon
//! would race them.
//!
//! # Control flow
//!
//! Everything is an ordinary call loop — there are no non-local jumps:
//!
//! - [`run`] services the simulated interrupt line: start the highest
//!   vector, call the kernel's interrupt handler, and if that produced a
//!   fresh usermode frame, run the actor.
//! - Running an actor means calling its entry function with the mailbox
//!   argument and feeding the *returned* word to syscall dispatch. A
//!   synchronous result loops, re-entering the function; an asynchronous
//!   one hands back the preempted frame, which is recognized by pointer
//!   identity and unwinds one nesting level.
//! - A synchronous syscall taken mid-function (through
//!   [`syscall`]) can make higher-priority work runnable; it is serviced
//!   by recursion before the syscall returns, which is exactly the
//!   preemption the interrupt would perform on hardware.
//! - A simulated memory fault ([`trap`]) has to abandon the actor's
//!   Rust frame mid-call; it travels as a panic payload and is caught at
//!   the trampoline, becoming an actor exception. Genuine test panics
//!   are re-thrown untouched.
//!
//! All state is thread-local, so every test (each on its own thread)
//! gets a pristine machine.

use core::mem::size_of;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};

use abi::{FaultInfo, RegionAttributes};
use kerncore::pic::Gpic;
use kerncore::region::MemoryRegion;

use crate::actor::REGIONS_PER_ACTOR;
use crate::kernel::Kernel;

/// Number of CPUs the simulation models.
pub const SIM_CPUS: usize = 2;

/// Signature of a simulated usermode entry point. The argument is the
/// bound message address (or zero); the return value is the next syscall
/// word.
pub type ActorEntry = fn(usize) -> u32;

/// Synthetic "exception frame". On hardware this is the stacked register
/// set; here it is the triple the trampoline needs.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct Frame {
    entry: usize,
    arg: usize,
    restart: usize,
}

/// Frame size reserved at the top of each priority stack.
pub const FRAME_SIZE: usize = size_of::<Frame>().next_power_of_two();

/// Opaque frame handle. Compared by identity: the kernel hands back the
/// exact pointer it was given when it unwinds to a predecessor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FramePtr(*mut Frame);

impl FramePtr {
    pub const NULL: Self = FramePtr(core::ptr::null_mut());
}

/// Recorded protection region. The simulation stores what the kernel
/// programs and lets tests inspect it; it does not enforce access (that
/// is what the hardware ports are for). Shape constraints are likewise
/// not imposed here, because host code placement is the linker's
/// business, not ours.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Region {
    pub base: usize,
    pub size: usize,
    pub attributes: RegionAttributes,
}

impl Region {
    pub const DISABLED: Self = Region {
        base: 0,
        size: 0,
        attributes: RegionAttributes::empty(),
    };

    pub fn enabled(&self) -> bool {
        self.size != 0
    }
}

impl MemoryRegion for Region {
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

/// Builds a region descriptor; zero size disables the slot.
pub fn region_init(
    base: usize,
    size: usize,
    attributes: RegionAttributes,
) -> Region {
    if size == 0 {
        Region::DISABLED
    } else {
        Region {
            base,
            size,
            attributes,
        }
    }
}

struct HostState {
    current_cpu: Cell<usize>,
    /// Type-erased pointer to the kernel under [`enter`]; null outside.
    kernel: Cell<*mut ()>,
    /// Dynamic aliasing guard for `kernel`.
    in_kernel: Cell<bool>,
    pics: RefCell<[Gpic; SIM_CPUS]>,
    /// Pending doorbell vectors per target CPU.
    ipi: [Cell<u32>; SIM_CPUS],
    mpu: RefCell<[[Region; REGIONS_PER_ACTOR]; SIM_CPUS]>,
    level: [Cell<u8>; SIM_CPUS],
    /// Stack of frames of nested live actors; top is the one a
    /// mid-function syscall belongs to.
    frames: RefCell<Vec<FramePtr>>,
    /// Restart marker of the most recently launched frame.
    last_restart: Cell<bool>,
}

thread_local! {
    static HOST: HostState = HostState {
        current_cpu: Cell::new(0),
        kernel: Cell::new(core::ptr::null_mut()),
        in_kernel: Cell::new(false),
        pics: RefCell::new([Gpic::new(), Gpic::new()]),
        ipi: [Cell::new(0), Cell::new(0)],
        mpu: RefCell::new(
            [[Region::DISABLED; REGIONS_PER_ACTOR]; SIM_CPUS],
        ),
        level: [Cell::new(0), Cell::new(0)],
        frames: RefCell::new(Vec::new()),
        last_restart: Cell::new(false),
    };
}

/// Panic payload carrying a simulated hardware fault from actor code to
/// the trampoline.
struct SimFault(FaultInfo);

/// Runs `f` with exclusive access to the installed kernel. Actor entry
/// functions execute strictly outside of any such borrow, so the only
/// `&mut Kernel` alive at a time is the one handed to `f`.
fn with_kernel<R>(f: impl FnOnce(&mut Kernel<'_>) -> R) -> R {
    HOST.with(|h| {
        let p = h.kernel.get();
        assert!(!p.is_null(), "no kernel installed in the simulation");
        assert!(!h.in_kernel.get());
        h.in_kernel.set(true);
        // Safety: the pointer was installed from a live `&mut Kernel` by
        // `enter`, which outlives this call; the flag above makes the
        // borrow exclusive.
        let k = unsafe { &mut *(p as *mut Kernel<'static>) };
        let r = f(k);
        h.in_kernel.set(false);
        r
    })
}

/// Installs `k` as the simulated machine's kernel for the duration of
/// `f`, on `cpu`.
fn enter<R>(k: &mut Kernel<'_>, cpu: usize, f: impl FnOnce() -> R) -> R {
    assert!(cpu < SIM_CPUS);
    HOST.with(|h| {
        assert!(h.kernel.get().is_null(), "simulation re-entered");
        h.current_cpu.set(cpu);
        h.kernel.set(k as *mut Kernel<'_> as *mut ());
    });
    let r = f();
    HOST.with(|h| h.kernel.set(core::ptr::null_mut()));
    r
}

/// This CPU's identity.
pub fn cpu_this() -> u8 {
    HOST.with(|h| h.current_cpu.get() as u8)
}

/// Selects the CPU that subsequent boot-glue calls (region programming,
/// per-CPU init) apply to. Dispatch entry points select their own.
pub fn select_cpu(cpu: usize) {
    assert!(cpu < SIM_CPUS);
    HOST.with(|h| h.current_cpu.set(cpu));
}

/// Writes a synthetic frame at the top of a priority stack.
pub fn frame_alloc(
    stack_top: usize,
    entry: usize,
    restart: bool,
) -> FramePtr {
    let addr = (stack_top - FRAME_SIZE) & !(core::mem::align_of::<Frame>() - 1);
    let p = addr as *mut Frame;
    // Safety: the caller hands us the top of a configured priority
    // stack, which the boot glue allocated and which has no live frame
    // (the previous occupant of this level is gone or never existed).
    unsafe {
        p.write(Frame {
            entry,
            arg: 0,
            restart: restart as usize,
        });
    }
    FramePtr(p)
}

/// Patches the argument register of a frame.
pub fn frame_set_arg(frame: FramePtr, arg: usize) {
    assert!(frame != FramePtr::NULL);
    // Safety: frames live either in priority stacks or in dispatch-loop
    // locals, both outliving the kernel entry that patches them.
    unsafe {
        (*frame.0).arg = arg;
    }
}

/// Records the architectural priority mask. The simulation's actual
/// masking is done by the interrupt controller's service state, so this
/// is observability only.
pub fn set_intr_level(level: u8) {
    HOST.with(|h| h.level[h.current_cpu.get()].set(level));
}

/// Loads a full region set into the simulated protection unit.
pub fn apply_regions(regions: &[Region; REGIONS_PER_ACTOR]) {
    HOST.with(|h| {
        h.mpu.borrow_mut()[h.current_cpu.get()] = *regions;
    });
}

/// Rewrites a single region slot.
pub fn update_region(index: usize, region: &Region) {
    HOST.with(|h| {
        h.mpu.borrow_mut()[h.current_cpu.get()][index] = *region;
    });
}

/// Requests service of `vect` on `cpu`: directly into the local
/// controller, or via the doorbell bitmap for a peer, exactly the
/// two-stage dance a multi-core port performs.
pub fn interrupt_request(cpu: u8, vect: u8) {
    HOST.with(|h| {
        let cpu = usize::from(cpu);
        assert!(cpu < SIM_CPUS);
        if cpu == h.current_cpu.get() {
            let _ = h.pics.borrow_mut()[cpu].request(vect);
        } else {
            h.ipi[cpu].set(h.ipi[cpu].get() | 1 << vect);
        }
    });
}

/// Drains this CPU's doorbell bitmap into its local controller — the
/// doorbell interrupt handler's job.
fn drain_doorbell(cpu: usize) {
    HOST.with(|h| {
        let mut bits = h.ipi[cpu].replace(0);
        let mut pics = h.pics.borrow_mut();
        while bits != 0 {
            let vect = (31 - bits.leading_zeros()) as u8;
            bits &= !(1 << vect);
            let _ = pics[cpu].request(vect);
        }
    });
}

/// True if `cpu` has undelivered doorbell or controller work.
pub fn cpu_has_work(cpu: usize) -> bool {
    HOST.with(|h| {
        h.ipi[cpu].get() != 0 || h.pics.borrow()[cpu].has_runnable()
    })
}

/// The region set currently loaded for `cpu`, for test assertions.
pub fn current_regions(cpu: usize) -> [Region; REGIONS_PER_ACTOR] {
    HOST.with(|h| h.mpu.borrow()[cpu])
}

/// The architectural priority mask last set on `cpu`.
pub fn current_level(cpu: usize) -> u8 {
    HOST.with(|h| h.level[cpu].get())
}

/// Restart marker carried by the most recently launched frame; what the
/// usermode crt would see on hardware.
pub fn last_restart_marker() -> bool {
    HOST.with(|h| h.last_restart.get())
}

/// Simulated synchronous syscall, for the usermode shim. Must be called
/// from within actor code running under the dispatcher.
pub fn syscall(word: u32) -> usize {
    let cpu = HOST.with(|h| h.current_cpu.get());
    let frame = HOST.with(|h| {
        *h.frames.borrow().last().expect("syscall outside actor")
    });
    let next = with_kernel(|k| k.svc_handler(cpu, word, frame));
    assert!(
        next == frame,
        "asynchronous syscalls must be issued by returning the word",
    );
    // Anything the call made runnable preempts before the caller sees
    // the result, as it would on hardware.
    dispatch_pending();
    // Safety: `frame` is the live top-of-stack frame for this actor.
    unsafe { (*frame.0).arg }
}

/// Simulated hardware fault: aborts the calling actor as if the
/// protection unit had refused an access.
pub fn trap(fault: FaultInfo) -> ! {
    panic::panic_any(SimFault(fault))
}

/// Services everything deliverable on the current CPU.
fn dispatch_pending() {
    let cpu = HOST.with(|h| h.current_cpu.get());
    loop {
        drain_doorbell(cpu);
        let runnable =
            HOST.with(|h| h.pics.borrow()[cpu].has_runnable());
        if !runnable {
            break;
        }
        let vect = HOST.with(|h| h.pics.borrow_mut()[cpu].start());

        // The marker stands for the context this vector interrupted; the
        // kernel hands it back when the level's actor leaves.
        let mut marker = Frame::default();
        let prev = FramePtr(&mut marker);
        let next = with_kernel(|k| k.intr_handler(cpu, vect, prev));
        if next != prev {
            run_actor(next, prev);
        }
        let _ = HOST.with(|h| h.pics.borrow_mut()[cpu].done());
    }
}

/// The usermode trampoline: repeatedly enters the actor whose frame this
/// is, feeding returned syscall words to the kernel, until the kernel
/// unwinds to `marker`.
fn run_actor(frame: FramePtr, marker: FramePtr) {
    let cpu = HOST.with(|h| h.current_cpu.get());
    HOST.with(|h| {
        h.frames.borrow_mut().push(frame);
        // Safety: freshly built frame in a live priority stack.
        h.last_restart.set(unsafe { (*frame.0).restart != 0 });
    });

    loop {
        // Safety: the frame stays valid while its actor is live; nothing
        // reuses this priority's stack until the kernel retires it.
        let (entry, arg) = unsafe { ((*frame.0).entry, (*frame.0).arg) };
        // Safety: `entry` was produced from an `ActorEntry` by the host
        // boot glue; this is the inverse cast.
        let func: ActorEntry = unsafe { core::mem::transmute(entry) };

        let word = match panic::catch_unwind(AssertUnwindSafe(|| func(arg)))
        {
            Ok(word) => word,
            Err(payload) => match payload.downcast::<SimFault>() {
                Ok(fault) => {
                    let next =
                        with_kernel(|k| k.trap_handler(cpu, fault.0));
                    assert!(next == marker);
                    break;
                }
                Err(payload) => panic::resume_unwind(payload),
            },
        };

        let next = with_kernel(|k| k.svc_handler(cpu, word, frame));
        if next == marker {
            break;
        }
        assert!(next == frame);
        // Synchronous call: give anything it readied its chance to
        // preempt, then re-enter the actor.
        dispatch_pending();
    }

    HOST.with(|h| {
        let popped = h.frames.borrow_mut().pop();
        assert!(popped == Some(frame));
    });
}

/// Services all pending work on `cpu`. The simulation's equivalent of
/// taking the backing interrupt.
pub fn run(k: &mut Kernel<'_>, cpu: usize) {
    enter(k, cpu, dispatch_pending);
}

/// Advances `cpu`'s kernel tick, then services whatever that woke.
pub fn tick(k: &mut Kernel<'_>, cpu: usize) {
    enter(k, cpu, || {
        with_kernel(|kk| kk.tick(cpu));
        dispatch_pending();
    });
}

/// Round-robins every simulated CPU until none has deliverable work —
/// doorbells included. Returns the number of service passes made.
pub fn run_until_quiet(k: &mut Kernel<'_>) -> usize {
    let mut passes = 0;
    loop {
        let mut moved = false;
        for cpu in 0..SIM_CPUS {
            if cpu_has_work(cpu) {
                run(k, cpu);
                moved = true;
                passes += 1;
            }
        }
        if !moved {
            return passes;
        }
    }
}

/// Stand-in for `install` on hardware ports; the simulation installs the
/// kernel per entry instead, so this only exists for API parity.
///
/// # Safety
///
/// Trivially safe here; see the hardware ports for the real contract.
pub unsafe fn install(_k: &mut Kernel<'_>) {}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup and the kernel-state singleton.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};

use abi::{TaskDesc, IDLE_PRIORITY, KHEAP_MAX_ORDER};

use crate::kernel::Kernel;

/// Home of the one kernel-state record on hardware. Host tests never touch
/// this; they build private `Kernel` values instead.
struct KernelCell(UnsafeCell<MaybeUninit<Kernel>>);

// Safety: the cell is written once during startup, before traps are live,
// and afterwards reached only from trap handlers, which the trap priority
// scheme runs one at a time.
unsafe impl Sync for KernelCell {}

static KERNEL: KernelCell =
    KernelCell(UnsafeCell::new(MaybeUninit::uninit()));
static KERNEL_READY: AtomicBool = AtomicBool::new(false);

/// Hands a trap handler the kernel state.
///
/// Callers must be serialized, which on hardware they are: every caller is
/// a kernel trap, and kernel traps cannot preempt one another. Calling this
/// from anywhere else would alias the kernel state and is not offered.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    assert!(
        KERNEL_READY.load(Ordering::Acquire),
        "kernel entered before start_kernel"
    );
    // Safety: initialized per the flag; exclusive per the serialization
    // contract above.
    let kernel = unsafe { (*KERNEL.0.get()).assume_init_mut() };
    f(kernel)
}

// Kernel heap backing. The alignment must equal the heap size so buddy
// blocks are naturally aligned in absolute terms as well.
static_assertions::const_assert_eq!(1usize << KHEAP_MAX_ORDER, 4096);

#[repr(align(4096))]
struct KheapBacking([u8; 1 << KHEAP_MAX_ORDER]);

#[cfg_attr(target_os = "none", link_section = ".kheap")]
static mut KHEAP_BACKING: KheapBacking =
    KheapBacking([0; 1 << KHEAP_MAX_ORDER]);

const IDLE_STACK_SIZE: u32 = 256;

#[repr(align(256))]
struct IdleStack([usize; IDLE_STACK_SIZE as usize / core::mem::size_of::<usize>()]);

#[cfg_attr(target_os = "none", link_section = ".static_stacks")]
static mut IDLE_STACK: IdleStack =
    IdleStack([0; IDLE_STACK_SIZE as usize / core::mem::size_of::<usize>()]);

/// The task that runs when nothing else can: lowest priority, effectively
/// infinite quantum, and a sleep instruction per iteration so idle time is
/// spent in low power.
fn idle_main(_arg: usize) {
    loop {
        crate::arch::wait_for_interrupt();
    }
}

/// The main kernel entry point.
///
/// The application provides its own `main`-equivalent, which does basic
/// hardware setup (clocks, board bring-up) and then calls this. `setup` is
/// the application boot hook: it runs after kernel initialization, before
/// the first dispatch, and is where the application creates its tasks.
///
/// `tick_divisor` is the platform's conversion from machine ticks to kernel
/// ticks; on ARM M-profile it is CPU cycles per tick, where a tick is
/// typically a millisecond.
///
/// # Safety
///
/// This can be called exactly once per boot, before any kernel trap can
/// fire.
pub unsafe fn start_kernel(tick_divisor: u32, setup: fn()) -> ! {
    klog!("starting: allocators");
    // Safety: single boot-time caller, per our own contract; the backing
    // statics are referenced nowhere else.
    let kernel = unsafe {
        Kernel::new(core::ptr::addr_of_mut!(KHEAP_BACKING).cast())
    };
    // Safety: first and only write to the cell.
    unsafe {
        (*KERNEL.0.get()).write(kernel);
    }
    KERNEL_READY.store(true, Ordering::Release);

    crate::arch::install_static_regions();
    crate::arch::configure_traps();
    crate::arch::setup_tick(tick_divisor);

    klog!("starting: idle task");
    let idle_desc = TaskDesc {
        entry: idle_main,
        arg: 0,
        // Safety: the idle stack static is referenced only here.
        stack: unsafe { core::ptr::addr_of_mut!(IDLE_STACK).cast() },
        stack_size: IDLE_STACK_SIZE,
        dynamic_stack: false,
        priority: IDLE_PRIORITY,
        quantum: u32::MAX,
        regions: &[],
    };
    with_kernel(|k| k.make_task(&idle_desc))
        .expect("idle task creation failed");

    setup();

    klog!("starting: moira");
    crate::arch::start_first_task()
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User application support library for Moira.
//!
//! This contains the syscall stubs, the user heap, and re-exports of the
//! ABI and lock-free primitives that user code shares with the kernel.
//!
//! # Syscall stub implementations
//!
//! Each syscall is a tiny assembly stub: the arguments are already in
//! `r0`-`r3` per the calling convention, which is exactly where the
//! hardware stacks them on trap entry, so the stub only has to issue the
//! `svc` with the right immediate and return. The kernel writes the result
//! over the stacked `r0`, which the exception return hands back to us as
//! the stub's return value.
//!
//! On non-ARM targets the stubs panic: host builds of this crate exist for
//! type-checking and for testing the parts with no trap underneath them
//! (the user heap).
//!
//! # Control blocks
//!
//! `Mutex` and `Sem` values are allocated by user code -- statics are the
//! common case -- and passed by reference. The kernel takes the control
//! block over for the duration of each trap; user code must never poke the
//! fields itself.

#![cfg_attr(not(test), no_std)]

use core::convert::TryFrom;

pub use abi::*;
pub use lockless::{MsgBlock, MsgQueue, NbSem, QueueStatus};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        mod sys {
            // One stub per syscall; the immediate byte is the contract
            // (see `abi::Sysnum`).
            core::arch::global_asm! {"
                .section .text.moira_syscall_stubs
                .thumb_func
                .globl sys_task_make
                sys_task_make:
                    svc #0x11
                    bx lr

                .thumb_func
                .globl sys_task_unblock
                sys_task_unblock:
                    svc #0x22
                    bx lr

                .thumb_func
                .globl sys_task_delay_cancel
                sys_task_delay_cancel:
                    svc #0x33
                    bx lr

                .thumb_func
                .globl sys_task_finish
                sys_task_finish:
                    svc #0x40
                    bx lr

                .thumb_func
                .globl sys_kernel_alloc
                sys_kernel_alloc:
                    svc #0x55
                    bx lr

                .thumb_func
                .globl sys_kernel_free
                sys_kernel_free:
                    svc #0x66
                    bx lr

                .thumb_func
                .globl sys_sem_take
                sys_sem_take:
                    svc #0x77
                    bx lr

                .thumb_func
                .globl sys_sem_put
                sys_sem_put:
                    svc #0x88
                    bx lr

                .thumb_func
                .globl sys_sem_delete
                sys_sem_delete:
                    svc #0x99
                    bx lr

                .thumb_func
                .globl sys_mutex_delete
                sys_mutex_delete:
                    svc #0xA0
                    bx lr

                .thumb_func
                .globl sys_mutex_put
                sys_mutex_put:
                    svc #0xB0
                    bx lr

                .thumb_func
                .globl sys_mutex_take
                sys_mutex_take:
                    svc #0xC0
                    bx lr

                .thumb_func
                .globl sys_task_yield
                sys_task_yield:
                    svc #0xD0
                    bx lr

                .thumb_func
                .globl sys_task_block
                sys_task_block:
                    svc #0xE0
                    bx lr

                .thumb_func
                .globl sys_task_delay
                sys_task_delay:
                    svc #0xF0
                    bx lr
            "}

            extern "C" {
                pub fn sys_task_make(desc: *const super::TaskDesc) -> u32;
                pub fn sys_task_unblock(task: u32) -> u32;
                pub fn sys_task_delay_cancel(task: u32) -> u32;
                pub fn sys_task_finish() -> u32;
                pub fn sys_kernel_alloc(size: u32) -> usize;
                pub fn sys_kernel_free(block: usize, size: u32) -> u32;
                pub fn sys_sem_take(sem: usize, wait: u32) -> u32;
                pub fn sys_sem_put(sem: usize) -> u32;
                pub fn sys_sem_delete(sem: usize) -> u32;
                pub fn sys_mutex_delete(mutex: usize) -> u32;
                pub fn sys_mutex_put(mutex: usize) -> u32;
                pub fn sys_mutex_take(mutex: usize, wait: u32) -> u32;
                pub fn sys_task_yield() -> u32;
                pub fn sys_task_block() -> u32;
                pub fn sys_task_delay(ticks: u32, cb: usize, arg: usize) -> u32;
            }
        }
    } else {
        /// Host stand-ins: these exist so this crate type-checks and its
        /// trap-free parts can be tested off-target.
        mod sys {
            #![allow(clippy::missing_safety_doc)]

            pub unsafe fn sys_task_make(_: *const super::TaskDesc) -> u32 {
                unimplemented!("syscalls require the ARM target")
            }
            pub unsafe fn sys_task_unblock(_: u32) -> u32 {
                unimplemented!("syscalls require the ARM target")
            }
            pub unsafe fn sys_task_delay_cancel(_: u32) -> u32 {
                unimplemented!("syscalls require the ARM target")
            }
            pub unsafe fn sys_task_finish() -> u32 {
                unimplemented!("syscalls require the ARM target")
            }
            pub unsafe fn sys_kernel_alloc(_: u32) -> usize {
                unimplemented!("syscalls require the ARM target")
            }
            pub unsafe fn sys_kernel_free(_: usize, _: u32) -> u32 {
                unimplemented!("syscalls require the ARM target")
            }
            pub unsafe fn sys_sem_take(_: usize, _: u32) -> u32 {
                unimplemented!("syscalls require the ARM target")
            }
            pub unsafe fn sys_sem_put(_: usize) -> u32 {
                unimplemented!("syscalls require the ARM target")
            }
            pub unsafe fn sys_sem_delete(_: usize) -> u32 {
                unimplemented!("syscalls require the ARM target")
            }
            pub unsafe fn sys_mutex_delete(_: usize) -> u32 {
                unimplemented!("syscalls require the ARM target")
            }
            pub unsafe fn sys_mutex_put(_: usize) -> u32 {
                unimplemented!("syscalls require the ARM target")
            }
            pub unsafe fn sys_mutex_take(_: usize, _: u32) -> u32 {
                unimplemented!("syscalls require the ARM target")
            }
            pub unsafe fn sys_task_yield() -> u32 {
                unimplemented!("syscalls require the ARM target")
            }
            pub unsafe fn sys_task_block() -> u32 {
                unimplemented!("syscalls require the ARM target")
            }
            pub unsafe fn sys_task_delay(_: u32, _: usize, _: usize) -> u32 {
                unimplemented!("syscalls require the ARM target")
            }
        }
    }
}

fn status_from(raw: u32) -> Status {
    Status::try_from(raw).expect("non-status value from kernel")
}

/// Creates a task from `desc`. Returns its handle, or `None` on a bad
/// descriptor or resource exhaustion. The new task may preempt the caller
/// before this returns. Callable from interrupt context.
pub fn task_make(desc: &TaskDesc) -> Option<TaskId> {
    // Safety: trap; the kernel reads the descriptor during the call only.
    let raw = unsafe { sys::sys_task_make(desc) };
    TaskId::from_raw(raw)
}

/// Delays the calling task for `ticks` (which must be nonzero -- use
/// [`task_yield`] to give up the CPU without sleeping). The optional
/// `callback` runs at expiry, in handler mode, with the woken task's
/// handle and `arg`; be brief in it.
///
/// Returns `Ok` when the delay elapsed, or `Woken` if another task
/// cancelled it early. The wake has a jitter of up to one tick early,
/// since the delay is counted in whole tick boundaries.
pub fn task_delay(
    ticks: u32,
    callback: Option<fn(TaskId, usize)>,
    arg: usize,
) -> Status {
    let cb = callback.map(|f| f as usize).unwrap_or(0);
    // Safety: trap.
    status_from(unsafe { sys::sys_task_delay(ticks, cb, arg) })
}

/// Wakes a delayed task early with `Woken`, skipping its callback.
/// Callable from interrupt context.
pub fn task_delay_cancel(task: TaskId) -> Status {
    // Safety: trap.
    status_from(unsafe { sys::sys_task_delay_cancel(task.into_raw()) })
}

/// Parks the calling task until another task or an ISR unblocks it.
pub fn task_block() -> Status {
    // Safety: trap.
    status_from(unsafe { sys::sys_task_block() })
}

/// Makes a blocked task runnable; it may preempt the caller. Callable from
/// interrupt context.
pub fn task_unblock(task: TaskId) -> Status {
    // Safety: trap.
    status_from(unsafe { sys::sys_task_unblock(task.into_raw()) })
}

/// Offers the CPU to a ready task of the same priority, failing
/// `CantYield` if there is none.
pub fn task_yield() -> Status {
    // Safety: trap.
    status_from(unsafe { sys::sys_task_yield() })
}

/// Ends the calling task. Every held resource must be released first;
/// finishing while holding a mutex halts the system.
pub fn task_finish() -> Status {
    // Safety: trap.
    status_from(unsafe { sys::sys_task_finish() })
}

/// Allocates from the kernel heap. Null on exhaustion. Callable from
/// interrupt context, though allocating in an ISR is rarely a good idea.
pub fn kernel_alloc(size: u32) -> *mut u8 {
    // Safety: trap.
    unsafe { sys::sys_kernel_alloc(size) as *mut u8 }
}

/// Returns a kernel-heap block.
///
/// # Safety
///
/// `block` must be a live allocation of `size` bytes from
/// [`kernel_alloc`].
pub unsafe fn kernel_free(block: *mut u8, size: u32) {
    // Safety: trap.
    let _ = unsafe { sys::sys_kernel_free(block as usize, size) };
}

/// Takes `m`, waiting per `wait`. Resumes with `Ok`, `Timeout`, or
/// `Deleted`; `WouldBlock` if `wait` was `Never` and the mutex was held.
pub fn mutex_take(m: &Mutex, wait: Wait) -> Status {
    // Safety: trap; the kernel owns the control block during it.
    status_from(unsafe {
        sys::sys_mutex_take(m as *const Mutex as usize, wait.into_raw())
    })
}

/// Releases `m`; fails `NotOwner` unless the caller took it.
pub fn mutex_put(m: &Mutex) -> Status {
    // Safety: trap.
    status_from(unsafe { sys::sys_mutex_put(m as *const Mutex as usize) })
}

/// Deletes `m`, waking every waiter with `Deleted`. Owner only.
pub fn mutex_delete(m: &Mutex) -> Status {
    // Safety: trap.
    status_from(unsafe { sys::sys_mutex_delete(m as *const Mutex as usize) })
}

/// Takes a permit from `s`, waiting per `wait`. From interrupt context the
/// wait is ignored and treated as `Never`.
pub fn sem_take(s: &Sem, wait: Wait) -> Status {
    // Safety: trap.
    status_from(unsafe {
        sys::sys_sem_take(s as *const Sem as usize, wait.into_raw())
    })
}

/// Returns a permit to `s`, waking the most important waiter if any.
/// Callable from interrupt context.
pub fn sem_put(s: &Sem) -> Status {
    // Safety: trap.
    status_from(unsafe { sys::sys_sem_put(s as *const Sem as usize) })
}

/// Resets `s`; fails `CantDelete` while permits are outstanding. Callable
/// from interrupt context.
pub fn sem_delete(s: &Sem) -> Status {
    // Safety: trap.
    status_from(unsafe { sys::sys_sem_delete(s as *const Sem as usize) })
}

// --- User heap ---------------------------------------------------------

// The user heap lives in unprivileged-writable memory and is carved up
// without entering the kernel. Concurrent users are fenced only against
// context switches (and only for privileged callers -- BASEPRI writes from
// unprivileged code are ignored), matching the original design: tasks that
// share the heap serialize among themselves.

static_assertions::const_assert_eq!(1usize << UHEAP_MAX_ORDER, 4096);

#[repr(align(4096))]
struct UheapBacking([u8; 1 << UHEAP_MAX_ORDER]);

#[cfg_attr(target_os = "none", link_section = ".uheap")]
static mut UHEAP_BACKING: UheapBacking =
    UheapBacking([0; 1 << UHEAP_MAX_ORDER]);

struct UserHeapCell(core::cell::UnsafeCell<Option<buddy::BuddyHeap>>);

// Safety: access is serialized by the fence/single-context contract
// described above.
unsafe impl Sync for UserHeapCell {}

static USER_HEAP: UserHeapCell =
    UserHeapCell(core::cell::UnsafeCell::new(None));

fn with_user_heap<R>(f: impl FnOnce(&mut buddy::BuddyHeap) -> R) -> R {
    context_switch_fence(|| {
        // Safety: serialized per the cell's contract; the backing static
        // is referenced only here.
        let slot = unsafe { &mut *USER_HEAP.0.get() };
        let heap = match slot {
            Some(heap) => heap,
            None => slot.insert(unsafe {
                buddy::BuddyHeap::new(
                    core::ptr::addr_of_mut!(UHEAP_BACKING).cast(),
                    UHEAP_MIN_ORDER,
                    UHEAP_MAX_ORDER,
                )
            }),
        };
        f(heap)
    })
}

fn context_switch_fence<R>(f: impl FnOnce() -> R) -> R {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "arm")] {
            let saved = cortex_m::register::basepri::read();
            // Safety: raising BASEPRI defers interrupts, nothing more.
            unsafe { cortex_m::register::basepri::write(15 << 4); }
            cortex_m::asm::isb();
            let result = f();
            // Safety: restoring the saved value.
            unsafe { cortex_m::register::basepri::write(saved); }
            result
        } else {
            f()
        }
    }
}

fn in_unprivileged_thread() -> bool {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "arm")] {
            !cortex_m::register::control::read().npriv().is_privileged()
        } else {
            true
        }
    }
}

/// Allocates from the user heap, without a trap. Returns null on
/// exhaustion, or when called from anywhere but unprivileged thread mode.
pub fn user_alloc(size: u32) -> *mut u8 {
    if !in_unprivileged_thread() {
        return core::ptr::null_mut();
    }
    with_user_heap(|heap| heap.alloc_bytes(size))
}

/// Returns a block to the user heap. Silently does nothing outside
/// unprivileged thread mode.
///
/// # Safety
///
/// `block` must be a live allocation of `size` bytes from [`user_alloc`].
pub unsafe fn user_free(block: *mut u8, size: u32) {
    if !in_unprivileged_thread() {
        return;
    }
    with_user_heap(|heap| {
        // Safety: forwarded caller contract.
        unsafe { heap.free_bytes(block, size) }
    })
}

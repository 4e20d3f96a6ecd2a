// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall dispatch.
//!
//! The architecture layer recovers three things from a supervisor-call
//! trap: the immediate byte of the `svc` instruction, a pointer to the
//! caller's stacked exception frame, and whether the trap came from thread
//! or interrupt context. Everything after that happens here.
//!
//! The immediate byte doubles as the permission record (see
//! [`abi::Sysnum`]): it is masked by the caller's context before decoding,
//! and a byte that masks to nothing is answered with `WrongContext`.
//!
//! Results are written into the stacked `r0` slot of the frame, which
//! becomes the caller's return value when the trap returns. Handlers that
//! park the caller still write a synchronous status; if the wait later ends
//! another way, the waker overwrites the slot through the task's saved
//! stack pointer (see `tcb::Tcb::set_wait_result`).
//!
//! Object arguments (mutexes, semaphores, task descriptors) arrive as raw
//! addresses in the frame. The kernel null-checks them and otherwise trusts
//! them, as the original design does; they refer to caller-owned control
//! blocks the kernel takes over for the duration of the trap.

use abi::{CallerContext, Status, Sysnum, TaskDesc, TaskId, Wait};

#[cfg(feature = "mutex")]
use abi::Mutex;
#[cfg(feature = "semaphore")]
use abi::Sem;

use crate::kernel::Kernel;
use crate::sched::TickEvent;
use crate::tcb::{ExceptionFrame, WakeCallback};

/// Decodes and runs one syscall against the kernel state, leaving the
/// result in the frame's `r0` slot.
pub fn dispatch(
    k: &mut Kernel,
    raw: u8,
    ctx: CallerContext,
    frame: &mut ExceptionFrame,
) {
    let Ok(nr) = Sysnum::from_masked(raw & ctx.mask()) else {
        frame.r0 = Status::WrongContext as u32 as usize;
        return;
    };

    let status = match nr {
        // The two allocation-flavored calls return an address-or-null
        // instead of a status.
        Sysnum::TaskMake => {
            let desc = frame.r0 as *const TaskDesc;
            frame.r0 = if desc.is_null() {
                0
            } else {
                // Safety: non-null caller-owned descriptor; read-only here.
                let desc = unsafe { &*desc };
                k.make_task(desc)
                    .map(|id| id.into_raw() as usize)
                    .unwrap_or(0)
            };
            return;
        }
        Sysnum::KernelAlloc => {
            frame.r0 = k.kernel_alloc(frame.r0 as u32) as usize;
            return;
        }

        Sysnum::KernelFree => {
            // Safety: the caller asserts this block came from kernel-alloc
            // with this size; the heap ignores out-of-range orders.
            unsafe {
                k.kernel_free(frame.r0 as *mut u8, frame.r1 as u32);
            }
            Status::Ok
        }

        Sysnum::TaskUnblock => match TaskId::from_raw(frame.r0 as u32) {
            Some(id) => k.unblock(id),
            None => Status::BadParameters,
        },
        Sysnum::TaskDelayCancel => match TaskId::from_raw(frame.r0 as u32) {
            Some(id) => k.delay_cancel(id),
            None => Status::BadParameters,
        },
        Sysnum::TaskDelay => {
            let callback = if frame.r1 == 0 {
                WakeCallback::None
            } else {
                // Safety: a nonzero r1 is the address of the caller's
                // expiry callback, per the stub contract.
                let f: fn(TaskId, usize) =
                    unsafe { core::mem::transmute(frame.r1) };
                WakeCallback::User(f, frame.r2)
            };
            k.delay_current(frame.r0 as u32, callback)
        }
        Sysnum::TaskBlock => k.block_current(),
        Sysnum::TaskYield => k.yield_current(),
        Sysnum::TaskFinish => k.finish_task(),
        Sysnum::StartFirstTask => k.start_first(),

        Sysnum::TickEvent => {
            k.handle_tick_event(TickEvent::from_bits_truncate(
                frame.r0 as u32,
            ));
            Status::Ok
        }

        #[cfg(feature = "mutex")]
        Sysnum::MutexTake => {
            // Safety: null-checked caller-owned control block; the kernel
            // owns its state for the duration of the trap.
            match unsafe { (frame.r0 as *const Mutex).as_ref() } {
                Some(m) => {
                    let state = unsafe { &mut *m.state_ptr() };
                    k.mutex_take(state, Wait::from_raw(frame.r1 as u32))
                }
                None => Status::BadParameters,
            }
        }
        #[cfg(feature = "mutex")]
        Sysnum::MutexPut => {
            // Safety: as above.
            match unsafe { (frame.r0 as *const Mutex).as_ref() } {
                Some(m) => k.mutex_put(unsafe { &mut *m.state_ptr() }),
                None => Status::BadParameters,
            }
        }
        #[cfg(feature = "mutex")]
        Sysnum::MutexDelete => {
            // Safety: as above.
            match unsafe { (frame.r0 as *const Mutex).as_ref() } {
                Some(m) => k.mutex_delete(unsafe { &mut *m.state_ptr() }),
                None => Status::BadParameters,
            }
        }
        #[cfg(not(feature = "mutex"))]
        Sysnum::MutexTake | Sysnum::MutexPut | Sysnum::MutexDelete => {
            Status::BadParameters
        }

        #[cfg(feature = "semaphore")]
        Sysnum::SemTake => {
            // Safety: null-checked caller-owned control block; the kernel
            // owns its state for the duration of the trap.
            match unsafe { (frame.r0 as *const Sem).as_ref() } {
                Some(s) => {
                    // An interrupt-context taker can never park, whatever
                    // wait it asked for.
                    let wait = if ctx == CallerContext::Interrupt {
                        Wait::Never
                    } else {
                        Wait::from_raw(frame.r1 as u32)
                    };
                    k.sem_take(unsafe { &mut *s.state_ptr() }, wait)
                }
                None => Status::BadParameters,
            }
        }
        #[cfg(feature = "semaphore")]
        Sysnum::SemPut => {
            // Safety: as above.
            match unsafe { (frame.r0 as *const Sem).as_ref() } {
                Some(s) => k.sem_put(unsafe { &mut *s.state_ptr() }),
                None => Status::BadParameters,
            }
        }
        #[cfg(feature = "semaphore")]
        Sysnum::SemDelete => {
            // Safety: as above.
            match unsafe { (frame.r0 as *const Sem).as_ref() } {
                Some(s) => k.sem_delete(unsafe { &mut *s.state_ptr() }),
                None => Status::BadParameters,
            }
        }
        #[cfg(not(feature = "semaphore"))]
        Sysnum::SemTake | Sysnum::SemPut | Sysnum::SemDelete => {
            Status::BadParameters
        }
    };

    frame.r0 = status as u32 as usize;
}

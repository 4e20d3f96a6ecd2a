// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M.
//!
//! # Notes on ARM-M interrupts
//!
//! The kernel owns three exception vectors:
//!
//! - `SVCall` implements the `SVC` instruction used to make syscalls.
//! - `SysTick` handles the periodic tick and only *counts*; any queue work
//!   it discovers is bounced back through a `tick-event` SVC so it runs at
//!   syscall priority.
//! - `PendSV` performs deferred context switches.
//!
//! Priorities make this scheme work: SVCall sits just below the faults,
//! SysTick and PendSV sit at the very bottom, and user interrupts live in
//! between. A syscall handler therefore always finishes its queue
//! mutations before a tick or context switch can observe them, and a
//! context switch requested from any kernel path becomes visible only
//! after the requesting trap unwinds.
//!
//! On any exception the hardware stacks `r0-r3, r12, lr, pc, xPSR` on the
//! interrupted context's stack. The callee-saved half (`r4-r11`) is only
//! saved by `PendSV`, onto the outgoing task's stack below the hardware
//! frame, with the resulting stack pointer recorded in the TCB. This is
//! why syscall results can be delivered to a parked task by poking a fixed
//! offset above its saved stack pointer, and why the SVC entry sequence
//! itself saves nothing: if the syscall parks the caller, the registers
//! are still live and PendSV will capture them on its way out.

use core::arch::global_asm;
use core::sync::atomic::{AtomicPtr, Ordering};

use abi::CallerContext;

use crate::tcb::Tcb;

/// On ARMv7-M we have to use a global to record the current task pointer,
/// since we don't have a scratch register; the context-switch assembly
/// reaches the TCB through this.
#[no_mangle]
static CURRENT_TASK_PTR: AtomicPtr<Tcb> =
    AtomicPtr::new(core::ptr::null_mut());

/// Trap priorities, in hardware form (upper nibble of an 8-bit field with
/// four implemented bits). Syscalls just below the faults; tick and
/// deferred switch at the bottom; user interrupts use 2..=14.
const SYSCALL_PRIORITY: u8 = 1 << 4;
const USER_ISR_FLOOR: u8 = 2 << 4;
const LOW_PRIORITY: u8 = 15 << 4;

/// EXC_RETURN for entering a task: thread mode, process stack, basic
/// frame. Floating-point context save is out of scope, so the extended
/// frame forms never appear.
const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

// Handler for the Supervisor Call instruction. The symbol name is what the
// vector table (cortex-m-rt convention) expects.
//
// The frame location and the context mask both fall out of EXC_RETURN bit
// 2: a caller running on the process stack is a task, anything on the main
// stack is an interrupt -- including the one startup call issued from
// privileged thread mode, which is exactly why start-first-task is encoded
// as interrupt-callable.
global_asm! {"
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
    .thumb_func
    SVCall:
        @ Which stack holds the caller's frame?
        tst lr, #4
        beq 1f
        mrs r1, psp
        movs r2, #0
        b 2f
    1:  mrs r1, msp
        movs r2, #1
    2:  @ The syscall number is the immediate of the SVC instruction
        @ itself; the stacked PC points just past it.
        ldr r3, [r1, #24]
        ldrb r0, [r3, #-2]
        push {{r4, lr}}
        bl svcall_entry
        pop {{r4, pc}}
"}

/// Rust side of the SVC handler.
#[no_mangle]
unsafe extern "C" fn svcall_entry(
    nr: u32,
    frame: *mut crate::tcb::ExceptionFrame,
    from_main_stack: u32,
) {
    let ctx = if from_main_stack != 0 {
        CallerContext::Interrupt
    } else {
        CallerContext::Thread
    };
    crate::startup::with_kernel(|k| {
        // Safety: the entry sequence hands us the caller's live stacked
        // frame; nothing else touches it while the trap runs.
        crate::syscalls::dispatch(k, nr as u8, ctx, unsafe { &mut *frame })
    });
}

// Handler for PendSV, the deferred context switch.
global_asm! {"
    .section .text.PendSV
    .globl PendSV
    .type PendSV,function
    .thumb_func
    PendSV:
        @ Save the outgoing task's callee-saved registers below its
        @ hardware frame and record the result in its TCB (first field).
        mrs r0, psp
        stmdb r0!, {{r4-r11}}
        movw r1, #:lower16:CURRENT_TASK_PTR
        movt r1, #:upper16:CURRENT_TASK_PTR
        ldr r2, [r1]
        str r0, [r2]

        push {{r4, lr}}
        bl pendsv_entry
        pop {{r4, lr}}

        @ Resume whoever is current now -- possibly someone else.
        movw r1, #:lower16:CURRENT_TASK_PTR
        movt r1, #:upper16:CURRENT_TASK_PTR
        ldr r2, [r1]
        ldr r0, [r2]
        ldmia r0!, {{r4-r11}}
        str r0, [r2]
        msr psp, r0
        bx lr
"}

/// Rust side of the PendSV handler: promotes the pending task and installs
/// its isolation regions while the assembly above holds its context.
#[no_mangle]
unsafe extern "C" fn pendsv_entry() {
    crate::startup::with_kernel(|k| {
        if let Some(id) = k.finish_context_switch() {
            let task = k.task(id);
            CURRENT_TASK_PTR
                .store(task as *const Tcb as *mut Tcb, Ordering::Relaxed);
            apply_memory_protection(task);
        }
    });
}

/// Tick interrupt: counts under the full critical section, then defers any
/// resulting queue work to syscall priority via the tick-event trap.
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    let ev =
        with_kernel_masked(|| crate::startup::with_kernel(|k| k.tick()));
    if !ev.is_empty() {
        // Safety: a trap with one register argument; the result written
        // back to our r0 is discarded.
        unsafe {
            core::arch::asm!(
                "svc #0x0F",
                in("r0") ev.bits(),
                lateout("r0") _,
                options(nostack),
            );
        }
    }
}

/// Requests a deferred context switch: PendSV will fire once every
/// higher-priority handler has unwound.
pub fn pend_context_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
}

/// Records the address of `task` as the current user task.
///
/// # Safety
///
/// This records a pointer that aliases `task`. As long as the pointer is
/// only read at trap entry, and the task being stored is in the task
/// table, this is fine.
pub unsafe fn set_current_task(task: *mut Tcb) {
    CURRENT_TASK_PTR.store(task, Ordering::Relaxed);
}

/// Scheduler fence: masks the tick and the deferred context switch,
/// leaving syscalls and user interrupts live. Effective only for
/// privileged callers; BASEPRI writes from unprivileged code are silently
/// ignored by the hardware.
pub fn with_context_switches_masked<R>(f: impl FnOnce() -> R) -> R {
    let saved = cortex_m::register::basepri::read();
    // Safety: raising BASEPRI can only defer interrupts, never corrupt
    // state.
    unsafe {
        cortex_m::register::basepri::write(LOW_PRIORITY);
    }
    cortex_m::asm::isb();
    let result = f();
    // Safety: restoring the saved value.
    unsafe {
        cortex_m::register::basepri::write(saved);
    }
    result
}

/// Full critical section: additionally masks user interrupts, so only
/// faults and syscalls (which cannot originate here) remain.
pub fn with_kernel_masked<R>(f: impl FnOnce() -> R) -> R {
    let saved = cortex_m::register::basepri::read();
    // Safety: as in `with_context_switches_masked`.
    unsafe {
        cortex_m::register::basepri::write(USER_ISR_FLOOR);
    }
    cortex_m::asm::isb();
    let result = f();
    // Safety: restoring the saved value.
    unsafe {
        cortex_m::register::basepri::write(saved);
    }
    result
}

pub fn in_unprivileged_thread() -> bool {
    !cortex_m::register::control::read().npriv().is_privileged()
}

pub fn wait_for_interrupt() {
    cortex_m::asm::dsb();
    cortex_m::asm::wfi();
}

/// Sets trap priorities and enables the configurable fault handlers.
pub fn configure_traps() {
    // Safety: we are only lowering priorities from their reset defaults,
    // which cannot cause surprise preemption.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // Distinguish MEMFAULT, BUSFAULT and USGFAULT from HardFault.
        scb.shcsr.modify(|x| x | 0b111 << 16);
        // SVCall (exception 11), PendSV (14), SysTick (15).
        scb.shpr[7].write(SYSCALL_PRIORITY);
        scb.shpr[10].write(LOW_PRIORITY);
        scb.shpr[11].write(LOW_PRIORITY);
    }
}

/// Programs the system tick timer for periodic interrupts.
pub fn setup_tick(tick_divisor: u32) {
    // Safety: timer configuration; safe in practice, unsafe in API.
    unsafe {
        let syst = &*cortex_m::peripheral::SYST::PTR;
        syst.rvr.write(tick_divisor - 1);
        syst.cvr.write(0);
        // Processor clock, interrupt on wrap, counter on.
        syst.csr.modify(|v| v | 0b111);
    }
}

#[cfg(feature = "mpu")]
const MPU_ENABLE: u32 = 0b001;
#[cfg(feature = "mpu")]
const MPU_PRIVDEFENA: u32 = 0b100;

/// Installs the kernel-wide static regions. Called once at startup.
#[cfg(feature = "mpu")]
pub fn install_static_regions() {
    let mpu = unsafe {
        // At least by not taking a &mut we're confident we're not
        // violating aliasing....
        &*cortex_m::peripheral::MPU::PTR
    };
    // Safety: loading regions with the MPU disabled has no effect until
    // it is re-enabled below.
    unsafe {
        mpu.ctrl.write(0);
        for (slot, region) in crate::mpu::kernel_static_map() {
            mpu.rnr.write(u32::from(slot));
            mpu.rbar.write(region.rbar);
            mpu.rasr.write(region.rasr);
        }
        mpu.ctrl.write(MPU_ENABLE | MPU_PRIVDEFENA);
    }
}

#[cfg(not(feature = "mpu"))]
pub fn install_static_regions() {}

/// Installs `task`'s regions: its stack plus up to three caller-supplied
/// regions. Runs on every context switch.
#[cfg(feature = "mpu")]
pub fn apply_memory_protection(task: &Tcb) {
    let mpu = unsafe {
        // At least by not taking a &mut we're confident we're not
        // violating aliasing....
        &*cortex_m::peripheral::MPU::PTR
    };

    // Disable while updating: RBAR/RASR pairs cannot be written
    // atomically, and a half-written region is a real crash. Re-enabling
    // costs single-digit cycles.
    unsafe {
        mpu.ctrl.write(0);
    }

    let stack = crate::mpu::stack_region(task);
    // Safety: region loads with the MPU off, as above.
    unsafe {
        mpu.rnr.write(u32::from(crate::mpu::TASK_STACK_SLOT));
        mpu.rbar.write(stack.rbar);
        mpu.rasr.write(stack.rasr);

        for (i, slot) in crate::mpu::TASK_REGION_SLOTS.enumerate() {
            mpu.rnr.write(u32::from(slot));
            match task.regions.get(i) {
                Some(r) => {
                    let data = crate::mpu::compute_region_data(
                        r.base,
                        r.size,
                        r.attributes,
                    );
                    mpu.rbar.write(data.rbar);
                    mpu.rasr.write(data.rasr);
                }
                // Unused slot: disabled, grants nothing.
                None => mpu.rasr.write(0),
            }
        }

        mpu.ctrl.write(MPU_ENABLE | MPU_PRIVDEFENA);
    }
}

#[cfg(not(feature = "mpu"))]
pub fn apply_memory_protection(_task: &Tcb) {}

/// Issues the start-first-task trap. Never returns: the trap handler
/// resets the main stack and exception-returns into the first task.
pub fn start_first_task() -> ! {
    // Safety: diverges by design; the SVC handler discards this context.
    unsafe {
        core::arch::asm!("svc #0x04", options(noreturn));
    }
}

/// Final leg of start-first-task, run from the SVC handler: resets the
/// main stack (the startup frames on it are dead), drops thread-mode
/// privilege, and pops the first task's synthetic frame.
pub fn enter_first_task(task: &Tcb) -> ! {
    extern "C" {
        // Top of the main stack, provided by the linker script.
        static _stack_start: u32;
    }
    // Safety: single exit path out of startup; everything this context
    // owned is either in the kernel cell or intentionally dropped.
    unsafe {
        core::arch::asm!("
            ldr r1, ={stack}
            msr MSP, r1
            movs r1, #1
            msr CONTROL, r1
            ldr r1, [{tcb}]
            ldm r1!, {{r4-r11}}
            str r1, [{tcb}]
            msr PSP, r1
            mov lr, {exc_return}
            bx lr
            ",
            stack = sym _stack_start,
            tcb = in(reg) task as *const Tcb,
            exc_return = const EXC_RETURN_THREAD_PSP,
            options(noreturn),
        )
    }
}

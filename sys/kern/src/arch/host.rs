// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host port: no hardware, no traps.
//!
//! This exists so the portable kernel builds and runs under `cargo test` on
//! the development machine. Fences are no-ops (tests are single-threaded
//! over a private kernel instance), memory protection is accepted
//! silently, and deferred context switches are completed by the test
//! driver calling `Kernel::finish_context_switch` where the deferred trap
//! would have fired. The mode transitions that only hardware can do panic
//! instead.

use crate::tcb::Tcb;

/// On hardware this pends the deferred context-switch trap; here the test
/// driver plays that trap's role.
pub fn pend_context_switch() {}

pub fn apply_memory_protection(_task: &Tcb) {}

pub fn install_static_regions() {}

pub fn configure_traps() {}

pub fn setup_tick(_tick_divisor: u32) {}

/// Records the current-task pointer for the context-switch assembly, of
/// which the host has none.
pub unsafe fn set_current_task(_task: *mut Tcb) {}

/// Scheduler fence: masks only the deferred context-switch trap.
pub fn with_context_switches_masked<R>(f: impl FnOnce() -> R) -> R {
    f()
}

/// Full critical section: also masks the tick.
pub fn with_kernel_masked<R>(f: impl FnOnce() -> R) -> R {
    f()
}

pub fn in_unprivileged_thread() -> bool {
    true
}

pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

pub fn start_first_task() -> ! {
    panic!("host port cannot enter thread mode");
}

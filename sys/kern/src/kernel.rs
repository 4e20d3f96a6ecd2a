// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel state record.
//!
//! All mutable kernel state lives in one `Kernel` value: the TCB slab, the
//! three top-level queues, the running/next pointers, the tick counter, and
//! the kernel heap. On hardware there is exactly one instance, owned by
//! `startup` and reached only from trap handlers; under test each case
//! builds its own private instance, which is what keeps the scheduler and
//! synchronization logic exercisable on the host.

use abi::{TaskId, KHEAP_MAX_ORDER, KHEAP_MIN_ORDER};
use buddy::BuddyHeap;

use crate::list;
use crate::tcb::{QueueKind, Tcb, TcbSlab};

pub struct Kernel {
    pub(crate) tasks: TcbSlab,
    /// Priority-ordered runnable tasks. Never empty while the kernel is
    /// running: the idle task is always here or current.
    pub(crate) ready: Option<TaskId>,
    /// Tasks parked by `task-block`, in no particular order.
    pub(crate) blocked: Option<TaskId>,
    /// Delta-list of time-waiting tasks.
    pub(crate) delay: Option<TaskId>,
    /// The task whose context is (or is about to be) on the CPU.
    pub(crate) current: Option<TaskId>,
    /// Set only while a context switch is pending: the task selected to run
    /// once the deferred switch trap fires.
    pub(crate) next: Option<TaskId>,
    pub(crate) ticks: u64,
    pub(crate) running: bool,
    pub(crate) kheap: BuddyHeap,
}

impl Kernel {
    /// Builds a kernel over the given kernel-heap backing region.
    ///
    /// # Safety
    ///
    /// `kheap` must point to `1 << KHEAP_MAX_ORDER` bytes of writable
    /// memory, aligned to that size, used by nothing else.
    pub unsafe fn new(kheap: *mut u8) -> Self {
        Self {
            tasks: TcbSlab::new(),
            ready: None,
            blocked: None,
            delay: None,
            current: None,
            next: None,
            ticks: 0,
            running: false,
            // Safety: forwarded directly from our own contract.
            kheap: unsafe {
                BuddyHeap::new(kheap, KHEAP_MIN_ORDER, KHEAP_MAX_ORDER)
            },
        }
    }

    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    pub fn pending_next(&self) -> Option<TaskId> {
        self.next
    }

    pub fn ready_head(&self) -> Option<TaskId> {
        self.ready
    }

    pub fn delay_head(&self) -> Option<TaskId> {
        self.delay
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Ticks elapsed since start. Wall-clock bookkeeping only; all waiting
    /// is relative, through the delta-list.
    pub fn uptime_ticks(&self) -> u64 {
        self.ticks
    }

    pub fn task(&self, id: TaskId) -> &Tcb {
        self.tasks.get(id)
    }

    /// IDs of all live tasks, for inspection and invariant checks.
    pub fn live_task_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.tasks.live_ids()
    }

    pub(crate) fn current_id(&self) -> TaskId {
        self.current.expect("no current task")
    }

    /// Pops the most important ready task. The ready queue is never empty
    /// while the kernel runs (the idle task sees to that), so an empty pop
    /// is kernel-state corruption.
    pub(crate) fn take_ready_head(&mut self) -> TaskId {
        list::dequeue_head(&mut self.tasks, &mut self.ready, QueueKind::Ready)
            .expect("ready queue empty")
    }

    /// Serves a `kernel-alloc` request.
    pub fn kernel_alloc(&mut self, size: u32) -> *mut u8 {
        self.kheap.alloc_bytes(size)
    }

    /// Serves a `kernel-free` request.
    ///
    /// # Safety
    ///
    /// `block` must be a live allocation of `size` bytes from this kernel's
    /// heap.
    pub unsafe fn kernel_free(&mut self, block: *mut u8, size: u32) {
        unsafe { self.kheap.free_bytes(block, size) }
    }
}

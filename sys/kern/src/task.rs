// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task lifecycle operations: creation, teardown, delays, blocking,
//! yielding.
//!
//! Each operation here backs one syscall and has the same shape: it takes
//! `&mut Kernel`, mutates queues, and either returns a status for the
//! caller's frame or parks the caller and dispatches someone else. Statuses
//! for parked callers are delivered later, through their saved registers.

use abi::{Status, TaskDesc, TaskId, MIN_STACK_SIZE, REGIONS_PER_TASK};

use crate::kernel::Kernel;
use crate::list;
use crate::tcb::{self, QueueKind, QueueTag, WakeCallback};

impl Kernel {
    /// Creates a task from `desc`: allocates a TCB slot (and a stack, if
    /// dynamic), seeds the stack with the synthetic first frame, and makes
    /// the task runnable. The new task may immediately preempt the caller.
    ///
    /// Returns the handle, or `None` on a parameter fault or exhaustion --
    /// task creation reports through a handle-or-null register, not a
    /// status.
    pub fn make_task(&mut self, desc: &TaskDesc) -> Option<TaskId> {
        if desc.priority.0 == u8::MAX
            || desc.quantum == 0
            || desc.regions.len() > REGIONS_PER_TASK
            || desc.stack_size < MIN_STACK_SIZE
        {
            return None;
        }
        if !desc.dynamic_stack
            && (desc.stack.is_null() || desc.stack as usize % 8 != 0)
        {
            return None;
        }
        // Region geometry is checked now so the context-switch path can
        // encode MPU words without failure cases.
        for region in desc.regions {
            if region.size < 32
                || !region.size.is_power_of_two()
                || region.base & 0x1F != 0
            {
                return None;
            }
        }

        let id = self.tasks.alloc()?;

        let stack = if desc.dynamic_stack {
            let block = self.kheap.alloc_bytes(desc.stack_size);
            if block.is_null() {
                self.tasks.free(id);
                return None;
            }
            block.cast::<usize>()
        } else {
            desc.stack
        };

        // Safety: the stack is either fresh from the kernel heap or was
        // validated above; either way it is writable and sized per the
        // descriptor.
        let sp = unsafe {
            tcb::seed_stack(stack, desc.stack_size, desc.entry, desc.arg)
        };

        {
            let t = self.tasks.get_mut(id);
            t.sp = sp;
            t.stack = stack;
            t.stack_size = desc.stack_size;
            t.dynamic_stack = desc.dynamic_stack;
            t.entry = Some(desc.entry);
            t.arg = desc.arg;
            t.base_priority = desc.priority;
            t.priority = desc.priority;
            t.quantum = desc.quantum;
            t.reload = desc.quantum;
            t.regions = desc.regions;
        }

        if self.running {
            self.try_preempt(id);
        } else {
            list::enqueue_by_priority(
                &mut self.tasks,
                &mut self.ready,
                id,
                QueueKind::Ready,
            );
        }
        Some(id)
    }

    /// Ends the calling task: returns a dynamic stack to the kernel heap,
    /// dispatches a successor, and frees the TCB slot.
    ///
    /// Finishing while holding mutexes is a programming error and halts the
    /// kernel for the debugger. The returned status lands in a frame no
    /// live task will ever read.
    pub fn finish_task(&mut self) -> Status {
        let cur = self.current_id();
        let t = self.tasks.get(cur);
        if t.mutexes_held > 0 {
            panic!(
                "task {} finished holding {} mutexes",
                cur.0, t.mutexes_held
            );
        }
        if t.dynamic_stack {
            let (stack, size) = (t.stack, t.stack_size);
            // Safety: we allocated this stack from the kernel heap at
            // creation and the task is done with it.
            unsafe {
                self.kheap.free_bytes(stack.cast(), size);
            }
        }
        if self.next.is_none() {
            let head = self.take_ready_head();
            self.dispatch(head);
        }
        self.tasks.free(cur);
        Status::CantFinish
    }

    /// Parks the calling task on the delay list for `ticks`, with an
    /// optional callback to run at expiry. Resumes with `Ok` after the full
    /// delay, or `Woken` if cancelled early.
    pub fn delay_current(
        &mut self,
        ticks: u32,
        callback: WakeCallback,
    ) -> Status {
        if ticks == 0 {
            return Status::BadParameters;
        }
        let cur = self.current_id();
        self.tasks.get_mut(cur).callback = callback;
        list::delay_insert(&mut self.tasks, &mut self.delay, cur, ticks);
        let head = self.take_ready_head();
        self.dispatch(head);
        Status::Ok
    }

    /// Wakes a delayed task early with `Woken`, without running its
    /// callback. If the task was also waiting on a mutex or semaphore (a
    /// timed take), it leaves that wait queue too.
    pub fn delay_cancel(&mut self, id: TaskId) -> Status {
        if !self.tasks.is_live(id) {
            return Status::BadParameters;
        }
        if list::delay_remove(&mut self.tasks, &mut self.delay, id).is_err() {
            return Status::NotDelayed;
        }
        self.cancel_wait_membership(id);
        self.tasks.get_mut(id).set_wait_result(Status::Woken);
        self.try_preempt(id);
        Status::Ok
    }

    /// Parks the calling task on the blocked list until someone unblocks
    /// it.
    pub fn block_current(&mut self) -> Status {
        let cur = self.current_id();
        list::enqueue_head(
            &mut self.tasks,
            &mut self.blocked,
            cur,
            QueueKind::Blocked,
        );
        let head = self.take_ready_head();
        self.dispatch(head);
        Status::Ok
    }

    /// Makes a blocked task runnable again; it may preempt the caller.
    pub fn unblock(&mut self, id: TaskId) -> Status {
        if !self.tasks.is_live(id) {
            return Status::BadParameters;
        }
        if list::remove_entry(
            &mut self.tasks,
            &mut self.blocked,
            id,
            QueueKind::Blocked,
        )
        .is_err()
        {
            return Status::NotBlocked;
        }
        if self.running {
            self.try_preempt(id);
        } else {
            list::enqueue_by_priority(
                &mut self.tasks,
                &mut self.ready,
                id,
                QueueKind::Ready,
            );
        }
        Status::Ok
    }

    /// Hands the rest of the quantum to a peer at the same priority, if one
    /// is ready.
    pub fn yield_current(&mut self) -> Status {
        let cur = self.current_id();
        let Some(head) = self.ready else {
            return Status::CantYield;
        };
        if self.tasks.get(head).priority != self.tasks.get(cur).priority {
            return Status::CantYield;
        }
        list::enqueue_by_priority(
            &mut self.tasks,
            &mut self.ready,
            cur,
            QueueKind::Ready,
        );
        let head = self.take_ready_head();
        self.dispatch(head);
        Status::Ok
    }

    /// Transitions from startup to the first scheduled task. On hardware
    /// this never returns: the architecture layer pops the synthetic frame
    /// straight into unprivileged thread mode. The host port returns so
    /// tests can drive the scheduler from here.
    pub fn start_first(&mut self) -> Status {
        self.running = true;
        let first = self.take_ready_head();
        {
            let t = self.tasks.get_mut(first);
            t.tag = QueueTag::Running;
            if t.quantum == 0 {
                t.quantum = t.reload;
            }
        }
        self.current = Some(first);

        #[cfg(target_arch = "arm")]
        {
            let t = self.tasks.get(first);
            // Safety: `first` is in the task table and stays current until
            // the next kernel entry.
            unsafe {
                crate::arch::set_current_task(t as *const _ as *mut _);
            }
            crate::arch::apply_memory_protection(t);
            crate::arch::enter_first_task(t)
        }
        #[cfg(not(target_arch = "arm"))]
        Status::Ok
    }

    /// Clears a task's wake callback; for the timeout variants, also
    /// unlinks the task from the wait queue the callback refers to.
    fn cancel_wait_membership(&mut self, id: TaskId) {
        let callback = core::mem::replace(
            &mut self.tasks.get_mut(id).callback,
            WakeCallback::None,
        );
        match callback {
            #[cfg(feature = "mutex")]
            WakeCallback::MutexTimeout(m) => {
                // Safety: a waiter on the queue implies the object is live.
                let waiters = unsafe { &mut (*m).waiters };
                let _ = list::remove_entry(
                    &mut self.tasks,
                    waiters,
                    id,
                    QueueKind::Mutex,
                );
            }
            #[cfg(feature = "semaphore")]
            WakeCallback::SemTimeout(s) => {
                // Safety: as above.
                let waiters = unsafe { &mut (*s).waiters };
                let _ = list::remove_entry(
                    &mut self.tasks,
                    waiters,
                    id,
                    QueueKind::Sem,
                );
            }
            WakeCallback::None | WakeCallback::User(..) => {}
        }
    }
}

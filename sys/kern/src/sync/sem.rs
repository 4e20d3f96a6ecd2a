// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Blocking counting semaphore.
//!
//! A positive counter is consumed without blocking; at zero, takers park on
//! a priority-ordered wait queue. `put` prefers handing the permit directly
//! to the most important waiter over incrementing the counter, so a waiter
//! never loses a permit to a later non-blocking taker.
//!
//! From interrupt context a take cannot park, so the dispatcher forces the
//! never-wait flavor there; the logic below does not special-case it.

use abi::{SemState, Status, TaskId, Wait};

use crate::kernel::Kernel;
use crate::list;
use crate::tcb::{QueueKind, WakeCallback};

impl Kernel {
    /// Takes one permit, blocking per `wait` when none is available.
    ///
    /// A blocked caller resumes with `Ok` (handed a permit) or `Timeout` in
    /// its saved return register.
    pub fn sem_take(&mut self, s: &mut SemState, wait: Wait) -> Status {
        if s.count == 0 {
            return Status::NotInitialised;
        }
        if s.counter > 0 {
            s.counter -= 1;
            return Status::Ok;
        }
        if wait == Wait::Never {
            return Status::WouldBlock;
        }

        let cur = self.current_id();
        if let Wait::Ticks(n) = wait {
            self.tasks.get_mut(cur).callback =
                WakeCallback::SemTimeout(s as *mut SemState);
            list::delay_insert(&mut self.tasks, &mut self.delay, cur, n);
        }
        list::enqueue_by_priority(
            &mut self.tasks,
            &mut s.waiters,
            cur,
            QueueKind::Sem,
        );
        let head = self.take_ready_head();
        self.dispatch(head);
        Status::Ok
    }

    /// Returns one permit: wakes the most important waiter with `Ok`, or
    /// increments the counter, bounded by the configured count.
    pub fn sem_put(&mut self, s: &mut SemState) -> Status {
        if s.count == 0 {
            return Status::NotInitialised;
        }
        if s.counter == s.count {
            return Status::RecursivePut;
        }

        if let Some(waiter) = list::dequeue_head(
            &mut self.tasks,
            &mut s.waiters,
            QueueKind::Sem,
        ) {
            self.cancel_sem_timeout(waiter);
            self.tasks.get_mut(waiter).set_wait_result(Status::Ok);
            self.try_preempt(waiter);
            return Status::Ok;
        }

        s.counter += 1;
        Status::Ok
    }

    /// Resets the semaphore. Fails `CantDelete` while permits are
    /// outstanding -- which includes the case of parked waiters, since
    /// waiters only exist while the counter is pinned at zero.
    pub fn sem_delete(&mut self, s: &mut SemState) -> Status {
        if s.counter != s.count {
            return Status::CantDelete;
        }
        s.counter = 0;
        s.count = 0;
        self.reschedule();
        Status::Ok
    }

    /// Drops a pending take-timeout, if `id` armed one.
    fn cancel_sem_timeout(&mut self, id: TaskId) {
        if matches!(self.tasks.get(id).callback, WakeCallback::SemTimeout(_))
        {
            self.tasks.get_mut(id).callback = WakeCallback::None;
            let _ =
                list::delay_remove(&mut self.tasks, &mut self.delay, id);
        }
    }
}

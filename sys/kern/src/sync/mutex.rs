// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Priority-inheriting mutex.
//!
//! Ownership is by task; the mutex is deliberately non-reentrant (a second
//! take by the owner is a contract violation, not a recursion count).
//! While a more important task waits, the owner runs at the waiter's
//! effective priority; the donation is reverted when the owner's held-mutex
//! count drops to zero.
//!
//! Transitive inheritance is not chased: a donor's own inheritance already
//! ran when it was donated to, so the chain is at most one hop stale, and
//! the original design accepts that.

use abi::{MutexState, Status, TaskId, Wait};

use crate::kernel::Kernel;
use crate::list;
use crate::tcb::{QueueKind, QueueTag, WakeCallback};

impl Kernel {
    /// Takes `m` for the calling task, blocking per `wait` if it is owned.
    ///
    /// A blocked caller resumes with `Ok` (handed the mutex), `Timeout`, or
    /// `Deleted` in its saved return register.
    pub fn mutex_take(&mut self, m: &mut MutexState, wait: Wait) -> Status {
        let cur = self.current_id();

        let Some(owner) = m.owner else {
            m.owner = Some(cur);
            self.tasks.get_mut(cur).mutexes_held += 1;
            return Status::Ok;
        };
        if owner == cur {
            return Status::RecursiveTake;
        }
        if wait == Wait::Never {
            return Status::WouldBlock;
        }

        if let Wait::Ticks(n) = wait {
            self.tasks.get_mut(cur).callback =
                WakeCallback::MutexTimeout(m as *mut MutexState);
            list::delay_insert(&mut self.tasks, &mut self.delay, cur, n);
        }

        list::enqueue_by_priority(
            &mut self.tasks,
            &mut m.waiters,
            cur,
            QueueKind::Mutex,
        );

        // Priority donation. If the owner is sitting on the ready queue its
        // position was computed at the old priority, so it must be
        // re-inserted for the dispatcher to see the inheritance.
        let cur_prio = self.tasks.get(cur).priority;
        let owner_tcb = self.tasks.get_mut(owner);
        if cur_prio.is_more_important_than(owner_tcb.priority) {
            owner_tcb.priority = cur_prio;
            if matches!(
                owner_tcb.tag,
                QueueTag::Head(QueueKind::Ready)
                    | QueueTag::Member(QueueKind::Ready)
            ) {
                let _ = list::remove_entry(
                    &mut self.tasks,
                    &mut self.ready,
                    owner,
                    QueueKind::Ready,
                );
                list::enqueue_by_priority(
                    &mut self.tasks,
                    &mut self.ready,
                    owner,
                    QueueKind::Ready,
                );
            }
        }

        let head = self.take_ready_head();
        self.dispatch(head);
        Status::Ok
    }

    /// Releases `m`. The most important waiter, if any, becomes the new
    /// owner and is woken with `Ok`; it may preempt the caller.
    pub fn mutex_put(&mut self, m: &mut MutexState) -> Status {
        let cur = self.current_id();
        if m.owner != Some(cur) {
            return Status::NotOwner;
        }

        let new_owner = list::dequeue_head(
            &mut self.tasks,
            &mut m.waiters,
            QueueKind::Mutex,
        );
        m.owner = new_owner;

        {
            let t = self.tasks.get_mut(cur);
            t.mutexes_held -= 1;
            if t.mutexes_held == 0 {
                t.priority = t.base_priority;
            }
        }

        let Some(next_owner) = new_owner else {
            return Status::Ok;
        };
        self.tasks.get_mut(next_owner).mutexes_held += 1;
        self.cancel_mutex_timeout(next_owner);
        self.tasks.get_mut(next_owner).set_wait_result(Status::Ok);
        self.try_preempt(next_owner);
        Status::Ok
    }

    /// Deletes `m`: every waiter is woken with `Deleted` and the object is
    /// reset. Only the owner may delete.
    pub fn mutex_delete(&mut self, m: &mut MutexState) -> Status {
        let cur = self.current_id();
        if m.owner != Some(cur) {
            return Status::NotOwner;
        }

        while let Some(waiter) = list::dequeue_head(
            &mut self.tasks,
            &mut m.waiters,
            QueueKind::Mutex,
        ) {
            self.cancel_mutex_timeout(waiter);
            self.tasks.get_mut(waiter).set_wait_result(Status::Deleted);
            list::enqueue_by_priority(
                &mut self.tasks,
                &mut self.ready,
                waiter,
                QueueKind::Ready,
            );
        }

        {
            let t = self.tasks.get_mut(cur);
            t.mutexes_held -= 1;
            if t.mutexes_held == 0 {
                t.priority = t.base_priority;
            }
        }
        m.owner = None;
        self.reschedule();
        Status::Ok
    }

    /// Drops a pending take-timeout, if `id` armed one.
    fn cancel_mutex_timeout(&mut self, id: TaskId) {
        if matches!(
            self.tasks.get(id).callback,
            WakeCallback::MutexTimeout(_)
        ) {
            self.tasks.get_mut(id).callback = WakeCallback::None;
            let _ =
                list::delay_remove(&mut self.tasks, &mut self.delay, id);
        }
    }
}

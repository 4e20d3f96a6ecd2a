// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler: preemptive strict-priority with round-robin inside each
//! priority level.
//!
//! # Context-switch protocol
//!
//! Three pointers drive scheduling: `current` (executing task), `next` (the
//! task selected but not yet installed, set only while a switch trap is
//! pending), and the ready-queue head. [`Kernel::dispatch`] selects a task
//! and pends the low-priority switch trap; the trap's handler saves the old
//! context, calls [`Kernel::finish_context_switch`] to promote `next`, and
//! restores the new task with its isolation regions.
//!
//! # Tick handling
//!
//! The tick interrupt runs [`Kernel::tick`], which only counts: it charges
//! the running task's quantum (skipped while a switch is already pending,
//! so a just-preempted task can be under-charged by one tick -- accepted)
//! and counts down the delay-list head. Any resulting work is deferred to
//! [`Kernel::handle_tick_event`], which runs at syscall priority so user
//! interrupts never observe half-updated queues.

use bitflags::bitflags;

use crate::kernel::Kernel;
use crate::list;
use crate::tcb::{QueueKind, QueueTag, WakeCallback};

use abi::TaskId;
#[cfg(any(feature = "mutex", feature = "semaphore"))]
use abi::Status;

bitflags! {
    /// Work discovered by the tick interrupt, to be handled at syscall
    /// priority. The bit values are part of the tick-event trap's register
    /// encoding.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct TickEvent: u32 {
        const QUANTUM_EXPIRED = 1 << 0;
        const WAKE_PENDING = 1 << 1;
    }
}

impl Kernel {
    /// Selects `id` to run: tags it, recharges an exhausted quantum, and
    /// pends the deferred context-switch trap. The caller has already
    /// unlinked `id` from whatever queue held it.
    pub(crate) fn dispatch(&mut self, id: TaskId) {
        let t = self.tasks.get_mut(id);
        t.tag = QueueTag::Running;
        if t.quantum == 0 {
            t.quantum = t.reload;
        }
        self.next = Some(id);
        crate::arch::pend_context_switch();
    }

    /// Promotes the pending `next` task to `current`. Called from the
    /// deferred switch trap after the outgoing context has been saved; the
    /// caller installs the returned task's isolation regions.
    pub fn finish_context_switch(&mut self) -> Option<TaskId> {
        let id = self.next.take()?;
        self.current = Some(id);
        Some(id)
    }

    /// Checks whether the ready-queue head should displace the pending
    /// `next` task (if a switch is pending) or the current task, and
    /// dispatches it if so. Called after any event that may have made a
    /// higher-priority task ready.
    pub(crate) fn reschedule(&mut self) {
        if !self.running {
            return;
        }
        let Some(head) = self.ready else { return };
        let head_prio = self.tasks.get(head).priority;

        if let Some(pending) = self.next {
            if head_prio
                .is_more_important_than(self.tasks.get(pending).priority)
            {
                list::enqueue_by_priority(
                    &mut self.tasks,
                    &mut self.ready,
                    pending,
                    QueueKind::Ready,
                );
                let head = self.take_ready_head();
                self.dispatch(head);
            }
            return;
        }

        let cur = self.current_id();
        if head_prio.is_more_important_than(self.tasks.get(cur).priority) {
            list::enqueue_by_priority(
                &mut self.tasks,
                &mut self.ready,
                cur,
                QueueKind::Ready,
            );
            let head = self.take_ready_head();
            self.dispatch(head);
        }
    }

    /// Like [`Kernel::reschedule`], but for a specific newly-runnable task
    /// that is currently on no queue: either it preempts, or it joins the
    /// ready queue.
    pub(crate) fn try_preempt(&mut self, id: TaskId) {
        let prio = self.tasks.get(id).priority;

        if let Some(pending) = self.next {
            if prio.is_more_important_than(self.tasks.get(pending).priority) {
                list::enqueue_by_priority(
                    &mut self.tasks,
                    &mut self.ready,
                    pending,
                    QueueKind::Ready,
                );
                self.dispatch(id);
            } else {
                list::enqueue_by_priority(
                    &mut self.tasks,
                    &mut self.ready,
                    id,
                    QueueKind::Ready,
                );
            }
            return;
        }

        let cur = self.current_id();
        if prio.is_more_important_than(self.tasks.get(cur).priority) {
            list::enqueue_by_priority(
                &mut self.tasks,
                &mut self.ready,
                cur,
                QueueKind::Ready,
            );
            self.dispatch(id);
        } else {
            list::enqueue_by_priority(
                &mut self.tasks,
                &mut self.ready,
                id,
                QueueKind::Ready,
            );
        }
    }

    /// Tick-interrupt accounting. Returns the deferred work, if any.
    pub fn tick(&mut self) -> TickEvent {
        if !self.running {
            return TickEvent::empty();
        }
        self.ticks += 1;
        let mut ev = TickEvent::empty();

        // While a switch is pending, `current` is already parked on a queue
        // and charging it would shorten its next slice (or its delay).
        if self.next.is_none() {
            let cur = self.current_id();
            let t = self.tasks.get_mut(cur);
            t.quantum = t.quantum.saturating_sub(1);
            if t.quantum == 0 {
                ev |= TickEvent::QUANTUM_EXPIRED;
            }
        }

        if let Some(head) = self.delay {
            let t = self.tasks.get_mut(head);
            t.delay_ticks = t.delay_ticks.saturating_sub(1);
            if t.delay_ticks == 0 {
                ev |= TickEvent::WAKE_PENDING;
            }
        }
        ev
    }

    /// Deferred tick work: wakes every delay-list head that has counted to
    /// zero (running callbacks, recharging quanta), then performs the
    /// round-robin rotation if the running task's quantum expired.
    pub fn handle_tick_event(&mut self, ev: TickEvent) {
        if !self.running {
            return;
        }
        if ev.contains(TickEvent::WAKE_PENDING) {
            while self
                .delay
                .is_some_and(|h| self.tasks.get(h).delay_ticks == 0)
            {
                let id = list::delay_pop_expired(
                    &mut self.tasks,
                    &mut self.delay,
                )
                .expect("wake pending with empty delay list");
                self.run_wake_callback(id);
                let t = self.tasks.get_mut(id);
                t.quantum = t.reload;
                list::enqueue_by_priority(
                    &mut self.tasks,
                    &mut self.ready,
                    id,
                    QueueKind::Ready,
                );
            }
            if !ev.contains(TickEvent::QUANTUM_EXPIRED) {
                self.reschedule();
                return;
            }
        }

        if ev.contains(TickEvent::QUANTUM_EXPIRED) {
            if self.next.is_some() {
                self.reschedule();
                return;
            }
            let cur = self.current_id();
            let cur_prio = self.tasks.get(cur).priority;
            if let Some(head) = self.ready {
                // Rotation uses <=: an equal-priority peer takes over and
                // the exhausted task goes to the back of its level.
                if !cur_prio
                    .is_more_important_than(self.tasks.get(head).priority)
                {
                    list::enqueue_by_priority(
                        &mut self.tasks,
                        &mut self.ready,
                        cur,
                        QueueKind::Ready,
                    );
                    let head = self.take_ready_head();
                    self.dispatch(head);
                    return;
                }
            }
            // Nothing to rotate to; recharge in place.
            let t = self.tasks.get_mut(cur);
            t.quantum = t.reload;
        }
    }

    /// Runs and clears a woken task's callback. For the timeout variants
    /// this is where the task leaves the wait queue it timed out on.
    fn run_wake_callback(&mut self, id: TaskId) {
        let callback = core::mem::replace(
            &mut self.tasks.get_mut(id).callback,
            WakeCallback::None,
        );
        match callback {
            WakeCallback::None => {}
            WakeCallback::User(f, arg) => f(id, arg),
            #[cfg(feature = "mutex")]
            WakeCallback::MutexTimeout(m) => {
                // Safety: a task still waiting on this mutex implies the
                // object is live; put and delete cancel timeouts before
                // the object can be released.
                let waiters = unsafe { &mut (*m).waiters };
                let _ = list::remove_entry(
                    &mut self.tasks,
                    waiters,
                    id,
                    QueueKind::Mutex,
                );
                self.tasks.get_mut(id).set_wait_result(Status::Timeout);
            }
            #[cfg(feature = "semaphore")]
            WakeCallback::SemTimeout(s) => {
                // Safety: as for the mutex variant.
                let waiters = unsafe { &mut (*s).waiters };
                let _ = list::remove_entry(
                    &mut self.tasks,
                    waiters,
                    id,
                    QueueKind::Sem,
                );
                self.tasks.get_mut(id).set_wait_result(Status::Timeout);
            }
        }
    }
}

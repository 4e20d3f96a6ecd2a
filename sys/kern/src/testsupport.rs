// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helpers for driving a private kernel instance from host tests.
//!
//! The host has no traps, so the test driver plays the hardware's part:
//! `settle` stands in for the deferred context-switch trap and `run_ticks`
//! for the tick interrupt plus its deferred handler, in the same order the
//! hardware would run them.

use core::convert::TryFrom;

use abi::{Priority, Status, TaskDesc, TaskId};

use crate::kernel::Kernel;
use crate::tcb::{QueueKind, QueueTag, RETVAL_WORD};

#[repr(align(4096))]
struct HeapBacking([u8; 4096]);

/// A kernel over a leaked heap backing. Leaking keeps the backing alive
/// for the raw pointers inside; tests are short-lived processes.
pub(crate) fn kernel() -> Kernel {
    let backing = Box::leak(Box::new(HeapBacking([0; 4096])));
    // Safety: fresh, exclusively owned, 4096-aligned backing.
    unsafe { Kernel::new(backing.0.as_mut_ptr()) }
}

pub(crate) fn entry(_arg: usize) {}

/// Creates a task with a leaked host stack.
pub(crate) fn spawn_with(
    k: &mut Kernel,
    priority: u8,
    quantum: u32,
) -> TaskId {
    let stack = Box::leak(vec![0usize; 512].into_boxed_slice());
    let desc = TaskDesc {
        entry,
        arg: 0,
        stack: stack.as_mut_ptr(),
        stack_size: (stack.len() * core::mem::size_of::<usize>()) as u32,
        dynamic_stack: false,
        priority: Priority(priority),
        quantum,
        regions: &[],
    };
    k.make_task(&desc).expect("task creation failed")
}

pub(crate) fn spawn(k: &mut Kernel, priority: u8) -> TaskId {
    spawn_with(k, priority, 10)
}

pub(crate) fn spawn_idle(k: &mut Kernel) -> TaskId {
    spawn_with(k, 254, u32::MAX)
}

/// Completes a pending context switch, standing in for the deferred trap.
pub(crate) fn settle(k: &mut Kernel) {
    let _ = k.finish_context_switch();
}

/// One hardware tick: the tick interrupt, then (if it flagged work) the
/// deferred tick-event handler, then the deferred context switch.
pub(crate) fn run_ticks(k: &mut Kernel, n: u32) {
    for _ in 0..n {
        let ev = k.tick();
        if !ev.is_empty() {
            k.handle_tick_event(ev);
        }
        settle(k);
        check_invariants(k);
    }
}

/// Reads the status a waker deposited in a parked (or since-resumed)
/// task's stacked return slot.
pub(crate) fn stacked_result(k: &Kernel, id: TaskId) -> Status {
    // Safety: the task's saved SP points into its leaked test stack.
    let raw = unsafe { *k.task(id).sp.add(RETVAL_WORD) };
    Status::try_from(raw as u32).expect("bogus status in saved frame")
}

/// The ready queue, head first.
pub(crate) fn ready_order(k: &Kernel) -> Vec<TaskId> {
    let mut out = Vec::new();
    let mut cursor = k.ready_head();
    while let Some(id) = cursor {
        out.push(id);
        cursor = k.task(id).next;
    }
    out
}

/// Structural invariants checked after every simulated tick.
pub(crate) fn check_invariants(k: &Kernel) {
    // Ready queue: sorted by effective priority, consistently tagged.
    let ready = ready_order(k);
    for pair in ready.windows(2) {
        let (a, b) = (k.task(pair[0]).priority(), k.task(pair[1]).priority());
        assert!(
            !b.is_more_important_than(a),
            "ready queue out of order: {a:?} before {b:?}"
        );
    }
    for (i, &id) in ready.iter().enumerate() {
        let want = if i == 0 {
            QueueTag::Head(QueueKind::Ready)
        } else {
            QueueTag::Member(QueueKind::Ready)
        };
        assert_eq!(k.task(id).tag(), want, "bad tag for ready task {id:?}");
    }

    // A task holding no mutexes runs at its base priority.
    for id in k.live_task_ids() {
        let t = k.task(id);
        if t.mutexes_held() == 0 {
            assert_eq!(
                t.priority(),
                t.base_priority(),
                "task {id:?} has a stale inherited priority"
            );
        }
    }

    // The current task is on no queue.
    if let Some(cur) = k.current() {
        if k.pending_next().is_none() {
            assert_eq!(k.task(cur).tag(), QueueTag::Running);
        }
    }
}

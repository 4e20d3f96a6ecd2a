// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel task lists.
//!
//! Two list families thread through the TCB slab by task index: the
//! priority-ordered doubly-linked lists used for the ready queue and every
//! wait queue (primary links, tagged with a [`QueueKind`]), and the delay
//! delta-list (secondary links), where each node stores only the wait beyond
//! its predecessor so the tick handler decrements a single counter.
//!
//! All operations here are bounded-time (linear in queue length at worst)
//! and never suspend; callers provide the serialization.

use abi::{Status, TaskId};

use crate::tcb::{DelayTag, QueueKind, QueueTag, TcbSlab};

/// Inserts `id` into the list at `head` by effective priority. Insertion
/// lands *after* every entry of equal priority, which is what makes
/// same-priority scheduling round-robin.
pub fn enqueue_by_priority(
    tasks: &mut TcbSlab,
    head: &mut Option<TaskId>,
    id: TaskId,
    kind: QueueKind,
) {
    let prio = tasks.get(id).priority;

    let Some(first) = *head else {
        let t = tasks.get_mut(id);
        t.prev = None;
        t.next = None;
        t.tag = QueueTag::Head(kind);
        *head = Some(id);
        return;
    };

    if prio.is_more_important_than(tasks.get(first).priority) {
        {
            let t = tasks.get_mut(id);
            t.prev = None;
            t.next = Some(first);
            t.tag = QueueTag::Head(kind);
        }
        let old = tasks.get_mut(first);
        old.prev = Some(id);
        old.tag = QueueTag::Member(kind);
        *head = Some(id);
        return;
    }

    let mut cursor = first;
    loop {
        if prio.is_more_important_than(tasks.get(cursor).priority) {
            // Insert before `cursor`, which cannot be the head here: the
            // head case was handled above, and the walk only advances past
            // entries at least as important as `id`.
            let cursor_prev =
                tasks.get(cursor).prev.expect("interior node without prev");
            {
                let t = tasks.get_mut(id);
                t.prev = Some(cursor_prev);
                t.next = Some(cursor);
                t.tag = QueueTag::Member(kind);
            }
            tasks.get_mut(cursor_prev).next = Some(id);
            tasks.get_mut(cursor).prev = Some(id);
            return;
        }
        match tasks.get(cursor).next {
            Some(next) => cursor = next,
            None => {
                tasks.get_mut(cursor).next = Some(id);
                let t = tasks.get_mut(id);
                t.prev = Some(cursor);
                t.next = None;
                t.tag = QueueTag::Member(kind);
                return;
            }
        }
    }
}

/// Unlinks and returns the head of the list. The removed task keeps its old
/// tag; the caller decides what it becomes (usually `Running`).
pub fn dequeue_head(
    tasks: &mut TcbSlab,
    head: &mut Option<TaskId>,
    kind: QueueKind,
) -> Option<TaskId> {
    let old = (*head)?;
    let new_head = tasks.get(old).next;
    *head = new_head;
    if let Some(n) = new_head {
        let t = tasks.get_mut(n);
        t.prev = None;
        t.tag = QueueTag::Head(kind);
    }
    Some(old)
}

/// Pushes `id` as the new head. Used for the blocked list, which has no
/// ordering requirement.
pub fn enqueue_head(
    tasks: &mut TcbSlab,
    head: &mut Option<TaskId>,
    id: TaskId,
    kind: QueueKind,
) {
    let old = *head;
    if let Some(o) = old {
        let t = tasks.get_mut(o);
        t.prev = Some(id);
        t.tag = QueueTag::Member(kind);
    }
    let t = tasks.get_mut(id);
    t.prev = None;
    t.next = old;
    t.tag = QueueTag::Head(kind);
    *head = Some(id);
}

/// Removes `id` from the list at `head`, verifying by its tag that it is
/// actually on a list of this kind. The tag is the ground truth; a mismatch
/// means the caller is confused, and the list is left untouched.
pub fn remove_entry(
    tasks: &mut TcbSlab,
    head: &mut Option<TaskId>,
    id: TaskId,
    kind: QueueKind,
) -> Result<(), Status> {
    match tasks.get(id).tag {
        QueueTag::Head(k) if k == kind => {
            debug_assert_eq!(*head, Some(id));
            dequeue_head(tasks, head, kind);
            Ok(())
        }
        QueueTag::Member(k) if k == kind => {
            let prev = tasks.get(id).prev.expect("queue member without prev");
            let next = tasks.get(id).next;
            tasks.get_mut(prev).next = next;
            if let Some(n) = next {
                tasks.get_mut(n).prev = Some(prev);
            }
            Ok(())
        }
        _ => Err(Status::WrongQueue),
    }
}

/// Inserts `id` into the delay delta-list with an absolute wait of `ticks`.
///
/// The list stores deltas: walking it sums counters until the running total
/// would pass `ticks`, the new node keeps the remainder past its
/// predecessor, and the successor gives up that amount so every later
/// wake time is unchanged.
pub fn delay_insert(
    tasks: &mut TcbSlab,
    head: &mut Option<TaskId>,
    id: TaskId,
    ticks: u32,
) {
    let Some(first) = *head else {
        let t = tasks.get_mut(id);
        t.delay_ticks = ticks;
        t.delay_prev = None;
        t.delay_next = None;
        t.delay_tag = DelayTag::Head;
        *head = Some(id);
        return;
    };

    if tasks.get(first).delay_ticks >= ticks {
        // New head; the old head keeps only the remainder.
        tasks.get_mut(first).delay_ticks -= ticks;
        {
            let t = tasks.get_mut(id);
            t.delay_ticks = ticks;
            t.delay_prev = None;
            t.delay_next = Some(first);
            t.delay_tag = DelayTag::Head;
        }
        let old = tasks.get_mut(first);
        old.delay_prev = Some(id);
        old.delay_tag = DelayTag::Member;
        *head = Some(id);
        return;
    }

    let mut cursor = first;
    let mut prefix: u32 = 0;
    loop {
        prefix += tasks.get(cursor).delay_ticks;
        if prefix >= ticks {
            // Insert before `cursor`; it keeps whatever of its delta lies
            // past the new node. `cursor` cannot be the head (that case
            // returned above), so it has a predecessor.
            let delta = ticks - (prefix - tasks.get(cursor).delay_ticks);
            tasks.get_mut(cursor).delay_ticks -= delta;
            let cursor_prev = tasks
                .get(cursor)
                .delay_prev
                .expect("interior delay node without prev");
            {
                let t = tasks.get_mut(id);
                t.delay_ticks = delta;
                t.delay_prev = Some(cursor_prev);
                t.delay_next = Some(cursor);
                t.delay_tag = DelayTag::Member;
            }
            tasks.get_mut(cursor_prev).delay_next = Some(id);
            tasks.get_mut(cursor).delay_prev = Some(id);
            return;
        }
        match tasks.get(cursor).delay_next {
            Some(next) => cursor = next,
            None => {
                tasks.get_mut(cursor).delay_next = Some(id);
                let t = tasks.get_mut(id);
                t.delay_ticks = ticks - prefix;
                t.delay_prev = Some(cursor);
                t.delay_next = None;
                t.delay_tag = DelayTag::Member;
                return;
            }
        }
    }
}

/// Removes `id` from the delay list, donating its remaining delta to the
/// successor so every later waiter still wakes at its original time.
pub fn delay_remove(
    tasks: &mut TcbSlab,
    head: &mut Option<TaskId>,
    id: TaskId,
) -> Result<(), Status> {
    if tasks.get(id).delay_tag == DelayTag::NotDelayed {
        return Err(Status::NotDelayed);
    }

    let donated = tasks.get(id).delay_ticks;
    if *head == Some(id) {
        let next = tasks.get(id).delay_next;
        *head = next;
        if let Some(n) = next {
            let t = tasks.get_mut(n);
            t.delay_ticks += donated;
            t.delay_prev = None;
            t.delay_tag = DelayTag::Head;
        }
    } else {
        let prev = tasks
            .get(id)
            .delay_prev
            .expect("delay member without prev");
        let next = tasks.get(id).delay_next;
        tasks.get_mut(prev).delay_next = next;
        if let Some(n) = next {
            let t = tasks.get_mut(n);
            t.delay_ticks += donated;
            t.delay_prev = Some(prev);
        }
    }
    tasks.get_mut(id).delay_tag = DelayTag::NotDelayed;
    Ok(())
}

/// Pops the head of the delay list without donating its counter: this is
/// only called for a head that has already counted down to zero.
pub fn delay_pop_expired(
    tasks: &mut TcbSlab,
    head: &mut Option<TaskId>,
) -> Option<TaskId> {
    let old = (*head)?;
    let next = tasks.get(old).delay_next;
    *head = next;
    if let Some(n) = next {
        let t = tasks.get_mut(n);
        t.delay_prev = None;
        t.delay_tag = DelayTag::Head;
    }
    tasks.get_mut(old).delay_tag = DelayTag::NotDelayed;
    Some(old)
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::Priority;

    fn slab_with(priorities: &[u8]) -> (TcbSlab, Vec<TaskId>) {
        let mut slab = TcbSlab::new();
        let ids = priorities
            .iter()
            .map(|&p| {
                let id = slab.alloc().unwrap();
                let t = slab.get_mut(id);
                t.base_priority = Priority(p);
                t.priority = Priority(p);
                id
            })
            .collect();
        (slab, ids)
    }

    fn collect(slab: &TcbSlab, head: Option<TaskId>) -> Vec<TaskId> {
        let mut out = Vec::new();
        let mut cursor = head;
        while let Some(id) = cursor {
            out.push(id);
            cursor = slab.get(id).next;
        }
        out
    }

    fn collect_delays(
        slab: &TcbSlab,
        head: Option<TaskId>,
    ) -> Vec<(TaskId, u32)> {
        let mut out = Vec::new();
        let mut cursor = head;
        while let Some(id) = cursor {
            out.push((id, slab.get(id).delay_ticks));
            cursor = slab.get(id).delay_next;
        }
        out
    }

    #[test]
    fn priority_insert_sorts_ascending() {
        let (mut slab, ids) = slab_with(&[5, 1, 3]);
        let mut head = None;
        for &id in &ids {
            enqueue_by_priority(&mut slab, &mut head, id, QueueKind::Ready);
        }
        assert_eq!(collect(&slab, head), vec![ids[1], ids[2], ids[0]]);
        assert_eq!(slab.get(ids[1]).tag, QueueTag::Head(QueueKind::Ready));
        assert_eq!(slab.get(ids[0]).tag, QueueTag::Member(QueueKind::Ready));
    }

    #[test]
    fn equal_priorities_go_behind_their_peers() {
        let (mut slab, ids) = slab_with(&[2, 2, 2]);
        let mut head = None;
        for &id in &ids {
            enqueue_by_priority(&mut slab, &mut head, id, QueueKind::Ready);
        }
        // Insertion order preserved within the level: round-robin.
        assert_eq!(collect(&slab, head), ids);
    }

    #[test]
    fn equal_priority_lands_after_peers_but_before_less_important() {
        let (mut slab, ids) = slab_with(&[1, 1, 7, 1]);
        let mut head = None;
        for &id in &ids {
            enqueue_by_priority(&mut slab, &mut head, id, QueueKind::Ready);
        }
        assert_eq!(
            collect(&slab, head),
            vec![ids[0], ids[1], ids[3], ids[2]]
        );
    }

    #[test]
    fn dequeue_head_promotes_successor() {
        let (mut slab, ids) = slab_with(&[1, 2]);
        let mut head = None;
        for &id in &ids {
            enqueue_by_priority(&mut slab, &mut head, id, QueueKind::Ready);
        }
        let popped = dequeue_head(&mut slab, &mut head, QueueKind::Ready);
        assert_eq!(popped, Some(ids[0]));
        assert_eq!(head, Some(ids[1]));
        assert_eq!(slab.get(ids[1]).tag, QueueTag::Head(QueueKind::Ready));
        assert_eq!(slab.get(ids[1]).prev, None);

        assert_eq!(
            dequeue_head(&mut slab, &mut head, QueueKind::Ready),
            Some(ids[1])
        );
        assert_eq!(dequeue_head(&mut slab, &mut head, QueueKind::Ready), None);
    }

    #[test]
    fn blocked_list_is_lifo_and_unordered() {
        let (mut slab, ids) = slab_with(&[9, 1, 5]);
        let mut head = None;
        for &id in &ids {
            enqueue_head(&mut slab, &mut head, id, QueueKind::Blocked);
        }
        assert_eq!(collect(&slab, head), vec![ids[2], ids[1], ids[0]]);
    }

    #[test]
    fn remove_entry_handles_head_member_and_mismatch() {
        let (mut slab, ids) = slab_with(&[1, 2, 3]);
        let mut head = None;
        for &id in &ids {
            enqueue_by_priority(&mut slab, &mut head, id, QueueKind::Ready);
        }

        // Middle member.
        assert_eq!(
            remove_entry(&mut slab, &mut head, ids[1], QueueKind::Ready),
            Ok(())
        );
        assert_eq!(collect(&slab, head), vec![ids[0], ids[2]]);

        // Wrong kind: untouched, reported.
        assert_eq!(
            remove_entry(&mut slab, &mut head, ids[0], QueueKind::Blocked),
            Err(Status::WrongQueue)
        );
        assert_eq!(collect(&slab, head), vec![ids[0], ids[2]]);

        // Head.
        assert_eq!(
            remove_entry(&mut slab, &mut head, ids[0], QueueKind::Ready),
            Ok(())
        );
        assert_eq!(collect(&slab, head), vec![ids[2]]);
    }

    #[test]
    fn delta_list_stores_differences() {
        // Waiters for 5, 15, 20 ticks inserted at tick zero.
        let (mut slab, ids) = slab_with(&[0, 0, 0]);
        let mut head = None;
        delay_insert(&mut slab, &mut head, ids[0], 5);
        delay_insert(&mut slab, &mut head, ids[1], 15);
        delay_insert(&mut slab, &mut head, ids[2], 20);

        assert_eq!(
            collect_delays(&slab, head),
            vec![(ids[0], 5), (ids[1], 10), (ids[2], 5)]
        );
    }

    #[test]
    fn removing_a_middle_waiter_preserves_later_wake_times() {
        let (mut slab, ids) = slab_with(&[0, 0, 0]);
        let mut head = None;
        delay_insert(&mut slab, &mut head, ids[0], 5);
        delay_insert(&mut slab, &mut head, ids[1], 15);
        delay_insert(&mut slab, &mut head, ids[2], 20);

        // Three ticks pass; only the head counts down.
        slab.get_mut(ids[0]).delay_ticks -= 3;

        assert_eq!(delay_remove(&mut slab, &mut head, ids[1]), Ok(()));
        assert_eq!(
            collect_delays(&slab, head),
            vec![(ids[0], 2), (ids[2], 15)]
        );
        // Absolute wake of the tail is unchanged: 3 + 2 + 15 = 20.
        assert_eq!(slab.get(ids[1]).delay_tag, DelayTag::NotDelayed);
    }

    #[test]
    fn removing_the_head_donates_to_the_new_head() {
        let (mut slab, ids) = slab_with(&[0, 0]);
        let mut head = None;
        delay_insert(&mut slab, &mut head, ids[0], 4);
        delay_insert(&mut slab, &mut head, ids[1], 10);

        assert_eq!(delay_remove(&mut slab, &mut head, ids[0]), Ok(()));
        assert_eq!(collect_delays(&slab, head), vec![(ids[1], 10)]);
        assert_eq!(slab.get(ids[1]).delay_tag, DelayTag::Head);
    }

    #[test]
    fn inserting_at_the_front_pushes_the_old_head() {
        let (mut slab, ids) = slab_with(&[0, 0]);
        let mut head = None;
        delay_insert(&mut slab, &mut head, ids[0], 10);
        delay_insert(&mut slab, &mut head, ids[1], 4);

        assert_eq!(
            collect_delays(&slab, head),
            vec![(ids[1], 4), (ids[0], 6)]
        );
    }

    #[test]
    fn delay_remove_rejects_non_delayed_tasks() {
        let (mut slab, ids) = slab_with(&[0, 0]);
        let mut head = None;
        delay_insert(&mut slab, &mut head, ids[0], 10);
        assert_eq!(
            delay_remove(&mut slab, &mut head, ids[1]),
            Err(Status::NotDelayed)
        );
    }

    #[test]
    fn expired_heads_pop_in_order() {
        let (mut slab, ids) = slab_with(&[0, 0, 0]);
        let mut head = None;
        delay_insert(&mut slab, &mut head, ids[0], 5);
        delay_insert(&mut slab, &mut head, ids[1], 5);
        delay_insert(&mut slab, &mut head, ids[2], 9);

        // An equal absolute delay inserts ahead of the incumbent, which
        // keeps a zero delta behind it: both wake on the same tick.
        assert_eq!(
            collect_delays(&slab, head),
            vec![(ids[1], 5), (ids[0], 0), (ids[2], 4)]
        );

        // After five ticks the first two are both due.
        slab.get_mut(ids[1]).delay_ticks = 0;
        assert_eq!(delay_pop_expired(&mut slab, &mut head), Some(ids[1]));
        assert_eq!(delay_pop_expired(&mut slab, &mut head), Some(ids[0]));
        assert_eq!(
            collect_delays(&slab, head),
            vec![(ids[2], 4)]
        );
    }
}

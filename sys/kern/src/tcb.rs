// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task control blocks and the slab they live in.

use abi::{Priority, RegionDesc, Status, TaskId, MAX_TASKS};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of software-saved words below the hardware exception frame: r4-r11
/// on ARMv7-M, pushed by the deferred context-switch trap.
pub const SAVED_CONTEXT_WORDS: usize = 8;

/// Word offset from a suspended task's saved stack pointer to its stacked
/// `r0`, i.e. the slot that carries its syscall return value. This is how a
/// waker deposits OK / TIMEOUT / DELETED / WOKEN into a parked task.
pub const RETVAL_WORD: usize = SAVED_CONTEXT_WORDS;

/// Initial program status word: just the Thumb bit, the minimum required.
const INITIAL_XPSR: usize = 1 << 24;

/// Fill pattern for the seeded callee-saved registers; recognizable in a
/// debugger and harmless to restore.
const CONTEXT_FILL: usize = 0xDEAD_BEEF;

/// Which wait list a TCB's primary links currently thread through.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum QueueKind {
    Ready,
    Blocked,
    Mutex,
    Sem,
}

/// Primary-queue discriminator. This is the ground truth for a task's
/// scheduling state: a task is either running (on no list) or it is the head
/// or an interior member of exactly one list.
///
/// A task sleeping in a plain delay keeps the `Running` tag: it holds no
/// position on any primary list, only on the delay list.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum QueueTag {
    Running,
    Head(QueueKind),
    Member(QueueKind),
}

/// Delay-list discriminator, independent of [`QueueTag`] so a task blocked
/// on a mutex or semaphore can simultaneously sit on the delay list for its
/// timeout.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DelayTag {
    NotDelayed,
    Head,
    Member,
}

/// What to do when a delay expires or a wait times out.
///
/// The timeout variants carry the waited-on object so the expiry path can
/// unlink the task from that object's wait queue.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum WakeCallback {
    None,
    #[cfg(feature = "mutex")]
    MutexTimeout(*mut abi::MutexState),
    #[cfg(feature = "semaphore")]
    SemTimeout(*mut abi::SemState),
    /// Caller-supplied function, run in handler mode with the woken task's
    /// ID and the captured argument.
    User(fn(TaskId, usize), usize),
}

/// Task control block: every piece of per-task state, in one fat record.
#[repr(C)]
pub struct Tcb {
    /// Saved process stack pointer, pointing at the software-saved context.
    /// Meaningful only while the task is not running.
    // NOTE: this field must stay first; the context-switch assembly stores
    // and loads through the TCB address directly.
    pub(crate) sp: *mut usize,
    /// Stack base and size, used for teardown and the MPU stack region.
    pub(crate) stack: *mut usize,
    pub(crate) stack_size: u32,
    /// Whether `stack` came from the kernel heap and goes back there.
    pub(crate) dynamic_stack: bool,
    pub(crate) entry: Option<fn(usize)>,
    pub(crate) arg: usize,

    pub(crate) base_priority: Priority,
    /// Effective priority: equal to `base_priority` except while lowered by
    /// priority inheritance.
    pub(crate) priority: Priority,
    /// Remaining quantum in ticks, and the value it recharges to.
    pub(crate) quantum: u32,
    pub(crate) reload: u32,
    /// Mutexes currently owned; priority resets to base when this hits zero.
    pub(crate) mutexes_held: u32,

    // Primary queue linkage.
    pub(crate) prev: Option<TaskId>,
    pub(crate) next: Option<TaskId>,
    pub(crate) tag: QueueTag,

    // Delay delta-list linkage. `delay_ticks` is the wait *beyond* the
    // preceding list entry, not an absolute count.
    pub(crate) delay_prev: Option<TaskId>,
    pub(crate) delay_next: Option<TaskId>,
    pub(crate) delay_tag: DelayTag,
    pub(crate) delay_ticks: u32,

    pub(crate) callback: WakeCallback,

    /// Caller-supplied isolation regions, installed alongside the stack
    /// region on every switch to this task.
    pub(crate) regions: &'static [RegionDesc],
}

impl Tcb {
    const EMPTY: Tcb = Tcb {
        sp: core::ptr::null_mut(),
        stack: core::ptr::null_mut(),
        stack_size: 0,
        dynamic_stack: false,
        entry: None,
        arg: 0,
        base_priority: Priority(0),
        priority: Priority(0),
        quantum: 0,
        reload: 0,
        mutexes_held: 0,
        prev: None,
        next: None,
        tag: QueueTag::Running,
        delay_prev: None,
        delay_next: None,
        delay_tag: DelayTag::NotDelayed,
        delay_ticks: 0,
        callback: WakeCallback::None,
        regions: &[],
    };

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn base_priority(&self) -> Priority {
        self.base_priority
    }

    pub fn tag(&self) -> QueueTag {
        self.tag
    }

    pub fn delay_tag(&self) -> DelayTag {
        self.delay_tag
    }

    pub fn mutexes_held(&self) -> u32 {
        self.mutexes_held
    }

    pub fn entry(&self) -> Option<fn(usize)> {
        self.entry
    }

    pub fn arg(&self) -> usize {
        self.arg
    }

    pub fn regions(&self) -> &'static [abi::RegionDesc] {
        self.regions
    }

    /// Deposits a status into the suspended task's stacked `r0` so it
    /// observes `status` as the return value of the trap it blocked in.
    ///
    /// Writing through the saved stack pointer is sound because a suspended
    /// task's context, including this slot, is frozen until the kernel
    /// dispatches it again.
    pub(crate) fn set_wait_result(&mut self, status: Status) {
        // Safety: `sp` was produced either by stack seeding or by the
        // context-save sequence, and in both layouts the stacked r0 sits
        // RETVAL_WORD words above it, inside this task's stack.
        unsafe {
            *self.sp.add(RETVAL_WORD) = status as u32 as usize;
        }
    }
}

/// Hardware exception frame, in stacking order. The same layout doubles as
/// the kernel's view of a caller's syscall arguments (`r0`-`r3`) and return
/// slot (`r0`).
///
/// Fields are machine words rather than `u32` so the host port gets the
/// same code with its native word size; on ARM the two are identical.
#[derive(Debug, Default, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ExceptionFrame {
    pub r0: usize,
    pub r1: usize,
    pub r2: usize,
    pub r3: usize,
    pub r12: usize,
    pub lr: usize,
    pub pc: usize,
    pub xpsr: usize,
}

const FRAME_WORDS: usize = 8;

/// Builds the synthetic initial context on a fresh task stack and returns
/// the resulting saved stack pointer: an exception frame that enters the
/// task at `entry` with `arg` in its first argument register, over a block
/// of recognizably-seeded callee-saved registers.
///
/// # Safety
///
/// `stack .. stack + stack_size` must be writable memory owned by the new
/// task, word-aligned, and large enough for the frame (the caller checks
/// size against `MIN_STACK_SIZE`).
pub(crate) unsafe fn seed_stack(
    stack: *mut usize,
    stack_size: u32,
    entry: fn(usize),
    arg: usize,
) -> *mut usize {
    let words = stack_size as usize / core::mem::size_of::<usize>();
    // Safety: in-bounds per the caller's contract.
    unsafe {
        let top = stack.add(words);
        let frame = top.sub(FRAME_WORDS).cast::<ExceptionFrame>();
        frame.write(ExceptionFrame {
            r0: arg,
            // Thumb bit set on the entry address; returning from the task
            // entry traps instead of wandering off.
            pc: (entry as usize) | 1,
            lr: 0xFFFF_FFFF,
            xpsr: INITIAL_XPSR,
            ..ExceptionFrame::default()
        });

        let sp = frame.cast::<usize>().sub(SAVED_CONTEXT_WORDS);
        for word in 0..SAVED_CONTEXT_WORDS {
            sp.add(word).write(CONTEXT_FILL);
        }
        sp
    }
}

const FULL_MASK: u32 = if MAX_TASKS == 32 {
    u32::MAX
} else {
    (1 << MAX_TASKS) - 1
};

/// Fixed slab of TCBs with a bitmap of free slots.
pub struct TcbSlab {
    free_mask: u32,
    tasks: [Tcb; MAX_TASKS],
}

impl TcbSlab {
    pub const fn new() -> Self {
        Self {
            free_mask: FULL_MASK,
            tasks: [Tcb::EMPTY; MAX_TASKS],
        }
    }

    /// Claims the lowest free slot, handing it back reset to the empty
    /// state.
    pub fn alloc(&mut self) -> Option<TaskId> {
        if self.free_mask == 0 {
            return None;
        }
        let slot = self.free_mask.trailing_zeros();
        self.free_mask &= !(1 << slot);
        let id = TaskId(slot as u8);
        *self.get_mut(id) = Tcb::EMPTY;
        Some(id)
    }

    /// Releases a slot. An ID outside the slab is ignored, and releasing an
    /// already-free slot is a no-op.
    pub fn free(&mut self, id: TaskId) {
        if id.index() >= MAX_TASKS {
            return;
        }
        self.free_mask |= 1 << id.index();
    }

    pub fn is_live(&self, id: TaskId) -> bool {
        id.index() < MAX_TASKS && self.free_mask & (1 << id.index()) == 0
    }

    pub fn get(&self, id: TaskId) -> &Tcb {
        &self.tasks[id.index()]
    }

    pub fn get_mut(&mut self, id: TaskId) -> &mut Tcb {
        &mut self.tasks[id.index()]
    }

    /// Iterates the IDs of live slots, for invariant checks and debugging.
    pub fn live_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        (0..MAX_TASKS as u8)
            .map(TaskId)
            .filter(move |&id| self.is_live(id))
    }
}

impl Default for TcbSlab {
    fn default() -> Self {
        Self::new()
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and applications.
//!
//! Everything in here is wire-stable: status codes are read back by resumed
//! waiters out of their saved registers, and syscall encodings are baked into
//! `svc` immediates in user code, so changing any numeric value here is an
//! ABI break.

// Allow std-y things to be used in test. Note that this attribute is a bit of
// a trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};

/// Maximum number of simultaneously live tasks, including the idle task. The
/// TCB slab tracks free slots in a single 32-bit mask, hence the upper bound.
pub const MAX_TASKS: usize = 16;

static_assertions::const_assert!(MAX_TASKS >= 2); // idle task needs a slot
static_assertions::const_assert!(MAX_TASKS <= 32);

/// Number of caller-supplied memory regions a task may carry, in addition to
/// its stack region. Bounded by the MPU slots left over after the kernel's
/// static map.
pub const REGIONS_PER_TASK: usize = 3;

/// Kernel heap geometry: the heap spans `1 << KHEAP_MAX_ORDER` bytes and the
/// smallest allocation is `1 << KHEAP_MIN_ORDER` bytes.
pub const KHEAP_MIN_ORDER: u32 = 5;
pub const KHEAP_MAX_ORDER: u32 = 12;

/// User heap geometry, same meaning as the kernel heap's.
pub const UHEAP_MIN_ORDER: u32 = 5;
pub const UHEAP_MAX_ORDER: u32 = 12;

// A free block stores the next-block link inside itself.
static_assertions::const_assert!(KHEAP_MIN_ORDER >= 2);
static_assertions::const_assert!(KHEAP_MIN_ORDER <= KHEAP_MAX_ORDER);
static_assertions::const_assert!(UHEAP_MIN_ORDER >= 2);
static_assertions::const_assert!(UHEAP_MIN_ORDER <= UHEAP_MAX_ORDER);

/// Priority of the idle task. User tasks must use numerically smaller (more
/// important) values.
pub const IDLE_PRIORITY: Priority = Priority(254);

/// Smallest supported task stack, in bytes: room for a hardware exception
/// frame plus the eight software-saved registers, rounded to the smallest
/// MPU region.
pub const MIN_STACK_SIZE: u32 = 128;

/// Status codes returned by every kernel entry point.
///
/// `AllocFail` is deliberately zero so that the allocation-flavored calls can
/// return it as a null pointer. The remaining values are read back by resumed
/// waiters from their saved registers and must never be renumbered.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize,
)]
#[repr(u32)]
pub enum Status {
    AllocFail = 0,
    Ok,
    BadParameters,
    NotBlocked,
    NotDelayed,
    WouldBlock,
    CantYield,
    CantFinish,
    Timeout,
    WrongQueue,
    NotOwner,
    RecursiveTake,
    RecursivePut,
    Woken,
    Deleted,
    CantDelete,
    NotInitialised,
    WrongContext,
}

/// We're using an explicit `TryFrom` impl for `Status` instead of a derived
/// one because the kernel doesn't depend on `num-traits` and this is the
/// only conversion it needs.
impl core::convert::TryFrom<u32> for Status {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::AllocFail),
            1 => Ok(Self::Ok),
            2 => Ok(Self::BadParameters),
            3 => Ok(Self::NotBlocked),
            4 => Ok(Self::NotDelayed),
            5 => Ok(Self::WouldBlock),
            6 => Ok(Self::CantYield),
            7 => Ok(Self::CantFinish),
            8 => Ok(Self::Timeout),
            9 => Ok(Self::WrongQueue),
            10 => Ok(Self::NotOwner),
            11 => Ok(Self::RecursiveTake),
            12 => Ok(Self::RecursivePut),
            13 => Ok(Self::Woken),
            14 => Ok(Self::Deleted),
            15 => Ok(Self::CantDelete),
            16 => Ok(Self::NotInitialised),
            17 => Ok(Self::WrongContext),
            _ => Err(()),
        }
    }
}

/// Names a slot in the TCB slab.
///
/// The all-zeros raw form is reserved to mean "no task", so the wire form is
/// the slab index plus one. This lets the task-creation call return a handle
/// or null through a single register.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TaskId(pub u8);

impl TaskId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// Recovers a `TaskId` from its register form. Zero means "no task".
    pub fn from_raw(raw: u32) -> Option<Self> {
        let raw = u8::try_from(raw).ok()?;
        raw.checked_sub(1).map(TaskId)
    }

    /// Produces the register form of this ID.
    pub fn into_raw(self) -> u32 {
        u32::from(self.0) + 1
    }
}

/// Indicates priority of a task.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so Priority 0 is the most likely to be
/// scheduled, followed by 1, and so forth.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means numerically
/// greater / less important, or more important / numerically smaller.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

/// How long a blocking `take` is willing to wait.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Wait {
    /// Fail with `WouldBlock` instead of waiting.
    Never,
    /// Wait until the object is handed over or deleted.
    Forever,
    /// Wait for at most this many ticks, then resume with `Timeout`.
    Ticks(u32),
}

impl Wait {
    /// Register encoding: 0 waits forever, all-ones never waits, anything
    /// else is a tick count.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Forever,
            u32::MAX => Self::Never,
            n => Self::Ticks(n),
        }
    }

    pub fn into_raw(self) -> u32 {
        match self {
            Self::Forever => 0,
            Self::Never => u32::MAX,
            Self::Ticks(n) => n,
        }
    }
}

/// Where a trap came from, as far as syscall filtering is concerned.
///
/// The origin is recovered from the stacked EXC_RETURN by the trap entry
/// sequence; kernel startup (privileged thread mode on the main stack) is
/// grouped with interrupt context.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CallerContext {
    Thread,
    Interrupt,
}

impl CallerContext {
    /// Mask applied to a syscall encoding before dispatch. The high nibble
    /// of an encoding marks it thread-callable, the low nibble marks it
    /// interrupt-callable, so masking leaves zero exactly when the call is
    /// not allowed from this context.
    pub fn mask(self) -> u8 {
        match self {
            Self::Thread => 0xF0,
            Self::Interrupt => 0x0F,
        }
    }
}

/// Syscall numbers.
///
/// The `svc` immediate doubles as the permission record: the high nibble is
/// the thread-context form, the low nibble the interrupt-context form, and a
/// nibble of zero means the call is unavailable from that context. Decoding
/// therefore happens *after* masking with [`CallerContext::mask`], and an
/// encoding that masks to zero is rejected as `WrongContext` before it gets
/// here.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Sysnum {
    TaskMake = 0x11,
    TaskUnblock = 0x22,
    TaskDelayCancel = 0x33,
    StartFirstTask = 0x04,
    TaskFinish = 0x40,
    KernelAlloc = 0x55,
    KernelFree = 0x66,
    SemTake = 0x77,
    SemPut = 0x88,
    SemDelete = 0x99,
    MutexDelete = 0xA0,
    MutexPut = 0xB0,
    MutexTake = 0xC0,
    TaskYield = 0xD0,
    TaskBlock = 0xE0,
    TickEvent = 0x0F,
    TaskDelay = 0xF0,
}

impl Sysnum {
    /// The raw `svc` immediate for this syscall, as emitted by the user-side
    /// stubs.
    pub fn encoding(self) -> u8 {
        self as u8
    }

    /// Decodes a context-masked immediate byte.
    ///
    /// Both surviving nibble forms of a two-context call map to the same
    /// operation; one-context calls have a single legal masked form. Note
    /// that 0x04 and 0x40 are *different* operations (start-first-task is
    /// reachable only through the interrupt-side nibble, task-finish only
    /// through the thread side), so the nibble value alone does not identify
    /// the call.
    pub fn from_masked(masked: u8) -> Result<Self, ()> {
        match masked {
            0x01 | 0x10 => Ok(Self::TaskMake),
            0x02 | 0x20 => Ok(Self::TaskUnblock),
            0x03 | 0x30 => Ok(Self::TaskDelayCancel),
            0x04 => Ok(Self::StartFirstTask),
            0x40 => Ok(Self::TaskFinish),
            0x05 | 0x50 => Ok(Self::KernelAlloc),
            0x06 | 0x60 => Ok(Self::KernelFree),
            0x07 | 0x70 => Ok(Self::SemTake),
            0x08 | 0x80 => Ok(Self::SemPut),
            0x09 | 0x90 => Ok(Self::SemDelete),
            0xA0 => Ok(Self::MutexDelete),
            0xB0 => Ok(Self::MutexPut),
            0xC0 => Ok(Self::MutexTake),
            0xD0 => Ok(Self::TaskYield),
            0xE0 => Ok(Self::TaskBlock),
            0x0F => Ok(Self::TickEvent),
            0xF0 => Ok(Self::TaskDelay),
            _ => Err(()),
        }
    }
}

// This is defined outside the bitflags! macro so that we can write our own
// const constructor fns, below.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegionAttributes(u32);

bitflags::bitflags! {
    impl RegionAttributes: u32 {
        /// Region can be read by the task that carries it.
        const READ = 1 << 0;
        /// Region can be written by the task that carries it.
        const WRITE = 1 << 1;
        /// Region can contain executable code for the task that carries it.
        const EXECUTE = 1 << 2;
        /// Region contains memory-mapped registers. This affects the memory
        /// type the MPU programs for it.
        const DEVICE = 1 << 3;
    }
}

/// Description of one memory region granted to a task.
///
/// The platform has alignment requirements: `base` must be naturally aligned
/// for `size`, and `size` must be a power of two of at least 32 bytes. The
/// kernel checks the size constraints at task creation.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct RegionDesc {
    /// Address of start of region.
    pub base: u32,
    /// Size of region, in bytes.
    pub size: u32,
    /// Flags describing what can be done with this region.
    pub attributes: RegionAttributes,
}

impl RegionDesc {
    /// Describes a peripheral register block, the common case for driver
    /// tasks.
    pub const fn device(base: u32, size: u32) -> Self {
        Self {
            base,
            size,
            attributes: RegionAttributes::READ
                .union(RegionAttributes::WRITE)
                .union(RegionAttributes::DEVICE),
        }
    }

    /// Describes a plain read-write memory window.
    pub const fn ram(base: u32, size: u32) -> Self {
        Self {
            base,
            size,
            attributes: RegionAttributes::READ.union(RegionAttributes::WRITE),
        }
    }
}

/// Record describing a task to be created.
pub struct TaskDesc {
    /// First instruction of the task. The task must end by calling
    /// `task_finish`; returning from this function traps.
    pub entry: fn(usize),
    /// Argument delivered to `entry` in its first parameter register.
    pub arg: usize,
    /// Base of a caller-provided stack (in machine words), or null when
    /// `dynamic_stack` is set. Must be 8-byte aligned; for MPU isolation to
    /// cover it exactly it must also be aligned to `stack_size` rounded up
    /// to a power of two.
    pub stack: *mut usize,
    /// Stack size in bytes, at least [`MIN_STACK_SIZE`].
    pub stack_size: u32,
    /// When set, the stack is carved from the kernel heap instead of
    /// `stack`, and returned there when the task finishes.
    pub dynamic_stack: bool,
    /// Base priority, in `0..=253` for user tasks.
    pub priority: Priority,
    /// Scheduling quantum in ticks; must be nonzero.
    pub quantum: u32,
    /// Extra memory regions, at most [`REGIONS_PER_TASK`].
    pub regions: &'static [RegionDesc],
}

/// Kernel-side state of a priority-inheriting mutex. Applications never
/// see this directly; it exists as a named type so the kernel can work on
/// it with ordinary exclusive references.
#[derive(Debug)]
#[repr(C)]
pub struct MutexState {
    pub owner: Option<TaskId>,
    pub waiters: Option<TaskId>,
}

impl MutexState {
    pub const fn new() -> Self {
        Self {
            owner: None,
            waiters: None,
        }
    }
}

impl Default for MutexState {
    fn default() -> Self {
        Self::new()
    }
}

/// Priority-inheriting mutex control block.
///
/// User code allocates the object wherever it likes -- a `static` is the
/// common case -- and refers to it only through syscalls. The state sits in
/// an `UnsafeCell` because the kernel mutates it through a shared
/// reference; that also keeps a `static Mutex` out of read-only memory.
#[repr(transparent)]
pub struct Mutex {
    state: core::cell::UnsafeCell<MutexState>,
}

// Safety: the kernel serializes all access by trap priority; user code has
// no accessor to race with.
unsafe impl Sync for Mutex {}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            state: core::cell::UnsafeCell::new(MutexState::new()),
        }
    }

    /// Kernel-side entry to the state. Applications have no business here.
    pub fn state_ptr(&self) -> *mut MutexState {
        self.state.get()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Kernel-side state of a blocking counting semaphore; see [`MutexState`].
#[derive(Debug)]
#[repr(C)]
pub struct SemState {
    pub counter: u32,
    pub count: u32,
    pub waiters: Option<TaskId>,
}

impl SemState {
    pub const fn new(count: u32) -> Self {
        Self {
            counter: count,
            count,
            waiters: None,
        }
    }
}

/// Blocking counting semaphore control block, wrapped like [`Mutex`].
/// Construct with the full count available; a zero count is the
/// uninitialized state.
#[repr(transparent)]
pub struct Sem {
    state: core::cell::UnsafeCell<SemState>,
}

// Safety: as for `Mutex`.
unsafe impl Sync for Sem {}

impl Sem {
    pub const fn new(count: u32) -> Self {
        Self {
            state: core::cell::UnsafeCell::new(SemState::new(count)),
        }
    }

    /// Kernel-side entry to the state. Applications have no business here.
    pub fn state_ptr(&self) -> *mut SemState {
        self.state.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::TryFrom;

    #[test]
    fn status_values_are_wire_stable() {
        // Spot-check the values resumed waiters see; renumbering any of
        // these breaks tasks already parked in a wait.
        assert_eq!(Status::AllocFail as u32, 0);
        assert_eq!(Status::Ok as u32, 1);
        assert_eq!(Status::Timeout as u32, 8);
        assert_eq!(Status::Woken as u32, 13);
        assert_eq!(Status::Deleted as u32, 14);
        assert_eq!(Status::WrongContext as u32, 17);
    }

    #[test]
    fn status_roundtrips_through_raw() {
        for raw in 0..=17 {
            let status = Status::try_from(raw).unwrap();
            assert_eq!(status as u32, raw);
        }
        assert!(Status::try_from(18).is_err());
    }

    #[test]
    fn task_id_raw_form_reserves_zero() {
        assert_eq!(TaskId::from_raw(0), None);
        assert_eq!(TaskId::from_raw(1), Some(TaskId(0)));
        assert_eq!(TaskId(4).into_raw(), 5);
        assert_eq!(TaskId::from_raw(TaskId(31).into_raw()), Some(TaskId(31)));
        // Anything that doesn't fit the slab index width is not a handle.
        assert_eq!(TaskId::from_raw(0x1_0000), None);
    }

    #[test]
    fn wait_encoding() {
        assert_eq!(Wait::from_raw(0), Wait::Forever);
        assert_eq!(Wait::from_raw(u32::MAX), Wait::Never);
        assert_eq!(Wait::from_raw(10), Wait::Ticks(10));
        assert_eq!(Wait::Ticks(10).into_raw(), 10);
    }

    #[test]
    fn sysnum_decodes_in_allowed_contexts() {
        let cases = [
            (Sysnum::TaskMake, true, true),
            (Sysnum::TaskUnblock, true, true),
            (Sysnum::TaskDelayCancel, true, true),
            (Sysnum::StartFirstTask, false, true),
            (Sysnum::TaskFinish, true, false),
            (Sysnum::KernelAlloc, true, true),
            (Sysnum::KernelFree, true, true),
            (Sysnum::SemTake, true, true),
            (Sysnum::SemPut, true, true),
            (Sysnum::SemDelete, true, true),
            (Sysnum::MutexDelete, true, false),
            (Sysnum::MutexPut, true, false),
            (Sysnum::MutexTake, true, false),
            (Sysnum::TaskYield, true, false),
            (Sysnum::TaskBlock, true, false),
            (Sysnum::TickEvent, false, true),
            (Sysnum::TaskDelay, true, false),
        ];
        for (nr, from_thread, from_interrupt) in cases {
            let enc = nr.encoding();
            let thread = Sysnum::from_masked(enc & CallerContext::Thread.mask());
            let interrupt =
                Sysnum::from_masked(enc & CallerContext::Interrupt.mask());
            assert_eq!(thread.is_ok(), from_thread, "{nr:?} from thread");
            assert_eq!(
                interrupt.is_ok(),
                from_interrupt,
                "{nr:?} from interrupt"
            );
            if let Ok(decoded) = thread {
                assert_eq!(decoded, nr);
            }
            if let Ok(decoded) = interrupt {
                assert_eq!(decoded, nr);
            }
        }
    }

    #[test]
    fn startup_and_finish_share_a_nibble_but_not_an_operation() {
        assert_eq!(Sysnum::from_masked(0x04), Ok(Sysnum::StartFirstTask));
        assert_eq!(Sysnum::from_masked(0x40), Ok(Sysnum::TaskFinish));
        assert_eq!(Sysnum::from_masked(0x0F), Ok(Sysnum::TickEvent));
        assert_eq!(Sysnum::from_masked(0xF0), Ok(Sysnum::TaskDelay));
        assert!(Sysnum::from_masked(0).is_err());
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lock-free primitives usable from any context.
//!
//! Both structures here avoid the kernel entirely: they never suspend the
//! caller and never mask interrupts, so they are the right tool inside ISRs
//! and on hot paths where a trap is too expensive.
//!
//! The exclusive-access sequences are written as `AtomicU32` read-modify-
//! write loops. On ARMv7-M the compiler lowers those to LDREX/STREX pairs,
//! which is exactly the reservation protocol the design calls for; on the
//! test host they are ordinary CAS loops. Retry is bounded by bus
//! arbitration and is not surfaced to callers.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{fence, AtomicPtr, AtomicU32, Ordering};

use abi::Status;

/// Non-blocking counting semaphore.
///
/// `take` and `put` are reentrant: a caller preempted mid-operation by
/// another caller of the same semaphore loses its reservation and retries,
/// so the counter never tears.
#[derive(Debug)]
pub struct NbSem {
    counter: AtomicU32,
    count: AtomicU32,
}

impl NbSem {
    /// Creates a semaphore with `count` permits available. A zero count is
    /// the deleted state; operations on it fail `NotInitialised`.
    pub const fn new(count: u32) -> Self {
        Self {
            counter: AtomicU32::new(count),
            count: AtomicU32::new(count),
        }
    }

    /// Takes one permit if any is available, failing `WouldBlock` otherwise.
    pub fn take(&self) -> Status {
        if self.count.load(Ordering::Relaxed) == 0 {
            return Status::NotInitialised;
        }
        let mut counter = self.counter.load(Ordering::Relaxed);
        loop {
            if counter == 0 {
                return Status::WouldBlock;
            }
            match self.counter.compare_exchange_weak(
                counter,
                counter - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Status::Ok,
                Err(seen) => counter = seen,
            }
        }
    }

    /// Returns one permit, failing `RecursivePut` at the configured count.
    pub fn put(&self) -> Status {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return Status::NotInitialised;
        }
        let mut counter = self.counter.load(Ordering::Relaxed);
        loop {
            if counter == count {
                return Status::RecursivePut;
            }
            match self.counter.compare_exchange_weak(
                counter,
                counter + 1,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Status::Ok,
                Err(seen) => counter = seen,
            }
        }
    }

    /// Resets the semaphore to the uninitialised state. Fails `CantDelete`
    /// while permits are outstanding. Callers racing `delete` against
    /// `take`/`put` on the same object get what they deserve; the original
    /// design imposes the same rule.
    pub fn delete(&self) -> Status {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return Status::NotInitialised;
        }
        if self
            .counter
            .compare_exchange(count, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Status::CantDelete;
        }
        self.count.store(0, Ordering::Release);
        Status::Ok
    }
}

/// One message: a signal word plus an opaque argument word (typically a
/// pointer the receiver knows how to interpret).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct MsgBlock {
    pub signal: u32,
    pub args: usize,
}

/// Result of a queue operation. Kept separate from [`Status`] because queue
/// traffic has its own failure vocabulary and `Empty` is the hot result
/// worth a cheap zero encoding.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum QueueStatus {
    Empty = 0,
    Ok,
    BadParameters,
    Overrun,
    NotInitialised,
}

/// Lock-free message queue: many producers, one consumer.
///
/// Capacity must be a power of two; one slot is sacrificed to distinguish
/// full from empty, so a queue of capacity N holds N - 1 messages.
///
/// Producers claim a slot by advancing `head` with a reservation loop, then
/// write the payload, then publish with a release barrier. A producer may
/// therefore be observed *after* claiming but *before* publishing; this is
/// harmless exactly when concurrent producers are ordered by interrupt
/// priority (a producer can only be preempted by a higher-priority producer,
/// which claims a *later* slot). That ordering is a requirement on callers.
#[derive(Debug)]
pub struct MsgQueue {
    msgs: AtomicPtr<MsgBlock>,
    head: AtomicU32,
    tail: AtomicU32,
    capacity: AtomicU32,
}

// Safety: slot ownership is handed around by the head/tail index protocol
// described above; the storage pointer itself is written only during init.
unsafe impl Sync for MsgQueue {}

impl MsgQueue {
    /// Creates an empty, storage-less queue. Every operation fails
    /// `NotInitialised` until storage is attached.
    pub const fn new() -> Self {
        Self {
            msgs: AtomicPtr::new(core::ptr::null_mut()),
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            capacity: AtomicU32::new(0),
        }
    }

    /// Attaches caller-owned storage of `capacity` slots.
    ///
    /// # Safety
    ///
    /// `storage` must be valid for reads and writes of `capacity` blocks for
    /// as long as the queue is in use, and must not be shared with anything
    /// else. Not reentrant with respect to other init/deinit calls on the
    /// same queue.
    pub unsafe fn init(&self, storage: *mut MsgBlock, capacity: u32) -> Status {
        if storage.is_null() || capacity == 0 || !capacity.is_power_of_two() {
            return Status::BadParameters;
        }
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        self.msgs.store(storage, Ordering::Relaxed);
        self.capacity.store(capacity, Ordering::Release);
        Status::Ok
    }

    /// Attaches storage obtained from `alloc`, which is handed the byte size
    /// to reserve. Intended for use with the heap allocators; the allocator
    /// choice stays with the caller so this crate links no heap.
    pub fn init_with(
        &self,
        capacity: u32,
        alloc: impl FnOnce(u32) -> *mut u8,
    ) -> Status {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Status::BadParameters;
        }
        let bytes = capacity * core::mem::size_of::<MsgBlock>() as u32;
        let storage = alloc(bytes).cast::<MsgBlock>();
        if storage.is_null() {
            return Status::AllocFail;
        }
        // Safety: the allocator just handed us this exclusively.
        unsafe { self.init(storage, capacity) }
    }

    /// Detaches the storage and hands it back through `free`, which receives
    /// the pointer and byte size.
    ///
    /// # Safety
    ///
    /// No other operation may run concurrently; a racing post or pull would
    /// touch freed memory.
    pub unsafe fn deinit(&self, free: impl FnOnce(*mut u8, u32)) -> Status {
        let capacity = self.capacity.swap(0, Ordering::AcqRel);
        if capacity == 0 {
            return Status::BadParameters;
        }
        let storage = self.msgs.swap(core::ptr::null_mut(), Ordering::Relaxed);
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        free(
            storage.cast(),
            capacity * core::mem::size_of::<MsgBlock>() as u32,
        );
        Status::Ok
    }

    /// Posts one message, failing `Overrun` when the ring is full.
    pub fn post(&self, signal: u32, args: usize) -> QueueStatus {
        let capacity = self.capacity.load(Ordering::Acquire);
        if capacity == 0 {
            return QueueStatus::NotInitialised;
        }

        // Claim a slot by advancing head; losing the race to another
        // producer drops the reservation and retries.
        let mut head = self.head.load(Ordering::Relaxed);
        let claimed = loop {
            let next = (head + 1) & (capacity - 1);
            if next == self.tail.load(Ordering::Acquire) {
                return QueueStatus::Overrun;
            }
            match self.head.compare_exchange_weak(
                head,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break head,
                Err(seen) => head = seen,
            }
        };

        let msgs = self.msgs.load(Ordering::Relaxed);
        // Safety: the index protocol gives us exclusive use of this slot
        // until tail passes it, which cannot happen before the fence below.
        unsafe {
            *msgs.add(claimed as usize) = MsgBlock { signal, args };
        }
        // Publish the payload before the caller can act on our return.
        fence(Ordering::Release);
        QueueStatus::Ok
    }

    /// Pulls the oldest message. Single consumer only.
    pub fn pull(&self) -> Result<MsgBlock, QueueStatus> {
        let capacity = self.capacity.load(Ordering::Acquire);
        if capacity == 0 {
            return Err(QueueStatus::NotInitialised);
        }
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return Err(QueueStatus::Empty);
        }
        fence(Ordering::Acquire);
        let msgs = self.msgs.load(Ordering::Relaxed);
        // Safety: tail != head, so this slot holds a published message that
        // no producer will touch until we advance tail.
        let msg = unsafe { *msgs.add(tail as usize) };
        self.tail
            .store((tail + 1) & (capacity - 1), Ordering::Release);
        Ok(msg)
    }
}

impl Default for MsgQueue {
    fn default() -> Self {
        Self::new()
    }
}

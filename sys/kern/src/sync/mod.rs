// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Blocking synchronization primitives.
//!
//! The control blocks ([`abi::Mutex`], [`abi::Sem`]) are user-allocated;
//! the kernel owns their contents for the duration of each trap. Their wait
//! queues are ordinary priority-ordered task lists, so a waiter leaves by
//! the same `remove_entry` path whether it is handed the object, times out,
//! or sees the object deleted.
//!
//! The lock-free flavors (non-blocking semaphore, message queue) never
//! enter the kernel at all; they live in the `lockless` crate.

#[cfg(feature = "mutex")]
pub mod mutex;
#[cfg(feature = "semaphore")]
pub mod sem;

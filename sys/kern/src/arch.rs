// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here
//! in the `arch` module, magically tailored for the current target.
//!
//! Each architecture support module must define the same set of names. Two
//! ports exist: `arm_m` for ARMv7-M hardware, and `host`, a port with no
//! hardware behind it that lets the rest of the kernel build and run under
//! `cargo test` on the development machine.

cfg_if::cfg_if! {
    if #[cfg(not(target_pointer_width = "32"))] {
        // 64-bit hosts are fine for testing; the kernel's word-size
        // assumptions are expressed in `usize` so the logic is identical.
        pub mod host;
        pub use host::*;
    } else if #[cfg(target_arch = "arm")] {
        pub mod arm_m;
        pub use arm_m::*;
    } else {
        pub mod host;
        pub use host::*;
    }
}

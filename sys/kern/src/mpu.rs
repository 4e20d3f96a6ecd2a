// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory-isolation policy.
//!
//! This module decides *what* gets protected: the PMSAv7 register words for
//! a region, the per-task table (stack region plus up to three
//! caller-supplied regions), and the kernel-wide static map installed once
//! at boot. The architecture layer does the actual register pokes, so all
//! of this stays pure and host-testable.
//!
//! Region slot plan (eight PMSAv7 slots, higher slot wins on overlap):
//!
//! | slot | contents                         | installed |
//! |------|----------------------------------|-----------|
//! | 0    | RAM, full access                 | boot      |
//! | 1-3  | per-task caller-supplied regions | switch    |
//! | 4    | per-task stack, RW no-execute    | switch    |
//! | 5    | flash, read/execute              | boot      |
//! | 6    | null-page guard                  | boot      |
//! | 7    | kernel data, privileged only     | boot      |

use abi::RegionAttributes;

use crate::tcb::Tcb;

/// PMSAv7-style precomputed region data: the contents of the RBAR and RASR
/// registers, minus the VALID bit and region number.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct HwRegion {
    pub rbar: u32,
    pub rasr: u32,
}

/// MPU slot carrying the per-task stack region.
pub const TASK_STACK_SLOT: u8 = 4;
/// MPU slots available for caller-supplied task regions.
pub const TASK_REGION_SLOTS: core::ops::Range<u8> = 1..4;

// Kernel-wide static map geometry. Board-tunable; the defaults cover a
// mid-size STM32-class part with the kernel image at the start of flash and
// kernel data at the start of RAM (the linker script places it there so the
// privileged-only window below covers exactly the kernel's statics).
pub const KERNEL_RAM_BASE: u32 = 0x2000_0000;
pub const KERNEL_RAM_SIZE: u32 = 128 * 1024;
pub const FLASH_BASE: u32 = 0x0800_0000;
pub const FLASH_SIZE: u32 = 512 * 1024;
pub const NULL_GUARD_SIZE: u32 = 32;
pub const KERNEL_DATA_SIZE: u32 = 16 * 1024;

/// Computes the PMSAv7 register words for one region.
///
/// The AP encodings are chosen such that we never deny *privileged* code
/// (i.e. us) access to the memory. The TEX/SCB bits configure memory type,
/// caching policy, and shareability; see table B3-13 in the ARMv7-M ARM.
pub const fn compute_region_data(
    base: u32,
    size: u32,
    attributes: RegionAttributes,
) -> HwRegion {
    // This MPU requires 32-byte alignment of all regions.
    if base & 0x1F != 0 {
        panic!();
    }

    let xn = !attributes.contains(RegionAttributes::EXECUTE);
    let ap = if attributes.contains(RegionAttributes::WRITE) {
        0b011
    } else if attributes.contains(RegionAttributes::READ) {
        0b010
    } else {
        0b001
    };
    let (tex, scb) = if attributes.contains(RegionAttributes::DEVICE) {
        // Device memory.
        (0b000, 0b001)
    } else {
        // Normal memory used only by this core: outer and inner
        // write-back, read and write allocate, not shared.
        (0b001, 0b011)
    };

    // PMSAv7 expresses region size in log2 form *minus one*: the minimum
    // 32-byte region is encoded as 4, because 2**(4 + 1) == 32. Sizes are
    // powers of two (checked at task creation / const evaluation), so log2
    // is a leading-zero count; sizes under 32 underflow here and panic,
    // which beats programming undefined hardware behavior.
    let l2size = 30 - size.leading_zeros();

    let rasr =
        (xn as u32) << 28 | ap << 24 | tex << 19 | scb << 16 | l2size << 1 | 1;
    HwRegion { rbar: base, rasr }
}

/// Builds the stack region for a task: read-write, no-execute, sized to the
/// stack rounded up to a power of two (so a stack aligned to its own
/// rounded size is covered exactly).
pub fn stack_region(tcb: &Tcb) -> HwRegion {
    let size = tcb.stack_size.next_power_of_two().max(32);
    compute_region_data(
        tcb.stack as u32,
        size,
        RegionAttributes::READ.union(RegionAttributes::WRITE),
    )
}

/// The kernel-wide static map: installed once at startup, never changed.
/// Returned as (slot, region) pairs.
pub fn kernel_static_map() -> [(u8, HwRegion); 4] {
    [
        // All of RAM, full access. Task-specific and kernel windows layer
        // on top in higher-numbered slots.
        (
            0,
            compute_region_data(
                KERNEL_RAM_BASE,
                KERNEL_RAM_SIZE,
                RegionAttributes::READ
                    .union(RegionAttributes::WRITE)
                    .union(RegionAttributes::EXECUTE),
            ),
        ),
        // Flash: read and execute for everyone, written by no one.
        (
            5,
            compute_region_data(
                FLASH_BASE,
                FLASH_SIZE,
                RegionAttributes::READ.union(RegionAttributes::EXECUTE),
            ),
        ),
        // Null-page guard: unprivileged access faults.
        (
            6,
            compute_region_data(0, NULL_GUARD_SIZE, RegionAttributes::empty()),
        ),
        // Kernel data: privileged only, never executable.
        (
            7,
            compute_region_data(
                KERNEL_RAM_BASE,
                KERNEL_DATA_SIZE,
                RegionAttributes::empty(),
            ),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::RegionDesc;

    fn ap(rasr: u32) -> u32 {
        (rasr >> 24) & 0b111
    }
    fn xn(rasr: u32) -> bool {
        rasr & (1 << 28) != 0
    }
    fn l2size(rasr: u32) -> u32 {
        (rasr >> 1) & 0x1F
    }
    fn enabled(rasr: u32) -> bool {
        rasr & 1 != 0
    }

    #[test]
    fn encodes_access_permissions() {
        let rw = compute_region_data(
            0x2000_0000,
            32,
            RegionAttributes::READ.union(RegionAttributes::WRITE),
        );
        assert_eq!(ap(rw.rasr), 0b011);
        assert!(xn(rw.rasr));
        assert!(enabled(rw.rasr));

        let ro = compute_region_data(
            0x0800_0000,
            1024,
            RegionAttributes::READ.union(RegionAttributes::EXECUTE),
        );
        assert_eq!(ap(ro.rasr), 0b010);
        assert!(!xn(ro.rasr));

        let none =
            compute_region_data(0, 32, RegionAttributes::empty());
        assert_eq!(ap(none.rasr), 0b001);
    }

    #[test]
    fn encodes_sizes_as_log2_minus_one() {
        for (size, field) in [(32, 4), (128, 6), (4096, 11), (1 << 17, 16)] {
            let r = compute_region_data(
                0x2000_0000,
                size,
                RegionAttributes::READ,
            );
            assert_eq!(l2size(r.rasr), field, "size {size}");
        }
    }

    #[test]
    fn device_regions_use_device_memory_type() {
        let dev = RegionDesc::device(0x4001_0000, 1024);
        let r = compute_region_data(dev.base, dev.size, dev.attributes);
        // TEX=0, S=0, C=0, B=1 for shared device memory.
        assert_eq!((r.rasr >> 16) & 0b111_111, 0b000_001);
        assert!(xn(r.rasr));
    }

    #[test]
    fn stack_region_rounds_to_power_of_two() {
        // Aligned to the rounded size so the low address bits survive the
        // 32-bit truncation with their alignment intact.
        #[repr(align(512))]
        struct AlignedStack([usize; 64]);
        let mut stack = AlignedStack([0; 64]);

        let mut tcb = crate::tcb::TcbSlab::new();
        let id = tcb.alloc().unwrap();
        let t = tcb.get_mut(id);
        t.stack = stack.0.as_mut_ptr();
        t.stack_size = 300;

        let r = stack_region(tcb.get(id));
        assert_eq!(l2size(r.rasr), 8); // rounded up to 512
        assert_eq!(ap(r.rasr), 0b011);
        assert!(xn(r.rasr));
    }

    #[test]
    fn static_map_covers_the_expected_slots() {
        let map = kernel_static_map();
        let slots: Vec<u8> = map.iter().map(|(s, _)| *s).collect();
        assert_eq!(slots, vec![0, 5, 6, 7]);
        for (_, region) in map {
            assert!(enabled(region.rasr));
        }
        // The kernel-data window is not executable and not reachable from
        // unprivileged code.
        let (_, kdata) = map[3];
        assert!(xn(kdata.rasr));
        assert_eq!(ap(kdata.rasr), 0b001);
    }
}

//! Four-level demand-paged address translation.
//!
//! Virtual addresses carry a user-space flag in bit 63 (selecting the user
//! or kernel root table), an 11-bit level-4 selector at bits [54:44], and
//! three 10-bit selectors below it, over 16 KiB pages. Each
//! page-table entry is an 8-byte little-endian word whose low 14 bits are
//! flags; a set big-page flag terminates the walk early and the remaining
//! address bits become the intra-page offset.

pub mod cache;

pub use cache::AddressCache;

use crate::cpu::{Flags, Registers};
use crate::irq::Interrupt;
use crate::mem::GuestMemory;

/// Bit 63 of a virtual address: translate through `upt` instead of `kpt`.
pub const USER_SPACE_FLAG: u64 = 1 << 63;

/// Low 14 bits of a virtual address: offset within a 16 KiB page.
pub const PAGE_OFFSET_MASK: u64 = 0x3fff;

/// Width of the in-page offset; addresses differing above this bit live
/// on different pages.
pub const PAGE_SHIFT: u32 = 14;

/// Low 14 bits of a page-table entry: flag field.
pub const ENTRY_FLAGS_MASK: u64 = 0x3fff;

/// Page-table entry flag: the mapping exists.
pub const ENTRY_PRESENT: u64 = 1 << 0;

/// Page-table entry flag: this entry is a big page terminating the walk.
pub const ENTRY_BIG_PAGE: u64 = 1 << 1;

/// Selector mask and shift for each walk level, outermost first, plus the
/// big-page offset mask covering every less-significant address bit.
const LEVELS: [(u64, u32, u64); 4] = [
    (0x007f_f000_0000_0000, 44, 0x0000_0fff_ffff_ffff), // L4, 11 bits
    (0x0000_0ffc_0000_0000, 34, 0x0000_0003_ffff_ffff), // L3
    (0x0000_0003_ff00_0000, 24, 0x0000_0000_00ff_ffff), // L2
    (0x0000_0000_00ff_c000, 14, PAGE_OFFSET_MASK),      // L1
];

/// Walk intent. `Probe` validates and raises faults; `Translate` assumes a
/// preceding probe succeeded and only computes the offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkMode {
    Probe,
    Translate,
}

/// Translate a virtual address against a core's current register state.
///
/// On failure the returned interrupt is the one the caller must enqueue on
/// the offending core; translation itself has no side effects.
pub fn virt_to_phys(
    regs: &Registers,
    mem: &GuestMemory,
    vaddr: u64,
    mode: WalkMode,
) -> Result<u64, Interrupt> {
    let user = regs.flg.contains(Flags::USER);

    if !regs.flg.contains(Flags::PAGING) {
        if user && mode == WalkMode::Probe {
            return Err(Interrupt::PermissionDenied);
        }
        if vaddr >= mem.len() {
            return Err(Interrupt::InvalidAddress);
        }
        return Ok(vaddr);
    }

    let user_space = vaddr & USER_SPACE_FLAG != 0;
    let v = vaddr & !USER_SPACE_FLAG;
    if user && !user_space {
        return Err(Interrupt::PermissionDenied);
    }

    let mut table = if user_space { regs.upt } else { regs.kpt };
    for (depth, &(mask, shift, big_offset)) in LEVELS.iter().enumerate() {
        let selector = (v & mask) >> shift;
        let entry = mem
            .read_u64(table + selector * 8)
            .map_err(|_| Interrupt::InvalidAddress)?;
        let flags = entry & ENTRY_FLAGS_MASK;
        let addr = entry & !ENTRY_FLAGS_MASK;
        let present = flags & ENTRY_PRESENT != 0;
        let leaf = depth == LEVELS.len() - 1;

        if leaf || flags & ENTRY_BIG_PAGE != 0 {
            if !present && mode == WalkMode::Probe {
                return Err(Interrupt::InvalidAddress);
            }
            let phys = if leaf {
                addr | (v & PAGE_OFFSET_MASK)
            } else {
                addr + (v & big_offset)
            };
            if phys >= mem.len() {
                return Err(Interrupt::InvalidAddress);
            }
            return Ok(phys);
        }

        if !present && mode == WalkMode::Probe {
            return Err(Interrupt::InvalidAddress);
        }
        table = addr;
    }
    unreachable!("walk always terminates at L1");
}

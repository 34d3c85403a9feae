//! Page-table-entry flags and the raw entry type shared by every level.
//!
//! Bit layout follows x86-64 (Intel SDM vol. 3A §4.5), in the style of the
//! `kernel-vmem` pack example's `Flags` bitflags. [`PteFlags::COW`] borrows
//! an available high bit (bit 9, one of the three OS-available bits) the
//! way the teacher's `memory/process_memory.rs` defines `COW_FLAG`.

use super::layout::PAGE_SIZE;

bitflags::bitflags! {
    #[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
    pub struct PteFlags: u64 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY    = 1 << 6;
        /// Page size: at level 2, selects a 2 MiB leaf instead of a PT pointer.
        const PS       = 1 << 7;
        const GLOBAL   = 1 << 8;
        /// OS-available bit: page is copy-on-write shared.
        const COW      = 1 << 9;
        const NO_EXECUTE = 1 << 63;
    }
}

impl PteFlags {
    /// Flags that only make sense on a leaf and must be masked off a
    /// newly-allocated intermediate (non-leaf) table entry (spec §4.A).
    pub const LEAF_ONLY: PteFlags = PteFlags::PS.union(PteFlags::GLOBAL).union(PteFlags::NO_EXECUTE);

    pub fn intermediate(self) -> PteFlags {
        (self & !Self::LEAF_ONLY) | PteFlags::PRESENT | PteFlags::WRITABLE
    }
}

const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// A raw 8-byte page-table entry.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct Pte(pub u64);

impl Pte {
    pub const EMPTY: Pte = Pte(0);

    pub fn new(addr: u64, flags: PteFlags) -> Self {
        debug_assert_eq!(addr & !ADDR_MASK, 0, "physical address not page-aligned/too wide");
        Pte((addr & ADDR_MASK) | flags.bits())
    }

    pub fn addr(self) -> u64 {
        self.0 & ADDR_MASK
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    pub fn present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    pub fn huge(self) -> bool {
        self.flags().contains(PteFlags::PS)
    }

    pub fn set_flags(&mut self, flags: PteFlags) {
        self.0 = self.addr() | flags.bits();
    }

    pub fn clear_present(&mut self) {
        self.0 &= !PteFlags::PRESENT.bits();
    }
}

/// One level of 512 page-table entries, occupying exactly one 4 KiB frame.
#[repr(align(4096))]
pub struct PageTable([Pte; 512]);

impl PageTable {
    pub fn zeroed() -> Self {
        PageTable([Pte::EMPTY; 512])
    }

    pub fn entry(&self, index: usize) -> Pte {
        self.0[index]
    }

    pub fn entry_mut(&mut self, index: usize) -> &mut Pte {
        &mut self.0[index]
    }
}

pub const ENTRIES_PER_TABLE: usize = 512;
const _: () = assert!(core::mem::size_of::<PageTable>() == PAGE_SIZE as usize);

/// Virtual-address index decomposition for a 4- or 5-level walk.
#[derive(Copy, Clone, Debug)]
pub struct VaIndices {
    pub l5: usize,
    pub l4: usize,
    pub l3: usize,
    pub l2: usize,
    pub l1: usize,
}

impl VaIndices {
    pub fn compute(vaddr: u64) -> Self {
        VaIndices {
            l5: ((vaddr >> 48) & 0x1ff) as usize,
            l4: ((vaddr >> 39) & 0x1ff) as usize,
            l3: ((vaddr >> 30) & 0x1ff) as usize,
            l2: ((vaddr >> 21) & 0x1ff) as usize,
            l1: ((vaddr >> 12) & 0x1ff) as usize,
        }
    }
}

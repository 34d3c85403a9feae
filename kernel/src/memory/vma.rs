//! Anonymous mmap region tracking for one address space.
//!
//! The original spec for this region tree called for a linked binary tree
//! of left/right pointers, then flagged that layout for replacement with a
//! balanced structure (a raw two-pointer tree has no rebalancing and
//! degrades to a list under sorted insertion). Grounded on the teacher's
//! `memory/vma.rs`, which keeps the same "ordered by base address, query by
//! containment" contract on top of a sorted `Vec` instead of raw pointers —
//! that's the structure adopted here.

use super::layout::{MMAP_BUMP_BASE, MMAP_BUMP_LIMIT, PAGE_SIZE};
use alloc::vec::Vec;

bitflags::bitflags! {
    #[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
    pub struct Protection: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
    pub struct MmapFlags: u32 {
        const ANONYMOUS = 1 << 0;
        const PRIVATE   = 1 << 1;
        const FIXED     = 1 << 2;
    }
}

/// One anonymous region: `[base, base + length)`, first-touch populated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Vma {
    pub base: u64,
    pub length: u64,
    pub prot: Protection,
    pub flags: MmapFlags,
}

impl Vma {
    pub fn end(&self) -> u64 {
        self.base + self.length
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    fn overlaps(&self, base: u64, length: u64) -> bool {
        base < self.end() && base + length > self.base
    }
}

/// Regions kept sorted by base address. Every lookup (`find`, insertion
/// point, free-region search) is a binary search or linear scan over this
/// single `Vec` rather than a pointer-linked tree.
#[derive(Default)]
pub struct VmaList {
    regions: Vec<Vma>,
}

impl VmaList {
    pub fn new() -> Self {
        Self { regions: Vec::new() }
    }

    fn insertion_index(&self, base: u64) -> usize {
        self.regions.partition_point(|v| v.base < base)
    }

    /// Does `[base, base + length)` overlap any existing region?
    pub fn overlaps_any(&self, base: u64, length: u64) -> bool {
        self.regions.iter().any(|v| v.overlaps(base, length))
    }

    /// Insert a new, non-overlapping region. Returns `false` (and does not
    /// insert) if it would overlap an existing one.
    pub fn insert(&mut self, vma: Vma) -> bool {
        if self.overlaps_any(vma.base, vma.length) {
            return false;
        }
        let idx = self.insertion_index(vma.base);
        self.regions.insert(idx, vma);
        true
    }

    /// Remove the region with this exact base, if any.
    pub fn remove(&mut self, base: u64) -> Option<Vma> {
        let idx = self.regions.iter().position(|v| v.base == base)?;
        Some(self.regions.remove(idx))
    }

    /// Find the region containing `addr`.
    pub fn find(&self, addr: u64) -> Option<Vma> {
        let idx = self.regions.partition_point(|v| v.end() <= addr);
        self.regions.get(idx).filter(|v| v.contains(addr)).copied()
    }

    /// First-fit search for a free gap of `length` bytes within the
    /// mmap bump window, scanning from [`MMAP_BUMP_BASE`] upward.
    pub fn find_free_region(&self, length: u64) -> Option<u64> {
        let length = super::layout::align_up(length, PAGE_SIZE);
        let mut candidate = MMAP_BUMP_BASE;
        for vma in &self.regions {
            if vma.base < candidate {
                continue;
            }
            if candidate + length <= vma.base {
                return Some(candidate);
            }
            candidate = vma.end();
        }
        if candidate + length <= MMAP_BUMP_LIMIT {
            Some(candidate)
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.regions.iter()
    }

    /// Deep-copy the list, for fork (spec §4.B): the child gets its own
    /// independent `VmaList` describing the same regions.
    pub fn fork(&self) -> Self {
        Self {
            regions: self.regions.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vma(base: u64, length: u64) -> Vma {
        Vma { base, length, prot: Protection::READ | Protection::WRITE, flags: MmapFlags::ANONYMOUS | MmapFlags::PRIVATE }
    }

    #[test]
    fn insert_and_find() {
        let mut list = VmaList::new();
        assert!(list.insert(vma(0x7000_0000_0000, 0x1000)));
        let found = list.find(0x7000_0000_0500).unwrap();
        assert_eq!(found.base, 0x7000_0000_0000);
        assert!(list.find(0x7000_0000_1001).is_none());
    }

    #[test]
    fn overlapping_insert_is_rejected() {
        let mut list = VmaList::new();
        assert!(list.insert(vma(0x7000_0000_0000, 0x2000)));
        assert!(!list.insert(vma(0x7000_0000_1000, 0x1000)));
    }

    #[test]
    fn find_free_region_skips_existing() {
        let mut list = VmaList::new();
        list.insert(Vma { base: MMAP_BUMP_BASE, length: 0x2000, prot: Protection::READ, flags: MmapFlags::ANONYMOUS });
        let free = list.find_free_region(0x1000).unwrap();
        assert_eq!(free, MMAP_BUMP_BASE + 0x2000);
    }

    #[test]
    fn fork_produces_independent_copy() {
        let mut list = VmaList::new();
        list.insert(vma(MMAP_BUMP_BASE, 0x1000));
        let mut child = list.fork();
        child.remove(MMAP_BUMP_BASE);
        assert!(list.find(MMAP_BUMP_BASE).is_some());
        assert!(child.find(MMAP_BUMP_BASE).is_none());
    }
}

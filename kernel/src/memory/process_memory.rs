//! One task's address space: its page-table root plus its anonymous mmap
//! regions, with lazy copy-on-write fork and the page-fault handler that
//! backs it (spec §4.B).
//!
//! The fault decision tree and `fork` semantics are grounded on
//! `original_source/kernel/mm/vmm.c`'s `vmm_fork_page_table` and
//! `vmm_pf_handler` — the teacher's own `fork_helpers.rs` copies writable
//! pages eagerly at fork time, which this core deliberately does not do.
//! The surrounding Rust shape (a struct owning an `Arc`-free page-table
//! root plus a fault entry point taking `&mut self`) follows the teacher's
//! `interrupts.rs` CoW handling functions (`handle_cow_fault`,
//! `handle_cow_with_manager`, `handle_cow_direct`).

use super::frame_allocator::FrameAllocator;
use super::frame_metadata;
use super::paging::{self, FirmwareMemoryRegion, PageTableRoot, PagingLevel};
use super::phys::PhysMemory;
use super::pte::PteFlags;
use super::vma::{MmapFlags, Protection, Vma, VmaList};
use crate::error::{KernelError, KResult};

pub struct ProcessMemory {
    pub root: PageTableRoot,
    pub vmas: VmaList,
}

impl ProcessMemory {
    pub fn new(
        mem: &dyn PhysMemory,
        alloc: &mut dyn FrameAllocator,
        level: PagingLevel,
        firmware_map: &[FirmwareMemoryRegion],
    ) -> KResult<Self> {
        let root = paging::default_table(mem, alloc, level, firmware_map)?;
        Ok(Self {
            root,
            vmas: VmaList::new(),
        })
    }

    /// `mmap(length, prot)` (spec §4.B): reserves a region in the VMA list
    /// but does not populate it. Pages are allocated first-touch, by the
    /// fault handler, the first time each one is accessed.
    pub fn mmap_anonymous(&mut self, length: u64, prot: Protection) -> KResult<u64> {
        let base = self
            .vmas
            .find_free_region(length)
            .ok_or(KernelError::InvalidRange)?;
        let aligned_len = super::layout::align_up(length, super::layout::PAGE_SIZE);
        let inserted = self.vmas.insert(Vma {
            base,
            length: aligned_len,
            prot,
            flags: MmapFlags::ANONYMOUS | MmapFlags::PRIVATE,
        });
        debug_assert!(inserted, "find_free_region returned an overlapping base");
        Ok(base)
    }

    /// `munmap(base)`: drop the reservation and unmap whatever pages had
    /// been faulted in, freeing frames that aren't still CoW-shared.
    pub fn munmap(
        &mut self,
        mem: &dyn PhysMemory,
        alloc: &mut dyn FrameAllocator,
        base: u64,
    ) -> KResult<()> {
        let vma = self.vmas.remove(base).ok_or(KernelError::NotFound)?;
        let pages = vma.length / super::layout::PAGE_SIZE;
        let mut vaddr = vma.base;
        for _ in 0..pages {
            if let Some(slot) = paging::lowest_level(mem, self.root, vaddr) {
                let pte = slot.read(mem);
                if pte.present() {
                    let paddr = pte.addr();
                    paging::unmap_page(mem, self.root, vaddr);
                    // Check before decrementing, the same ordering
                    // break_cow() uses: once another mapping shares this
                    // frame, dropping ours never makes it safe to free —
                    // that call is the remaining owner's alone.
                    if frame_metadata::refcount(paddr) <= 1 {
                        alloc.free_frame(paddr);
                    } else {
                        frame_metadata::dec_refcount(paddr);
                    }
                }
            }
            vaddr += super::layout::PAGE_SIZE;
        }
        Ok(())
    }

    /// `fork()` (spec §4.B): clone the VMA list, then walk every present
    /// leaf mapping and share it between parent and child instead of
    /// copying. Both sides' PTEs get the [`PteFlags::COW`] bit and lose
    /// [`PteFlags::WRITABLE`]; the frame's refcount starts (or grows) at 2.
    /// A write fault resolves the actual copy later, lazily.
    pub fn fork(
        &mut self,
        mem: &dyn PhysMemory,
        alloc: &mut dyn FrameAllocator,
    ) -> KResult<ProcessMemory> {
        let child = ProcessMemory {
            root: paging::default_table(mem, alloc, self.root.level, &[])?,
            vmas: self.vmas.fork(),
        };

        for vma in self.vmas.iter().copied().collect::<alloc::vec::Vec<_>>() {
            let pages = vma.length / super::layout::PAGE_SIZE;
            let mut vaddr = vma.base;
            for _ in 0..pages {
                if let Some(slot) = paging::lowest_level(mem, self.root, vaddr) {
                    let pte = slot.read(mem);
                    if pte.present() {
                        let paddr = pte.addr();
                        let shared_flags = (pte.flags() & !PteFlags::WRITABLE) | PteFlags::COW;

                        slot.write(mem, super::pte::Pte::new(paddr, shared_flags));
                        paging::invalidate(vaddr);

                        if frame_metadata::is_shared(paddr) {
                            frame_metadata::inc_refcount(paddr);
                        } else {
                            frame_metadata::set_refcount(paddr, 2);
                        }

                        paging::map_page(mem, alloc, child.root, vaddr, paddr, shared_flags)?;
                    }
                }
                vaddr += super::layout::PAGE_SIZE;
            }
        }

        Ok(child)
    }

    /// The page-fault decision tree (spec §4.B), grounded on `vmm_pf_handler`:
    ///
    /// 1. No leaf mapping exists at all: if `vaddr` falls inside a known VMA,
    ///    this is first-touch — allocate and map a fresh frame. Otherwise the
    ///    access is genuinely invalid.
    /// 2. A leaf mapping exists, is not present, and is CoW-shared on a write:
    ///    break the share — promote in place if this is the last owner,
    ///    otherwise copy the frame into a freshly allocated one.
    /// 3. A leaf mapping exists and is simply not writable (no CoW bit): the
    ///    access violates the region's protection.
    pub fn handle_page_fault(
        &mut self,
        mem: &dyn PhysMemory,
        alloc: &mut dyn FrameAllocator,
        vaddr: u64,
        write: bool,
    ) -> KResult<()> {
        let page = super::layout::align_down(vaddr, super::layout::PAGE_SIZE);

        let existing = paging::lowest_level(mem, self.root, page).filter(|slot| slot.read(mem).present());

        match existing {
            None => {
                let vma = self.vmas.find(page).ok_or(KernelError::InvalidRange)?;
                let frame = alloc.alloc_frames(1, 1).ok_or(KernelError::OutOfFrames)?;
                unsafe { mem.zero_frame(frame) };
                let flags = leaf_flags(vma.prot) | PteFlags::PRESENT;
                paging::map_page(mem, alloc, self.root, page, frame, flags)?;
                Ok(())
            }
            Some(slot) => {
                let pte = slot.read(mem);
                if !write || !pte.flags().contains(PteFlags::COW) {
                    return Err(KernelError::InvalidRange);
                }
                self.break_cow(mem, alloc, slot, pte.addr(), page)
            }
        }
    }

    fn break_cow(
        &mut self,
        mem: &dyn PhysMemory,
        alloc: &mut dyn FrameAllocator,
        slot: paging::PteSlot,
        paddr: u64,
        vaddr: u64,
    ) -> KResult<()> {
        let vma = self.vmas.find(vaddr).ok_or(KernelError::InvalidRange)?;
        let new_flags = leaf_flags(vma.prot) | PteFlags::PRESENT;

        if frame_metadata::refcount(paddr) <= 1 {
            // No other mapping still points at this frame: safe to promote
            // this one in place without touching anyone else's view of it.
            slot.write(mem, super::pte::Pte::new(paddr, new_flags));
        } else {
            // Still shared: this mapping is moving off the frame, so it
            // drops its claim on it (the remaining sharer will see the
            // count fall to 1 and promote in place on its own fault).
            frame_metadata::dec_refcount(paddr);
            let copy = alloc.alloc_frames(1, 1).ok_or(KernelError::OutOfFrames)?;
            unsafe { mem.copy_frame(paddr, copy) };
            slot.write(mem, super::pte::Pte::new(copy, new_flags));
        }

        paging::invalidate(vaddr);
        Ok(())
    }
}

fn leaf_flags(prot: Protection) -> PteFlags {
    let mut flags = PteFlags::USER;
    if prot.contains(Protection::WRITE) {
        flags |= PteFlags::WRITABLE;
    }
    if !prot.contains(Protection::EXEC) {
        flags |= PteFlags::NO_EXECUTE;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame_allocator::BumpFrameAllocator;
    use crate::memory::phys::sim::SimMemory;

    const ARENA: usize = 64 * 1024 * 1024;

    fn fresh() -> (SimMemory, BumpFrameAllocator, ProcessMemory) {
        let mem = SimMemory::new(ARENA);
        let mut alloc = BumpFrameAllocator::new(super::super::layout::PAGE_SIZE, ARENA as u64);
        let pm = ProcessMemory::new(&mem, &mut alloc, PagingLevel::Four, &[]).unwrap();
        (mem, alloc, pm)
    }

    #[test]
    fn anonymous_mmap_is_first_touch_populated() {
        let (mem, mut alloc, mut pm) = fresh();
        let base = pm.mmap_anonymous(PAGE_SIZE_TEST, Protection::READ | Protection::WRITE).unwrap();

        assert!(paging::lowest_level(&mem, pm.root, base).is_none());

        pm.handle_page_fault(&mem, &mut alloc, base, true).unwrap();
        let slot = paging::lowest_level(&mem, pm.root, base).unwrap();
        assert!(slot.read(&mem).present());
    }

    #[test]
    fn fault_outside_any_vma_is_rejected() {
        let (mem, mut alloc, mut pm) = fresh();
        assert!(pm.handle_page_fault(&mem, &mut alloc, 0x1234_0000, true).is_err());
    }

    #[test]
    fn fork_shares_pages_as_copy_on_write() {
        let (mem, mut alloc, mut parent) = fresh();
        let base = parent.mmap_anonymous(PAGE_SIZE_TEST, Protection::READ | Protection::WRITE).unwrap();
        parent.handle_page_fault(&mem, &mut alloc, base, true).unwrap();

        let parent_paddr = paging::lowest_level(&mem, parent.root, base).unwrap().read(&mem).addr();

        let mut child = parent.fork(&mem, &mut alloc).unwrap();

        let parent_pte = paging::lowest_level(&mem, parent.root, base).unwrap().read(&mem);
        let child_pte = paging::lowest_level(&mem, child.root, base).unwrap().read(&mem);
        assert!(parent_pte.flags().contains(PteFlags::COW));
        assert!(child_pte.flags().contains(PteFlags::COW));
        assert_eq!(child_pte.addr(), parent_paddr);
        assert!(frame_metadata::is_shared(parent_paddr));

        // Child writes: breaks CoW, gets a private copy; parent's frame untouched.
        child.handle_page_fault(&mem, &mut alloc, base, true).unwrap();
        let child_pte_after = paging::lowest_level(&mem, child.root, base).unwrap().read(&mem);
        assert_ne!(child_pte_after.addr(), parent_paddr);
        assert!(!child_pte_after.flags().contains(PteFlags::COW));

        // Parent is now the sole owner again: its own write promotes in place.
        parent.handle_page_fault(&mem, &mut alloc, base, true).unwrap();
        let parent_pte_after = paging::lowest_level(&mem, parent.root, base).unwrap().read(&mem);
        assert_eq!(parent_pte_after.addr(), parent_paddr);
        assert!(!parent_pte_after.flags().contains(PteFlags::COW));
    }

    #[test]
    fn munmap_of_still_shared_page_does_not_free_the_frame() {
        let (mem, mut alloc, mut parent) = fresh();
        let base = parent.mmap_anonymous(PAGE_SIZE_TEST, Protection::READ | Protection::WRITE).unwrap();
        parent.handle_page_fault(&mem, &mut alloc, base, true).unwrap();
        let shared_paddr = paging::lowest_level(&mem, parent.root, base).unwrap().read(&mem).addr();

        let child = parent.fork(&mem, &mut alloc).unwrap();
        assert!(frame_metadata::is_shared(shared_paddr));

        parent.munmap(&mem, &mut alloc, base).unwrap();

        // The child still maps shared_paddr; a fresh allocation must not
        // be handed the same frame out from under it.
        let fresh_frame = alloc.alloc_frames(1, 1).unwrap();
        assert_ne!(fresh_frame, shared_paddr);

        let child_pte = paging::lowest_level(&mem, child.root, base).unwrap().read(&mem);
        assert_eq!(child_pte.addr(), shared_paddr);
    }

    const PAGE_SIZE_TEST: u64 = super::super::layout::PAGE_SIZE;
}

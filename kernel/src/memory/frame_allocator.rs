//! Physical frame allocator contract.
//!
//! The physical memory allocator lives outside this core (spec §1): it is
//! consumed only through the [`FrameAllocator`] trait. A bump-pointer test
//! double is provided below, in the teacher's style of exposing a
//! free-list-backed allocator behind a narrow interface
//! (`memory/frame_allocator.rs`), trimmed to the contract the VMM actually
//! calls: `alloc_frames(count, alignment)`.

use crate::error::{KernelError, KResult};
use alloc::vec::Vec;
use spin::Mutex;

/// Hands out physical frames. `alignment` is expressed in frames (1 for a
/// 4 KiB-aligned frame, 512 for a 2 MiB-aligned large frame).
pub trait FrameAllocator {
    /// Allocate `count` contiguous frames aligned to `alignment` frames.
    /// Returns the physical address of the first frame.
    fn alloc_frames(&mut self, count: usize, alignment: u64) -> Option<u64>;

    /// Return a single frame to the allocator.
    fn free_frame(&mut self, paddr: u64);

    fn alloc_frame(&mut self) -> Option<u64> {
        self.alloc_frames(1, 1)
    }
}

/// A simple bump allocator with a free list for reuse, sized against a host
/// [`super::phys::sim::SimMemory`] region. Used by unit tests and available
/// under `testing` for integration harnesses that need a real allocator
/// without a bootloader memory map.
pub struct BumpFrameAllocator {
    next: u64,
    limit: u64,
    free_list: Vec<u64>,
}

impl BumpFrameAllocator {
    pub fn new(base: u64, limit: u64) -> Self {
        Self {
            next: base,
            limit,
            free_list: Vec::new(),
        }
    }
}

impl FrameAllocator for BumpFrameAllocator {
    fn alloc_frames(&mut self, count: usize, alignment: u64) -> Option<u64> {
        let align_bytes = alignment * crate::memory::layout::PAGE_SIZE;
        if count == 1 && alignment == 1 {
            if let Some(f) = self.free_list.pop() {
                return Some(f);
            }
        }
        let start = crate::memory::layout::align_up(self.next, align_bytes);
        let size = count as u64 * crate::memory::layout::PAGE_SIZE;
        if start + size > self.limit {
            return None;
        }
        self.next = start + size;
        Some(start)
    }

    fn free_frame(&mut self, paddr: u64) {
        self.free_list.push(paddr);
    }
}

pub struct LockedBumpFrameAllocator(pub Mutex<BumpFrameAllocator>);

impl LockedBumpFrameAllocator {
    pub fn new(base: u64, limit: u64) -> Self {
        Self(Mutex::new(BumpFrameAllocator::new(base, limit)))
    }

    pub fn alloc_frame(&self) -> KResult<u64> {
        self.0.lock().alloc_frames(1, 1).ok_or(KernelError::OutOfFrames)
    }

    pub fn free_frame(&self, paddr: u64) {
        self.0.lock().free_frame(paddr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocator_hands_out_distinct_aligned_frames() {
        let mut a = BumpFrameAllocator::new(0x1000, 0x10_0000);
        let f1 = a.alloc_frames(1, 1).unwrap();
        let f2 = a.alloc_frames(1, 1).unwrap();
        assert_ne!(f1, f2);
        assert_eq!(f1 % 0x1000, 0);
        assert_eq!(f2 % 0x1000, 0);
    }

    #[test]
    fn large_frame_alignment_is_honored() {
        let mut a = BumpFrameAllocator::new(0x1000, 0x100_0000);
        let f = a.alloc_frames(512, 512).unwrap();
        assert_eq!(f % 0x20_0000, 0);
    }

    #[test]
    fn freed_frames_are_reused() {
        let mut a = BumpFrameAllocator::new(0x1000, 0x10_0000);
        let f1 = a.alloc_frames(1, 1).unwrap();
        a.free_frame(f1);
        let f2 = a.alloc_frames(1, 1).unwrap();
        assert_eq!(f1, f2);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut a = BumpFrameAllocator::new(0x1000, 0x3000);
        assert!(a.alloc_frames(1, 1).is_some());
        assert!(a.alloc_frames(1, 1).is_some());
        assert!(a.alloc_frames(1, 1).is_none());
    }
}

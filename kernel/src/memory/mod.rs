//! Page tables, physical frame contracts, and per-task address spaces.

pub mod frame_allocator;
pub mod frame_metadata;
pub mod layout;
pub mod paging;
pub mod phys;
pub mod process_memory;
pub mod pte;
pub mod vma;

pub use paging::{PageTableRoot, PagingLevel};
pub use process_memory::ProcessMemory;

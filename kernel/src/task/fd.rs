//! Per-task file descriptor table.
//!
//! Grounded on `original_source/kernel/sched/sched.c`'s `sched_task_exec`,
//! which opens stdin/stdout/stderr as `struct fd_handle`s wrapping a
//! `struct asset` with `read`/`write` function pointers. [`Asset`] is the
//! trait form of that vtable; [`FdHandle`] is the handle.
//!
//! Per the design notes (§9), the bitmap reserving fd numbers 0-2 and the
//! table holding their handles are unified here instead of kept as two
//! parallel structures (a `fd_bitmap` plus a separate `fd_list` hash
//! table, as in the original): [`FdTable`] wraps one [`super::ids::IdBitmap`]
//! and one map, so a reserved-but-unopened fd cannot exist.

use super::ids::IdBitmap;
use crate::error::{KernelError, KResult};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;

bitflags::bitflags! {
    #[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
    pub struct OpenFlags: u32 {
        const RDONLY = 0;
        const WRONLY = 1 << 0;
        const RDWR   = 1 << 1;
    }
}

/// A byte-addressable backing store a file descriptor reads/writes
/// through — a tty, a partition (spec §4.E), or a regular file.
pub trait Asset: Send + Sync {
    fn read(&self, position: u64, buffer: &mut [u8]) -> KResult<usize>;
    fn write(&self, position: u64, buffer: &[u8]) -> KResult<usize>;
}

pub struct FdHandle {
    pub fd_number: usize,
    pub flags: OpenFlags,
    pub position: u64,
    pub asset: Box<dyn Asset>,
}

const MAX_FDS: usize = 256;

pub struct FdTable {
    ids: IdBitmap,
    handles: BTreeMap<usize, FdHandle>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            ids: IdBitmap::new(MAX_FDS),
            handles: BTreeMap::new(),
        }
    }

    pub fn install(&mut self, asset: Box<dyn Asset>, flags: OpenFlags) -> KResult<usize> {
        let fd = self.ids.alloc().ok_or(KernelError::IdsExhausted)?;
        self.handles.insert(
            fd,
            FdHandle {
                fd_number: fd,
                flags,
                position: 0,
                asset,
            },
        );
        Ok(fd)
    }

    pub fn close(&mut self, fd: usize) -> KResult<()> {
        if self.handles.remove(&fd).is_none() {
            return Err(KernelError::NotFound);
        }
        self.ids.free(fd);
        Ok(())
    }

    pub fn get(&self, fd: usize) -> Option<&FdHandle> {
        self.handles.get(&fd)
    }

    pub fn get_mut(&mut self, fd: usize) -> Option<&mut FdHandle> {
        self.handles.get_mut(&fd)
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullAsset;
    impl Asset for NullAsset {
        fn read(&self, _position: u64, buffer: &mut [u8]) -> KResult<usize> {
            buffer.fill(0);
            Ok(buffer.len())
        }
        fn write(&self, _position: u64, buffer: &[u8]) -> KResult<usize> {
            Ok(buffer.len())
        }
    }

    #[test]
    fn stdio_triplet_gets_fds_zero_one_two() {
        let mut table = FdTable::new();
        let stdin = table.install(alloc::boxed::Box::new(NullAsset), OpenFlags::RDONLY).unwrap();
        let stdout = table.install(alloc::boxed::Box::new(NullAsset), OpenFlags::WRONLY).unwrap();
        let stderr = table.install(alloc::boxed::Box::new(NullAsset), OpenFlags::WRONLY).unwrap();
        assert_eq!((stdin, stdout, stderr), (0, 1, 2));
    }

    #[test]
    fn closed_fd_is_reused() {
        let mut table = FdTable::new();
        let fd = table.install(alloc::boxed::Box::new(NullAsset), OpenFlags::RDONLY).unwrap();
        table.close(fd).unwrap();
        let fd2 = table.install(alloc::boxed::Box::new(NullAsset), OpenFlags::RDONLY).unwrap();
        assert_eq!(fd, fd2);
    }

    #[test]
    fn closing_unopened_fd_errors() {
        let mut table = FdTable::new();
        assert!(table.close(5).is_err());
    }
}

//! Kernel-wide error taxonomy.
//!
//! The core recovers locally from first-touch faults and CoW breaks; every
//! other failure is propagated to the caller as one of these kinds so that
//! callers can match on cause rather than parsing a string (see spec §7).

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Partition read/write past the end of the device.
    InvalidRange,
    /// Underlying disk read/write failed.
    Io,
    /// A path could not be found (e.g. ELF open during `task_exec`).
    NotFound,
    /// A file could not be opened or its contents failed to load.
    OpenFailed,
    /// `lowest_level`/page-record lookup found nothing where one was expected.
    MissingRecord,
    /// Scheduler re-entered `sched_lock`; caller should let the next tick retry.
    LockBusy,
    /// Neither MBR nor GPT were found on a disk.
    NoPartitions,
    /// The physical frame allocator is out of memory.
    OutOfFrames,
    /// A pid/tid/fd bitmap has no free slots left.
    IdsExhausted,
    /// An address-space operation found an overlapping or invalid region.
    InvalidRegion,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::InvalidRange => "range exceeds device bounds",
            KernelError::Io => "device I/O error",
            KernelError::NotFound => "no such file or directory",
            KernelError::OpenFailed => "failed to open executable",
            KernelError::MissingRecord => "expected page-table record missing",
            KernelError::LockBusy => "scheduler lock busy",
            KernelError::NoPartitions => "no partitions found",
            KernelError::OutOfFrames => "physical frame allocator exhausted",
            KernelError::IdsExhausted => "pid/tid/fd bitmap exhausted",
            KernelError::InvalidRegion => "invalid or overlapping memory region",
        };
        f.write_str(msg)
    }
}

pub type KResult<T> = Result<T, KernelError>;

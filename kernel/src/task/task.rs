//! A task (process): one page table, a set of threads, and a file
//! descriptor table (spec §3).
//!
//! Grounded on `original_source/kernel/sched/sched.c`'s `sched_default_task`:
//! pid allocated from a global bitmap, ppid recorded from the caller's
//! current task, a private tid bitmap for its own threads.

use super::fd::FdTable;
use super::ids::IdBitmap;
use super::thread::Thread;
use crate::memory::ProcessMemory;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TaskState {
    /// Newly created, not yet scheduled (matches the original's
    /// `TASK_YIELD` status immediately after `sched_default_task`).
    Yield,
    Waiting,
    Running,
    Terminated,
}

pub struct Task {
    pub pid: u64,
    pub ppid: Option<u64>,
    pub state: TaskState,
    pub idle_count: u64,
    pub page_table: ProcessMemory,
    pub tid_bitmap: IdBitmap,
    pub fds: FdTable,
    pub threads: Vec<Arc<Mutex<Thread>>>,
}

const MAX_THREADS_PER_TASK: usize = 256;

impl Task {
    pub fn new(pid: u64, ppid: Option<u64>, page_table: ProcessMemory) -> Self {
        Self {
            pid,
            ppid,
            state: TaskState::Yield,
            idle_count: 0,
            page_table,
            tid_bitmap: IdBitmap::new(MAX_THREADS_PER_TASK),
            fds: FdTable::new(),
            threads: Vec::new(),
        }
    }

    pub fn add_thread(&mut self, thread: Thread) -> Arc<Mutex<Thread>> {
        let handle = Arc::new(Mutex::new(thread));
        self.threads.push(handle.clone());
        handle
    }
}

//! Global scheduler: task/thread selection and the context-switch protocol
//! (spec §4.D).
//!
//! Selection policy and the `sched_lock` test-and-set discipline are
//! grounded on `original_source/kernel/sched/sched.c`'s `find_next_task`,
//! `find_next_thread`, and `reschedule`: every task (then every thread of
//! the winning task) has its `idle_count` incremented on each tick
//! regardless of state, and among the `Waiting` candidates the one with
//! the strictly-largest `idle_count` wins — ties keep whichever was found
//! first. The teacher's `Arc<Mutex<Thread>>` storage and deferred-drop
//! `retire_list` idiom (`task/scheduler.rs`) carry over; the round-robin
//! ready queue it uses instead of this selection policy does not.

use super::ids::IdBitmap;
use super::task::{Task, TaskState};
use super::thread::ThreadState;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

/// Test-and-set lock guarding the whole scheduler. Grounded on the
/// original's `char sched_lock` plus `__atomic_test_and_set`: a contended
/// acquire does not spin, it simply fails so the caller (a timer
/// interrupt handler, in the original) can return without re-entering —
/// the next tick retries.
pub struct SchedLock(AtomicBool);

impl SchedLock {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn try_acquire(&self) -> bool {
        !self.0.swap(true, Ordering::Acquire)
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for SchedLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of picking and committing to the next thread to run: the outgoing
/// (pid, tid) if there was one, and the incoming (pid, tid).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SwitchDecision {
    pub from: Option<(u64, usize)>,
    pub to: (u64, usize),
}

pub struct Scheduler {
    tasks: BTreeMap<u64, Arc<Mutex<Task>>>,
    pid_bitmap: IdBitmap,
    current: Option<(u64, usize)>,
    /// Deferred-drop list: a terminated task's `Arc` is moved here instead
    /// of dropped immediately, so its last reference isn't released while
    /// this core might still be mid-switch out of one of its threads.
    retire_list: Vec<Arc<Mutex<Task>>>,
}

const MAX_TASKS: usize = 4096;

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            pid_bitmap: IdBitmap::new(MAX_TASKS),
            current: None,
            retire_list: Vec::new(),
        }
    }

    pub fn alloc_pid(&mut self) -> Option<u64> {
        self.pid_bitmap.alloc().map(|id| id as u64)
    }

    pub fn add_task(&mut self, task: Task) -> Arc<Mutex<Task>> {
        let pid = task.pid;
        let handle = Arc::new(Mutex::new(task));
        self.tasks.insert(pid, handle.clone());
        handle
    }

    pub fn task(&self, pid: u64) -> Option<Arc<Mutex<Task>>> {
        self.tasks.get(&pid).cloned()
    }

    pub fn current(&self) -> Option<(u64, usize)> {
        self.current
    }

    pub fn remove_task(&mut self, pid: u64) {
        if let Some(handle) = self.tasks.remove(&pid) {
            self.pid_bitmap.free(pid as usize);
            self.retire_list.push(handle);
        }
    }

    /// Drop retired tasks whose only remaining reference is this list's own
    /// (nothing else still holds a pointer into one of its threads).
    pub fn drain_retired(&mut self) {
        self.retire_list.retain(|t| Arc::strong_count(t) > 1);
    }

    /// `find_next_task` (spec §4.D): increments every task's `idle_count`,
    /// returns the pid of the `Waiting` task with the strictly-largest
    /// count seen so far.
    fn find_next_task(&mut self) -> Option<u64> {
        let mut best: Option<(u64, u64)> = None;
        for (&pid, task) in self.tasks.iter() {
            let mut t = task.lock();
            t.idle_count += 1;
            if t.state == TaskState::Waiting {
                let better = match best {
                    Some((_, cnt)) => t.idle_count > cnt,
                    None => true,
                };
                if better {
                    best = Some((pid, t.idle_count));
                }
            }
        }
        best.map(|(pid, _)| pid)
    }

    /// `find_next_thread` (spec §4.D), scoped to one task's thread list.
    fn find_next_thread(&self, task: &Arc<Mutex<Task>>) -> Option<usize> {
        let t = task.lock();
        let mut best: Option<(usize, u64)> = None;
        for thread in &t.threads {
            let mut th = thread.lock();
            th.idle_count += 1;
            if th.state == ThreadState::Waiting {
                let better = match best {
                    Some((_, cnt)) => th.idle_count > cnt,
                    None => true,
                };
                if better {
                    best = Some((th.tid, th.idle_count));
                }
            }
        }
        best.map(|(tid, _)| tid)
    }

    /// Select and commit to the next thread to run. Mirrors
    /// `reschedule`'s bookkeeping: the outgoing thread/task (if any, and
    /// not already terminated) goes back to `Waiting`; the incoming one's
    /// `idle_count` resets to 0 and its state becomes `Running`.
    pub fn reschedule(&mut self) -> Option<SwitchDecision> {
        let next_pid = self.find_next_task()?;
        let next_task = self.tasks.get(&next_pid)?.clone();
        let next_tid = self.find_next_thread(&next_task)?;

        let from = self.current.take();
        if let Some((pid, tid)) = from {
            if let Some(task) = self.tasks.get(&pid) {
                let mut t = task.lock();
                if t.state != TaskState::Terminated {
                    t.state = TaskState::Waiting;
                }
                if let Some(thread) = t.threads.iter().find(|th| th.lock().tid == tid) {
                    let mut th = thread.lock();
                    if th.state != ThreadState::Terminated {
                        th.state = ThreadState::Waiting;
                    }
                }
            }
        }

        {
            let mut t = next_task.lock();
            t.idle_count = 0;
            t.state = TaskState::Running;
            if let Some(thread) = t.threads.iter().find(|th| th.lock().tid == next_tid) {
                let mut th = thread.lock();
                th.idle_count = 0;
                th.state = ThreadState::Running;
            }
        }

        self.current = Some((next_pid, next_tid));
        Some(SwitchDecision {
            from,
            to: (next_pid, next_tid),
        })
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

pub static SCHEDULER: Mutex<Option<Scheduler>> = Mutex::new(None);

pub fn init() {
    *SCHEDULER.lock() = Some(Scheduler::new());
}

/// Switch CR3 to `root` and issue the matching memory barrier (real
/// hardware only; the actual register restore and `iretq` live in the
/// interrupt entry stub outside this core's scope).
#[cfg(feature = "hardware")]
pub fn switch_page_table(root: crate::memory::PageTableRoot) {
    crate::memory::paging::init_page_table(root);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame_allocator::BumpFrameAllocator;
    use crate::memory::phys::sim::SimMemory;
    use crate::memory::{PagingLevel, ProcessMemory};
    use crate::task::thread::default_thread;

    fn task_with_threads(pid: u64, thread_count: usize) -> Task {
        let mem = SimMemory::new(1024 * 1024);
        let mut alloc = BumpFrameAllocator::new(0x1000, 1024 * 1024);
        let pm = ProcessMemory::new(&mem, &mut alloc, PagingLevel::Four, &[]).unwrap();
        let mut task = Task::new(pid, None, pm);
        for _ in 0..thread_count {
            let thread = default_thread(pid, &mut task.tid_bitmap, 0).unwrap();
            task.add_thread(thread);
        }
        task.state = TaskState::Waiting;
        for thread in &task.threads {
            thread.lock().state = ThreadState::Waiting;
        }
        task
    }

    #[test]
    fn longest_waiting_task_is_selected() {
        let mut sched = Scheduler::new();
        let mut a = task_with_threads(0, 1);
        a.idle_count = 5;
        let mut b = task_with_threads(1, 1);
        b.idle_count = 1;
        sched.add_task(a);
        sched.add_task(b);

        let decision = sched.reschedule().unwrap();
        assert_eq!(decision.to.0, 0, "task with larger idle_count should win");
    }

    #[test]
    fn selection_resets_idle_count_and_marks_running() {
        let mut sched = Scheduler::new();
        sched.add_task(task_with_threads(0, 1));
        let decision = sched.reschedule().unwrap();
        let task = sched.task(decision.to.0).unwrap();
        let t = task.lock();
        assert_eq!(t.idle_count, 0);
        assert_eq!(t.state, TaskState::Running);
    }

    #[test]
    fn outgoing_task_returns_to_waiting() {
        let mut sched = Scheduler::new();
        sched.add_task(task_with_threads(0, 1));
        sched.add_task(task_with_threads(1, 1));

        let first = sched.reschedule().unwrap();
        let second = sched.reschedule().unwrap();
        assert_eq!(second.from, Some(first.to));

        let outgoing = sched.task(first.to.0).unwrap();
        assert_eq!(outgoing.lock().state, TaskState::Waiting);
    }

    #[test]
    fn sched_lock_rejects_reentry_until_released() {
        let lock = SchedLock::new();
        assert!(lock.try_acquire());
        assert!(!lock.try_acquire());
        lock.release();
        assert!(lock.try_acquire());
    }

    #[test]
    fn retired_task_is_dropped_once_unreferenced() {
        let mut sched = Scheduler::new();
        let handle = sched.add_task(task_with_threads(0, 1));
        sched.remove_task(0);
        assert_eq!(sched.retire_list.len(), 1);
        drop(handle);
        sched.drain_retired();
        assert!(sched.retire_list.is_empty());
    }
}

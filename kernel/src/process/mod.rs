//! Program startup: build a fresh task and its first thread from an ELF
//! image (spec §4.D).
//!
//! Grounded on `original_source/kernel/sched/sched.c`'s `sched_task_exec`
//! and `sched_thread_exec`. Locating and reading the executable's bytes
//! from a path is a filesystem concern out of scope here (spec §1/§5);
//! callers already have the image loaded (e.g. read through a
//! [`crate::block`] partition) and hand it in as `data`.

pub mod elf;

use crate::error::{KernelError, KResult};
use crate::memory::frame_allocator::FrameAllocator;
use crate::memory::layout::{INTERPRETER_BASE, THREAD_USER_STACK_SIZE};
use crate::memory::phys::PhysMemory;
use crate::memory::vma::Protection;
use crate::memory::{PagingLevel, ProcessMemory};
use crate::task::fd::{Asset, FdTable, OpenFlags};
use crate::task::task::{Task, TaskState};
use crate::task::thread::{default_thread, place_arguments, ExecArguments, Thread};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// `cs` selector for ring 3 (`0x3` in the low two bits marks a userspace
/// code segment, matching `sched_thread_exec`'s `cs & 0x3` branch).
pub const USER_CODE_SELECTOR: u16 = 0x23;

/// Build the stdin/stdout/stderr triplet every task starts with, backed by
/// `tty`. Grounded on `sched_task_exec`'s `tty_read`/`tty_write` wiring.
pub fn install_stdio(fds: &mut FdTable, tty: impl Fn() -> Box<dyn Asset>) -> KResult<(usize, usize, usize)> {
    let stdin = fds.install(tty(), OpenFlags::RDONLY)?;
    let stdout = fds.install(tty(), OpenFlags::WRONLY)?;
    let stderr = fds.install(tty(), OpenFlags::WRONLY)?;
    Ok((stdin, stdout, stderr))
}

/// Start a new task running `data` (an ELF image), with `argv`/`envp` laid
/// out on its initial thread's user stack.
///
/// `tty` backs the stdin/stdout/stderr triplet every task starts with.
/// `load_interpreter` resolves a PT_INTERP path (e.g. `/lib/ld.so`) to its
/// bytes when `data` is a dynamically-linked image; locating and reading
/// that file is the same out-of-scope filesystem concern as `data` itself
/// (spec §1/§5), so the caller supplies it rather than this module opening
/// paths directly. Mirrors `sched_task_exec`'s `ld_path` handling: when an
/// interpreter is present it's loaded at [`INTERPRETER_BASE`] and its own
/// entry point — not the main binary's — becomes the thread's `rip`.
#[allow(clippy::too_many_arguments)]
pub fn task_exec(
    mem: &dyn PhysMemory,
    alloc: &mut dyn FrameAllocator,
    pid: u64,
    level: PagingLevel,
    data: &[u8],
    args: &ExecArguments<'_>,
    tty: impl Fn() -> Box<dyn Asset>,
    load_interpreter: impl FnOnce(&str) -> KResult<Vec<u8>>,
) -> KResult<(Task, Arc<Mutex<Thread>>)> {
    let mut page_table = ProcessMemory::new(mem, alloc, level, &[])?;

    let loaded = elf::load(mem, alloc, &mut page_table, data, 0)?;
    let mut entry = loaded.aux.at_entry;

    if let Some(path) = &loaded.interpreter {
        let interp_data = load_interpreter(path)?;
        let ld_loaded = elf::load(mem, alloc, &mut page_table, &interp_data, INTERPRETER_BASE)?;
        entry = ld_loaded.aux.at_entry;
    }

    let mut task = Task::new(pid, None, page_table);
    install_stdio(&mut task.fds, tty)?;

    let kernel_stack = alloc.alloc_frames(4, 1).ok_or(KernelError::OutOfFrames)?;
    let mut thread =
        default_thread(pid, &mut task.tid_bitmap, kernel_stack).ok_or(KernelError::IdsExhausted)?;

    thread.regs.rip = entry;
    thread.regs.cs = USER_CODE_SELECTOR as u64;
    thread.regs.rflags = 0x202;
    thread.regs.ss = USER_CODE_SELECTOR as u64 - 8;

    let stack_base = task.page_table.mmap_anonymous(THREAD_USER_STACK_SIZE, Protection::READ | Protection::WRITE)?;
    let stack_top = stack_base + THREAD_USER_STACK_SIZE;
    thread.user_stack = stack_top;

    // First-touch every user stack page now rather than lazily: the initial
    // argv/envp write below needs the backing frames mapped immediately.
    let pages = THREAD_USER_STACK_SIZE / crate::memory::layout::PAGE_SIZE;
    for i in 0..pages {
        let page = stack_base + i * crate::memory::layout::PAGE_SIZE;
        task.page_table.handle_page_fault(mem, alloc, page, true)?;
    }

    let root = task.page_table.root;
    thread.regs.rsp = place_arguments(stack_top, args, &loaded.aux, |addr, bytes| {
        if let Some(slot) = crate::memory::paging::lowest_level(mem, root, crate::memory::layout::align_down(addr, crate::memory::layout::PAGE_SIZE)) {
            let page_phys = slot.read(mem).addr();
            let offset = addr - crate::memory::layout::align_down(addr, crate::memory::layout::PAGE_SIZE);
            unsafe {
                core::ptr::copy_nonoverlapping(bytes.as_ptr(), mem.phys_to_ptr(page_phys + offset), bytes.len());
            }
        }
    });

    // Matches `sched_task_exec`'s tail: both the task and its first thread
    // go straight to WAITING, the only state the scheduler's selection
    // considers.
    task.state = TaskState::Waiting;
    let handle = task.add_thread(thread);

    Ok((task, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame_allocator::BumpFrameAllocator;
    use crate::memory::phys::sim::SimMemory;

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

    fn no_interpreter(_path: &str) -> KResult<Vec<u8>> {
        Err(KernelError::NotFound)
    }

    fn trivial_elf() -> alloc::vec::Vec<u8> {
        // Minimal ELF64 header + one PT_LOAD segment containing a single
        // `hlt; jmp` byte, enough to exercise loading without a full
        // userspace toolchain.
        let mut data = alloc::vec![0u8; 0x1000];
        data[0..4].copy_from_slice(&elf::ELF_MAGIC);
        data[4] = elf::ELFCLASS64;
        data[5] = elf::ELFDATA2LSB;
        data[6] = 1;
        data[16..18].copy_from_slice(&2u16.to_ne_bytes()); // ET_EXEC
        data[18..20].copy_from_slice(&0x3eu16.to_ne_bytes()); // EM_X86_64
        data[24..32].copy_from_slice(&0x40_0000u64.to_ne_bytes()); // entry
        data[32..40].copy_from_slice(&64u64.to_ne_bytes()); // phoff
        data[54..56].copy_from_slice(&56u16.to_ne_bytes()); // phentsize
        data[56..58].copy_from_slice(&1u16.to_ne_bytes()); // phnum

        let ph_off = 64usize;
        data[ph_off..ph_off + 4].copy_from_slice(&1u32.to_ne_bytes()); // PT_LOAD
        data[ph_off + 4..ph_off + 8].copy_from_slice(&5u32.to_ne_bytes()); // R+X
        data[ph_off + 8..ph_off + 16].copy_from_slice(&0u64.to_ne_bytes()); // offset
        data[ph_off + 16..ph_off + 24].copy_from_slice(&0x40_0000u64.to_ne_bytes()); // vaddr
        data[ph_off + 32..ph_off + 40].copy_from_slice(&0x1000u64.to_ne_bytes()); // filesz
        data[ph_off + 40..ph_off + 48].copy_from_slice(&0x1000u64.to_ne_bytes()); // memsz
        data
    }

    #[test]
    fn task_exec_builds_runnable_thread() {
        let mem = SimMemory::new(32 * 1024 * 1024);
        let mut alloc = BumpFrameAllocator::new(0x1000, 32 * 1024 * 1024);
        let image = trivial_elf();

        let (task, thread) = task_exec(
            &mem,
            &mut alloc,
            0,
            PagingLevel::Four,
            &image,
            &ExecArguments { argv: &["/bin/init"], envp: &[] },
            || Box::new(NullAsset),
            no_interpreter,
        )
        .unwrap();

        let thread = thread.lock();
        assert_eq!(thread.regs.rip, 0x40_0000);
        assert_eq!(thread.regs.cs as u16, USER_CODE_SELECTOR);
        assert_eq!(thread.regs.rsp % 16, 0);
        assert_eq!(task.pid, 0);
        assert_eq!(task.state, TaskState::Waiting);
        assert_eq!(task.threads.len(), 1);
        assert!(task.fds.get(0).is_some());
        assert!(task.fds.get(1).is_some());
        assert!(task.fds.get(2).is_some());
    }
}

//! A single schedulable thread within a task (spec §3/§4.D).
//!
//! `Registers` and the `thread_exec`/stack-placement logic are grounded on
//! `original_source/kernel/sched/sched.c`'s `sched_thread_exec` and
//! `sched_arg_placement`: the exact System V AMD64 layout a freshly
//! `execve`'d thread's user stack is built with (strings, then envp/argv
//! pointer arrays, then auxv, argc) is reproduced field-for-field. The
//! surrounding `Arc<Mutex<Thread>>` storage idiom matches the teacher's
//! `task/thread.rs`.

use super::ids::IdBitmap;
use crate::process::elf::Aux;
use alloc::vec::Vec;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ThreadState {
    Waiting,
    Running,
    Terminated,
}

/// Snapshot of the registers saved by the interrupt entry stub, restored on
/// the way back out. Field order matches the teacher's `registers.rs`
/// iretq frame (data registers, then the hardware-pushed iretq frame).
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

pub struct Thread {
    pub pid: u64,
    pub tid: usize,
    pub state: ThreadState,
    /// Ticks this thread has sat `Waiting` since last run; reset to 0 when
    /// it's picked. The scheduler's selection policy is "longest wait
    /// wins" (spec §4.D), exactly this counter compared across threads.
    pub idle_count: u64,
    pub regs: Registers,
    pub kernel_stack: u64,
    pub user_stack: u64,
    pub user_fs_base: u64,
    pub user_gs_base: u64,
}

pub fn default_thread(pid: u64, tid_bitmap: &mut IdBitmap, kernel_stack: u64) -> Option<Thread> {
    let tid = tid_bitmap.alloc()?;
    Some(Thread {
        pid,
        tid,
        state: ThreadState::Waiting,
        idle_count: 0,
        regs: Registers::default(),
        kernel_stack,
        user_stack: 0,
        user_fs_base: 0,
        user_gs_base: 0,
    })
}

/// Arguments and environment handed to a freshly loaded program (spec §4.D).
pub struct ExecArguments<'a> {
    pub argv: &'a [&'a str],
    pub envp: &'a [&'a str],
}

/// Build the initial user stack for a new thread: strings at the top,
/// falling down through the pointer arrays, auxv, and argc, exactly the
/// order and alignment `sched_arg_placement` produces.
///
/// `write_u64`/`write_bytes` abstract over the destination address space
/// (a task's own `ProcessMemory` on real hardware, a `SimMemory` arena in
/// tests) so this logic is exercised the same way on both.
pub fn place_arguments(
    stack_top: u64,
    args: &ExecArguments<'_>,
    aux: &Aux,
    mut write_bytes: impl FnMut(u64, &[u8]),
) -> u64 {
    let mut ptr = stack_top;
    let mut env_addrs: Vec<u64> = Vec::with_capacity(args.envp.len());
    let mut argv_addrs: Vec<u64> = Vec::with_capacity(args.argv.len());

    for s in args.envp {
        ptr -= s.len() as u64 + 1;
        write_bytes(ptr, s.as_bytes());
        write_bytes(ptr + s.len() as u64, &[0]);
        env_addrs.push(ptr);
    }
    for s in args.argv {
        ptr -= s.len() as u64 + 1;
        write_bytes(ptr, s.as_bytes());
        write_bytes(ptr + s.len() as u64, &[0]);
        argv_addrs.push(ptr);
    }

    ptr &= !0xf;
    if (args.argv.len() + args.envp.len() + 1) & 1 != 0 {
        ptr -= 8;
    }

    ptr -= 10 * 8;
    let auxv: [u64; 10] = [
        super::super::process::elf::AT_PHNUM,
        aux.at_phnum,
        super::super::process::elf::AT_PHENT,
        aux.at_phent,
        super::super::process::elf::AT_PHDR,
        aux.at_phdr,
        super::super::process::elf::AT_ENTRY,
        aux.at_entry,
        0,
        0,
    ];
    for (i, word) in auxv.iter().enumerate() {
        write_bytes(ptr + (i as u64) * 8, &word.to_ne_bytes());
    }

    ptr -= 8;
    write_bytes(ptr, &0u64.to_ne_bytes());
    ptr -= args.envp.len() as u64 * 8;
    for (i, addr) in env_addrs.iter().enumerate() {
        write_bytes(ptr + (i as u64) * 8, &addr.to_ne_bytes());
    }

    ptr -= 8;
    write_bytes(ptr, &0u64.to_ne_bytes());
    ptr -= args.argv.len() as u64 * 8;
    for (i, addr) in argv_addrs.iter().enumerate() {
        write_bytes(ptr + (i as u64) * 8, &addr.to_ne_bytes());
    }

    ptr -= 8;
    write_bytes(ptr, &(args.argv.len() as u64).to_ne_bytes());

    ptr
}

//! ELF64 loader for userspace programs.
//!
//! Header/program-header layout and the load-segment-then-fix-permissions
//! approach are grounded on the teacher's `elf.rs`. The four auxv entries
//! produced (`AT_PHNUM`, `AT_PHENT`, `AT_PHDR`, `AT_ENTRY`) match
//! `original_source/kernel/sched/sched.c`'s `struct aux` exactly, since
//! that's what `task::thread::place_arguments` consumes.

use crate::error::{KernelError, KResult};
use crate::memory::frame_allocator::FrameAllocator;
use crate::memory::phys::PhysMemory;
use crate::memory::pte::PteFlags;
use crate::memory::{paging, ProcessMemory};
use core::mem;

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const EM_X86_64: u16 = 0x3e;

pub const AT_PHDR: u64 = 3;
pub const AT_PHENT: u64 = 4;
pub const AT_PHNUM: u64 = 5;
pub const AT_ENTRY: u64 = 9;

const PT_LOAD: u32 = 1;
const PT_INTERP: u32 = 3;

const PF_X: u32 = 1;
const PF_W: u32 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Elf64Header {
    magic: [u8; 4],
    class: u8,
    data: u8,
    version: u8,
    osabi: u8,
    abiversion: u8,
    _pad: [u8; 7],
    elf_type: u16,
    machine: u16,
    version2: u32,
    entry: u64,
    phoff: u64,
    shoff: u64,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Elf64ProgramHeader {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

/// The four auxv entries a new thread's stack needs (spec §4.D).
#[derive(Copy, Clone, Debug, Default)]
pub struct Aux {
    pub at_phnum: u64,
    pub at_phent: u64,
    pub at_phdr: u64,
    pub at_entry: u64,
}

pub struct LoadedElf {
    pub aux: Aux,
    /// Path of a PT_INTERP segment, if present (a dynamic linker to load
    /// in its place, per `sched_task_exec`'s `ld_path`).
    pub interpreter: Option<alloc::string::String>,
}

fn header_of(data: &[u8]) -> KResult<Elf64Header> {
    if data.len() < mem::size_of::<Elf64Header>() {
        return Err(KernelError::OpenFailed);
    }
    let header = unsafe { core::ptr::read_unaligned(data.as_ptr() as *const Elf64Header) };
    if header.magic != ELF_MAGIC || header.class != ELFCLASS64 || header.data != ELFDATA2LSB {
        return Err(KernelError::OpenFailed);
    }
    if header.machine != EM_X86_64 || (header.elf_type != ET_EXEC && header.elf_type != ET_DYN) {
        return Err(KernelError::OpenFailed);
    }
    Ok(header)
}

/// Load `data` into `pm` at `base`, mapping every `PT_LOAD` segment,
/// copying file bytes in and zeroing the BSS tail, then tightening
/// permissions to match the segment's flags. Returns the auxv values the
/// new thread's stack needs.
pub fn load(
    mem_access: &dyn PhysMemory,
    alloc: &mut dyn FrameAllocator,
    pm: &mut ProcessMemory,
    data: &[u8],
    base: u64,
) -> KResult<LoadedElf> {
    let header = header_of(data)?;

    let ph_offset = header.phoff as usize;
    let ph_size = header.phentsize as usize;
    let ph_count = header.phnum as usize;

    let mut interpreter = None;

    for i in 0..ph_count {
        let start = ph_offset + i * ph_size;
        if start + mem::size_of::<Elf64ProgramHeader>() > data.len() {
            return Err(KernelError::OpenFailed);
        }
        let ph = unsafe { core::ptr::read_unaligned(data[start..].as_ptr() as *const Elf64ProgramHeader) };

        match ph.p_type {
            PT_LOAD => load_segment(mem_access, alloc, pm, data, &ph, base)?,
            PT_INTERP => {
                let off = ph.p_offset as usize;
                let len = ph.p_filesz as usize;
                if off + len > data.len() {
                    return Err(KernelError::OpenFailed);
                }
                let bytes = &data[off..off + len.saturating_sub(1)]; // drop trailing NUL
                interpreter = core::str::from_utf8(bytes).ok().map(alloc::string::ToString::to_string);
            }
            _ => {}
        }
    }

    let phdr_vaddr = base + header.phoff;

    Ok(LoadedElf {
        aux: Aux {
            at_phnum: header.phnum as u64,
            at_phent: header.phentsize as u64,
            at_phdr: phdr_vaddr,
            at_entry: base + header.entry,
        },
        interpreter,
    })
}

fn load_segment(
    mem_access: &dyn PhysMemory,
    alloc: &mut dyn FrameAllocator,
    pm: &mut ProcessMemory,
    data: &[u8],
    ph: &Elf64ProgramHeader,
    base: u64,
) -> KResult<()> {
    let vaddr = base + ph.p_vaddr;
    let file_start = ph.p_offset as usize;
    let file_size = ph.p_filesz as usize;
    let mem_size = ph.p_memsz as usize;

    if file_start + file_size > data.len() {
        return Err(KernelError::OpenFailed);
    }

    let page_size = crate::memory::layout::PAGE_SIZE;
    let start_page = crate::memory::layout::align_down(vaddr, page_size);
    let end_page = crate::memory::layout::align_up(vaddr + mem_size as u64, page_size);

    let mut flags = PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER;
    if ph.p_flags & PF_X == 0 {
        flags |= PteFlags::NO_EXECUTE;
    }

    let mut va = start_page;
    while va < end_page {
        let frame = alloc.alloc_frames(1, 1).ok_or(KernelError::OutOfFrames)?;
        unsafe { mem_access.zero_frame(frame) };
        paging::map_page(mem_access, alloc, pm.root, va, frame, flags)?;

        // Copy whichever slice of the file lands on this page. A page may
        // be entirely BSS (no file bytes), entirely file data, or the file
        // tail followed by BSS padding within the same page.
        let page_file_off = va.saturating_sub(vaddr);
        let copy_end = core::cmp::min(page_file_off + page_size, file_size as u64);
        if page_file_off < file_size as u64 && copy_end > page_file_off {
            let copy_size = (copy_end - page_file_off) as usize;
            let page_off = vaddr.saturating_sub(va);
            unsafe {
                let dst = mem_access.phys_to_ptr(phys_of(mem_access, pm, va)? + page_off);
                let src = data[file_start + page_file_off as usize..].as_ptr();
                core::ptr::copy_nonoverlapping(src, dst, copy_size);
            }
        }

        va += page_size;
    }

    if ph.p_flags & PF_W == 0 {
        let mut fix = start_page;
        let readonly = flags & !PteFlags::WRITABLE;
        while fix < end_page {
            if let Some(slot) = paging::lowest_level(mem_access, pm.root, fix) {
                let pte = slot.read(mem_access);
                slot.write(mem_access, crate::memory::pte::Pte::new(pte.addr(), readonly));
            }
            fix += page_size;
        }
    }

    Ok(())
}

fn phys_of(mem_access: &dyn PhysMemory, pm: &ProcessMemory, vaddr: u64) -> KResult<u64> {
    let page = crate::memory::layout::align_down(vaddr, crate::memory::layout::PAGE_SIZE);
    let offset = vaddr - page;
    let slot = paging::lowest_level(mem_access, pm.root, page).ok_or(KernelError::MissingRecord)?;
    Ok(slot.read(mem_access).addr() + offset)
}

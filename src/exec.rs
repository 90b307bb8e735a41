//! ELF program loading for `exec`: replaces the calling process's address
//! space with a fresh one built from an on-disk ELF binary, then sets up
//! its initial stack with `argv`.

use alloc::string::String;
use core::cmp::min;
use core::fmt::Display;

use crate::error::KernelError;
use crate::fs::{Inode, InodeType, Path};
use crate::log;
use crate::param::{MAXARG, USERSTACK};
use crate::proc::current_proc;
use crate::riscv::{PGSIZE, PTE_W, PTE_X, pg_round_up};
use crate::vm::{PA, Uvm, VA};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    Alloc,
    Elf,
    Header,
    Read,
    Memory,
}

impl Display for ExecError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ExecError::Alloc => write!(f, "allocation error"),
            ExecError::Elf => write!(f, "invalid elf file"),
            ExecError::Header => write!(f, "invalid program header"),
            ExecError::Read => write!(f, "read error"),
            ExecError::Memory => write!(f, "memory error"),
        }
    }
}

impl From<KernelError> for ExecError {
    fn from(_: KernelError) -> Self {
        ExecError::Memory
    }
}

const ELF_MAGIC: u32 = 0x464C457F; // "\x7FELF" in little endian

#[repr(C)]
#[derive(Debug)]
struct ElfHeader {
    magic: u32,
    elf: [u8; 12],
    r#type: u16,
    machine: u16,
    version: u32,
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

impl ElfHeader {
    const SIZE: usize = size_of::<Self>();

    fn from_bytes(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= Self::SIZE);
        unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Self) }
    }
}

#[repr(C)]
#[derive(Debug)]
struct ProgramHeader {
    r#type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

impl ProgramHeader {
    const SIZE: usize = size_of::<Self>();
    const ELF_PROG_LOAD: u32 = 1;

    fn from_bytes(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= Self::SIZE);
        unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Self) }
    }

    fn get_perms(&self) -> usize {
        let mut perm = 0;
        if self.flags & 0x1 != 0 {
            perm = PTE_X;
        }
        if self.flags & 0x2 != 0 {
            perm |= PTE_W;
        }
        perm
    }
}

/// Reads a program segment from `inode` at file `offset` for `filesz` bytes
/// into the already-allocated user pages at `va`, one page at a time.
fn load_segment(
    pagetable: &mut Uvm,
    inode: &Inode,
    inner: &mut crate::sleeplock::SleepLockGuard<'_, crate::fs::InodeInner>,
    va: VA,
    offset: u32,
    filesz: usize,
) -> Result<(), ExecError> {
    let mut i = 0;
    while i < filesz {
        let n = min(filesz - i, PGSIZE);
        let mut buf = [0u8; PGSIZE];

        let read = inode
            .read(inner, offset + i as u32, &mut buf[..n])
            .map_err(|_| ExecError::Read)?;
        if read as usize != n {
            return Err(ExecError::Read);
        }

        pagetable
            .copy_out(va + i, &buf[..n])
            .map_err(|_| ExecError::Memory)?;

        i += n;
    }
    Ok(())
}

/// `exec(path, argv)`: loads the ELF binary at `path` into a fresh address
/// space for the calling process, replacing its current image in place.
/// Returns `argc`, which lands in `a0` as the return value of the `exec`
/// syscall itself.
pub fn exec(path: &str, argv: &[String]) -> Result<usize, ExecError> {
    let proc = current_proc();
    let mut size = 0;

    log::begin_op();

    let inode = match Path::new(path).resolve() {
        Ok(inode) => inode,
        Err(_) => {
            log::end_op();
            return Err(ExecError::Read);
        }
    };

    let mut inner = inode.lock();

    if inner.r#type != InodeType::File {
        inode.unlock_put(inner);
        log::end_op();
        return Err(ExecError::Elf);
    }

    let mut elf_buf = [0u8; ElfHeader::SIZE];
    match inode.read(&mut inner, 0, &mut elf_buf) {
        Ok(read) if read as usize == elf_buf.len() => {}
        _ => {
            inode.unlock_put(inner);
            log::end_op();
            return Err(ExecError::Read);
        }
    }

    let elf = ElfHeader::from_bytes(&elf_buf);

    if elf.magic != ELF_MAGIC {
        inode.unlock_put(inner);
        log::end_op();
        return Err(ExecError::Elf);
    }

    let trapframe_pa = PA(
        proc.data().trapframe.as_ref().expect("exec: no trapframe") as *const _ as usize,
    );
    let mut pagetable = match proc.create_pagetable(trapframe_pa) {
        Ok(pt) => pt,
        Err(_) => {
            inode.unlock_put(inner);
            log::end_op();
            return Err(ExecError::Alloc);
        }
    };

    let mut ph_buf = [0u8; ProgramHeader::SIZE];
    let mut offset = elf.phoff;

    for _ in 0..elf.phnum {
        match inode.read(&mut inner, offset as u32, &mut ph_buf) {
            Ok(read) if read as usize == ph_buf.len() => {}
            _ => {
                pagetable.proc_free(size);
                inode.unlock_put(inner);
                log::end_op();
                return Err(ExecError::Memory);
            }
        }

        let ph = ProgramHeader::from_bytes(&ph_buf);
        offset += ProgramHeader::SIZE as u64;

        if ph.r#type != ProgramHeader::ELF_PROG_LOAD {
            continue;
        }

        if ph.memsz < ph.filesz
            || ph.vaddr.checked_add(ph.memsz).is_none()
            || !ph.vaddr.is_multiple_of(PGSIZE as u64)
        {
            pagetable.proc_free(size);
            inode.unlock_put(inner);
            log::end_op();
            return Err(ExecError::Header);
        }

        size = match pagetable.alloc(size, (ph.vaddr + ph.memsz) as usize, ph.get_perms()) {
            Ok(new_size) => new_size,
            Err(_) => {
                pagetable.proc_free(size);
                inode.unlock_put(inner);
                log::end_op();
                return Err(ExecError::Alloc);
            }
        };

        if let Err(e) = load_segment(
            &mut pagetable,
            &inode,
            &mut inner,
            VA::from(ph.vaddr as usize),
            ph.offset as u32,
            ph.filesz as usize,
        ) {
            pagetable.proc_free(size);
            inode.unlock_put(inner);
            log::end_op();
            return Err(e);
        }
    }

    inode.unlock_put(inner);
    log::end_op();

    let old_size = proc.data().size;

    size = pg_round_up(size);
    size = match pagetable.alloc(size, size + (USERSTACK + 1) * PGSIZE, PTE_W) {
        Ok(new_size) => new_size,
        Err(_) => {
            pagetable.proc_free(size);
            return Err(ExecError::Alloc);
        }
    };

    if pagetable
        .clear_user(VA::from(size - (USERSTACK + 1) * PGSIZE))
        .is_err()
    {
        pagetable.proc_free(size);
        return Err(ExecError::Memory);
    }

    let mut sp = size;
    let stackbase = sp - USERSTACK * PGSIZE;

    let mut ustack = [0u64; MAXARG];
    let mut argc = 0;

    for arg in argv.iter() {
        if argc >= MAXARG {
            pagetable.proc_free(size);
            return Err(ExecError::Memory);
        }

        sp -= arg.len() + 1;
        sp -= sp % 16;

        if sp < stackbase {
            pagetable.proc_free(size);
            return Err(ExecError::Memory);
        }

        if pagetable.copy_out(VA::from(sp), arg.as_bytes()).is_err()
            || pagetable.copy_out(VA::from(sp + arg.len()), &[0u8]).is_err()
        {
            pagetable.proc_free(size);
            return Err(ExecError::Memory);
        }

        ustack[argc] = sp as u64;
        argc += 1;
    }
    ustack[argc] = 0;

    sp -= (argc + 1) * size_of::<u64>();
    sp -= sp % 16;

    let ustack_ptr = unsafe {
        core::slice::from_raw_parts(ustack.as_ptr() as *const u8, (argc + 1) * size_of::<u64>())
    };

    if sp < stackbase || pagetable.copy_out(VA::from(sp), ustack_ptr).is_err() {
        pagetable.proc_free(size);
        return Err(ExecError::Memory);
    }

    let data = unsafe { proc.data_mut() };

    data.name.clear();
    data.name
        .push_str(path.rsplit_once('/').map_or(path, |(_, name)| name));

    let old_pagetable = data.pagetable.replace(pagetable).unwrap();
    data.size = size;

    let trapframe = data.trapframe.as_mut().unwrap();
    trapframe.a1 = sp;
    trapframe.epc = elf.entry as usize;
    trapframe.sp = sp;

    old_pagetable.proc_free(old_size);

    Ok(argc)
}

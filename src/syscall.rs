use alloc::string::String;
use alloc::vec::Vec;

use crate::println;
use crate::proc::{Proc, TrapFrame, current_proc};
use crate::sysfile::*;
use crate::sysproc::*;
use crate::vm::VA;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    Unknown(usize),
    ForkError,
    WaitError,
    SbrkError,
    SleepError,
    Fetch,
    Read,
    Write,
    Stat,
    Link,
    Unlink,
    Mkdir,
    Mknod,
    Open,
    Chdir,
    Container,
    BadAddress,
}

/// Wrapper for extracting typed syscall arguments from a trapframe.
pub struct SyscallArgs<'a> {
    trapframe: &'a TrapFrame,
    proc: &'static Proc,
}

impl<'a> SyscallArgs<'a> {
    fn new(trapframe: &'a TrapFrame, proc: &'static Proc) -> Self {
        Self { trapframe, proc }
    }

    pub fn proc(&self) -> &'static Proc {
        self.proc
    }

    /// Returns the argument at the given index as a usize.
    pub fn get_raw(&self, index: usize) -> usize {
        match index {
            0 => self.trapframe.a0,
            1 => self.trapframe.a1,
            2 => self.trapframe.a2,
            3 => self.trapframe.a3,
            4 => self.trapframe.a4,
            5 => self.trapframe.a5,
            _ => panic!("invalid syscall argument index {}", index),
        }
    }

    /// Returns the argument at the given index as an isize.
    pub fn get_int(&self, index: usize) -> isize {
        self.get_raw(index) as isize
    }

    /// Returns the argument at the given index as a virtual address.
    ///
    /// Does not check for legality, since `copyin`/`copyout` will do that.
    pub fn get_addr(&self, index: usize) -> VA {
        VA::from(self.get_raw(index))
    }

    /// Fetches a null-terminated string of at most `max` bytes from user space.
    pub fn fetch_string(&self, addr: VA, max: usize) -> Result<String, SyscallError> {
        let mut buf = alloc::vec![0u8; max];
        crate::proc::copy_in_user(&mut buf, addr).map_err(|_| SyscallError::BadAddress)?;

        let len = buf
            .iter()
            .position(|&b| b == 0)
            .ok_or(SyscallError::BadAddress)?;
        String::from_utf8(buf[..len].to_vec()).map_err(|_| SyscallError::BadAddress)
    }

    /// Fetches `len` raw bytes from user space.
    pub fn get_bytes(&self, addr: VA, len: usize) -> Result<Vec<u8>, SyscallError> {
        let mut buf = alloc::vec![0u8; len];
        crate::proc::copy_in_user(&mut buf, addr).map_err(|_| SyscallError::BadAddress)?;
        Ok(buf)
    }

    /// Resolves the open file and its fd for argument `index`.
    pub fn get_file(&self, index: usize) -> Result<(usize, crate::file::File), SyscallError> {
        let fd = self.get_raw(index);
        let data = self.proc.data();
        data.open_files
            .get(fd)
            .and_then(|f| f.clone())
            .map(|f| (fd, f))
            .ok_or(SyscallError::Fetch)
    }
}

/// System call numbers.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Fork = 1,
    Exit = 2,
    Wait = 3,
    Pipe = 4,
    Read = 5,
    Kill = 6,
    Exec = 7,
    Fstat = 8,
    Chdir = 9,
    Dup = 10,
    Getpid = 11,
    Sbrk = 12,
    Sleep = 13,
    Uptime = 14,
    Open = 15,
    Write = 16,
    Mknod = 17,
    Unlink = 18,
    Link = 19,
    Mkdir = 20,
    Close = 21,

    /// Container Control API, see `cont.rs`.
    Ccreate = 22,
    Cstart = 23,
    Cpause = 24,
    Cresume = 25,
    Cstop = 26,
    Cfork = 27,
    Cgetrootdir = 28,
    Getcontrootdir = 29,
    Cps = 30,
}

impl TryFrom<usize> for Syscall {
    type Error = SyscallError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Syscall::Fork),
            2 => Ok(Syscall::Exit),
            3 => Ok(Syscall::Wait),
            4 => Ok(Syscall::Pipe),
            5 => Ok(Syscall::Read),
            6 => Ok(Syscall::Kill),
            7 => Ok(Syscall::Exec),
            8 => Ok(Syscall::Fstat),
            9 => Ok(Syscall::Chdir),
            10 => Ok(Syscall::Dup),
            11 => Ok(Syscall::Getpid),
            12 => Ok(Syscall::Sbrk),
            13 => Ok(Syscall::Sleep),
            14 => Ok(Syscall::Uptime),
            15 => Ok(Syscall::Open),
            16 => Ok(Syscall::Write),
            17 => Ok(Syscall::Mknod),
            18 => Ok(Syscall::Unlink),
            19 => Ok(Syscall::Link),
            20 => Ok(Syscall::Mkdir),
            21 => Ok(Syscall::Close),
            22 => Ok(Syscall::Ccreate),
            23 => Ok(Syscall::Cstart),
            24 => Ok(Syscall::Cpause),
            25 => Ok(Syscall::Cresume),
            26 => Ok(Syscall::Cstop),
            27 => Ok(Syscall::Cfork),
            28 => Ok(Syscall::Cgetrootdir),
            29 => Ok(Syscall::Getcontrootdir),
            30 => Ok(Syscall::Cps),
            _ => Err(SyscallError::Unknown(value)),
        }
    }
}

/// Handle a system call.
///
/// # Safety
/// Called from `usertrap` in `trap.rs`.
pub unsafe fn syscall(trapframe: &mut TrapFrame) {
    let proc = current_proc();
    let args = SyscallArgs::new(trapframe, proc);

    let result = match Syscall::try_from(trapframe.a7) {
        Ok(syscall) => match syscall {
            Syscall::Fork => sys_fork(&args),
            Syscall::Exit => sys_exit(&args),
            Syscall::Wait => sys_wait(&args),
            Syscall::Pipe => sys_pipe(&args),
            Syscall::Read => sys_read(&args),
            Syscall::Kill => sys_kill(&args),
            Syscall::Exec => sys_exec(&args),
            Syscall::Fstat => sys_fstat(&args),
            Syscall::Chdir => sys_chdir(&args),
            Syscall::Dup => sys_dup(&args),
            Syscall::Getpid => sys_getpid(&args),
            Syscall::Sbrk => sys_sbrk(&args),
            Syscall::Sleep => sys_sleep(&args),
            Syscall::Uptime => sys_uptime(&args),
            Syscall::Open => sys_open(&args),
            Syscall::Write => sys_write(&args),
            Syscall::Mknod => sys_mknod(&args),
            Syscall::Unlink => sys_unlink(&args),
            Syscall::Link => sys_link(&args),
            Syscall::Mkdir => sys_mkdir(&args),
            Syscall::Close => sys_close(&args),
            Syscall::Ccreate => sys_ccreate(&args),
            Syscall::Cstart => sys_cstart(&args),
            Syscall::Cpause => sys_cpause(&args),
            Syscall::Cresume => sys_cresume(&args),
            Syscall::Cstop => sys_cstop(&args),
            Syscall::Cfork => sys_cfork(&args),
            Syscall::Cgetrootdir => sys_cgetrootdir(&args),
            Syscall::Getcontrootdir => sys_getcontrootdir(&args),
            Syscall::Cps => sys_cps(&args),
        },
        Err(e) => {
            println!(
                "{} {}: unknown syscall {}",
                *proc.inner.lock().pid,
                proc.data().name,
                trapframe.a7
            );
            Err(e)
        }
    };

    trapframe.a0 = result.unwrap_or(usize::MAX);
}

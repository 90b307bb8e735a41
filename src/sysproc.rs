use alloc::string::String;

use crate::cont::CONTAINER_TABLE;
use crate::error::KernelError;
use crate::param::{CONTNAMESZ, MAXPATH, ROOTPATHSZ};
use crate::proc::{self, Channel, Pid};
use crate::syscall::{SyscallArgs, SyscallError};
use crate::trap::TICKS;
use crate::vm::VA;

impl From<KernelError> for SyscallError {
    fn from(_: KernelError) -> Self {
        SyscallError::Container
    }
}

pub fn sys_exit(args: &SyscallArgs) -> ! {
    let n = args.get_int(0);
    proc::exit(n);
}

pub fn sys_getpid(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let pid = args.proc().inner.lock().pid;
    Ok(*pid)
}

pub fn sys_fork(_args: &SyscallArgs) -> Result<usize, SyscallError> {
    match proc::fork() {
        Ok(pid) => Ok(*pid),
        Err(_) => Err(SyscallError::ForkError),
    }
}

pub fn sys_wait(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let addr = args.get_addr(0);
    let (pid, xstate) = proc::wait().map_err(|_| SyscallError::WaitError)?;
    if addr.0 != 0 {
        proc::copy_out_user(&xstate.to_le_bytes(), addr).map_err(|_| SyscallError::WaitError)?;
    }
    Ok(*pid)
}

pub fn sys_sbrk(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let size = args.get_int(0);
    let addr = args.proc().data().size;
    match proc::grow(size) {
        Ok(_) => Ok(addr),
        Err(_) => Err(SyscallError::SbrkError),
    }
}

pub fn sys_sleep(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let duration = args.get_int(0).max(0) as usize;
    let mut ticks = TICKS.lock();
    let ticks0 = *ticks;
    while *ticks - ticks0 < duration {
        if args.proc().is_killed() {
            return Err(SyscallError::SleepError);
        }
        ticks = proc::sleep(Channel::Ticks, ticks);
    }
    Ok(0)
}

pub fn sys_kill(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let pid = args.get_int(0).max(0) as usize;
    match proc::kill(Pid::from_raw(pid)) {
        Ok(_) => Ok(0),
        Err(_) => Err(SyscallError::Container),
    }
}

pub fn sys_uptime(_args: &SyscallArgs) -> Result<usize, SyscallError> {
    Ok(*TICKS.lock())
}

pub fn sys_ccreate(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let path = args.fetch_string(args.get_addr(0), ROOTPATHSZ)?;
    let cid = CONTAINER_TABLE.create(&path)?;
    Ok(cid)
}

pub fn sys_cstart(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let name = args.fetch_string(args.get_addr(0), CONTNAMESZ)?;
    let cid = CONTAINER_TABLE.start(&name)?;
    Ok(cid)
}

pub fn sys_cpause(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let name = args.fetch_string(args.get_addr(0), CONTNAMESZ)?;
    CONTAINER_TABLE.pause(&name)?;
    Ok(0)
}

pub fn sys_cresume(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let name = args.fetch_string(args.get_addr(0), CONTNAMESZ)?;
    CONTAINER_TABLE.resume(&name)?;
    Ok(0)
}

pub fn sys_cstop(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let name = args.fetch_string(args.get_addr(0), CONTNAMESZ)?;
    CONTAINER_TABLE.stop(&name)?;
    Ok(0)
}

pub fn sys_cfork(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let cid = args.get_int(0).max(0) as usize;
    let pid = CONTAINER_TABLE.cfork(cid)?;
    Ok(*pid)
}

fn copy_rootpath(name: &str, buf: VA) -> Result<usize, SyscallError> {
    if name.len() >= MAXPATH {
        return Err(SyscallError::BadAddress);
    }
    let mut bytes = alloc::vec::Vec::with_capacity(name.len() + 1);
    bytes.extend_from_slice(name.as_bytes());
    bytes.push(0);
    proc::copy_out_user(&bytes, buf).map_err(|_| SyscallError::Write)?;
    Ok(0)
}

pub fn sys_cgetrootdir(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let buf = args.get_addr(0);
    let path = CONTAINER_TABLE.current_rootpath();
    copy_rootpath(&path, buf)
}

pub fn sys_getcontrootdir(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let name = args.fetch_string(args.get_addr(0), CONTNAMESZ)?;
    let buf = args.get_addr(1);
    let path = CONTAINER_TABLE.rootpath_of(&name)?;
    copy_rootpath(&path, buf)
}

pub fn sys_cps(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let buf = args.get_addr(0);
    let max = args.get_int(1).max(0) as usize;

    let mut out = String::new();
    for (cid, name, state) in CONTAINER_TABLE.snapshot() {
        out.push_str(&alloc::format!("{cid}\t{name}\t{state:?}\n"));
    }

    let bytes = out.as_bytes();
    let n = bytes.len().min(max);
    proc::copy_out_user(&bytes[..n], buf).map_err(|_| SyscallError::Write)?;
    Ok(n)
}

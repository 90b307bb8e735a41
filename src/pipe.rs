//! Anonymous pipes: a fixed-size ring buffer shared between a read end and a
//! write end, each wrapped in a [`crate::file::File`]. Reader and writer block
//! on separate channels and wake each other as data moves; either end closing
//! is visible to the other through `readopen`/`writeopen`.

use alloc::boxed::Box;
use core::slice;

use crate::error::KernelError;
use crate::file::{FILE_TABLE, File, FileType};
use crate::param::PIPESIZE;
use crate::proc::{self, Channel};
use crate::spinlock::SpinLock;
use crate::syscall::SyscallError;
use crate::vm::VA;

pub struct Pipe {
    lock: SpinLock<PipeInner>,
}

struct PipeInner {
    data: [u8; PIPESIZE],
    /// Number of bytes read so far, mod `PIPESIZE`.
    nread: usize,
    /// Number of bytes written so far, mod `PIPESIZE`.
    nwrite: usize,
    readopen: bool,
    writeopen: bool,
}

impl Pipe {
    fn alloc_box() -> Box<Pipe> {
        Box::new(Pipe {
            lock: SpinLock::new(
                PipeInner {
                    data: [0; PIPESIZE],
                    nread: 0,
                    nwrite: 0,
                    readopen: true,
                    writeopen: true,
                },
                "pipe",
            ),
        })
    }

    /// `pipe()`: allocates the pipe buffer and two file descriptors backed by
    /// it. On error, nothing is left allocated.
    pub fn create() -> Result<(File, File), SyscallError> {
        let pipe = Box::into_raw(Self::alloc_box());

        let result = (|| -> Result<(File, File), KernelError> {
            let read_file = File::alloc()?;
            let write_file = File::alloc().inspect_err(|_| {
                let mut f = read_file.clone();
                f.close();
            })?;

            {
                let mut inner = FILE_TABLE.inner[read_file.id].lock();
                inner.readable = true;
                inner.writeable = false;
                inner.r#type = FileType::Pipe { pipe };
            }
            {
                let mut inner = FILE_TABLE.inner[write_file.id].lock();
                inner.readable = false;
                inner.writeable = true;
                inner.r#type = FileType::Pipe { pipe };
            }

            Ok((read_file, write_file))
        })();

        result.map_err(|_| {
            let _ = unsafe { Box::from_raw(pipe) };
            SyscallError::Open
        })
    }

    /// Called when the last reference to either end closes. Drops the pipe's
    /// backing allocation once both ends are closed.
    pub fn close(pipe: *mut Pipe, writer_side: bool) {
        let done = {
            let this = unsafe { &*pipe };
            let mut inner = this.lock.lock();
            if writer_side {
                inner.writeopen = false;
                proc::wakeup(Channel::PipeRead(pipe as usize));
            } else {
                inner.readopen = false;
                proc::wakeup(Channel::PipeWrite(pipe as usize));
            }
            !inner.readopen && !inner.writeopen
        };

        if done {
            let _ = unsafe { Box::from_raw(pipe) };
        }
    }

    pub fn write(pipe: *mut Pipe, addr: VA, n: usize) -> Result<usize, SyscallError> {
        let this = unsafe { &*pipe };
        let src = unsafe { slice::from_raw_parts(addr.as_usize() as *const u8, n) };

        let mut inner = this.lock.lock();
        let mut written = 0;

        while written < n {
            if !inner.readopen || proc::current_proc().is_killed() {
                return Err(SyscallError::Write);
            }

            if inner.nwrite == inner.nread + PIPESIZE {
                proc::wakeup(Channel::PipeRead(pipe as usize));
                inner = proc::sleep(Channel::PipeWrite(pipe as usize), inner);
                continue;
            }

            let slot = inner.nwrite % PIPESIZE;
            inner.data[slot] = src[written];
            inner.nwrite += 1;
            written += 1;
        }

        proc::wakeup(Channel::PipeRead(pipe as usize));
        Ok(written)
    }

    pub fn read(pipe: *mut Pipe, addr: VA, n: usize) -> Result<usize, SyscallError> {
        let this = unsafe { &*pipe };
        let mut inner = this.lock.lock();

        while inner.nread == inner.nwrite && inner.writeopen {
            if proc::current_proc().is_killed() {
                return Err(SyscallError::Read);
            }
            inner = proc::sleep(Channel::PipeRead(pipe as usize), inner);
        }

        let mut read = 0;
        while read < n && inner.nread < inner.nwrite {
            let slot = inner.nread % PIPESIZE;
            let byte = inner.data[slot];
            inner.nread += 1;

            let dst = unsafe { &mut *((addr.as_usize() + read) as *mut u8) };
            *dst = byte;
            read += 1;
        }

        proc::wakeup(Channel::PipeWrite(pipe as usize));
        Ok(read)
    }
}

unsafe impl Send for Pipe {}
unsafe impl Sync for Pipe {}

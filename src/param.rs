/// maximum number of CPUs
pub const NCPU: usize = 8;
/// maximum number of containers
pub const NCONT: usize = 16;
/// maximum number of processes per container
pub const NPROC: usize = 64;
/// maximum number of open files per process
pub const NOFILE: usize = 16;
/// size of the global open file table
pub const NFILE: usize = 100;
/// size of the inode cache
pub const NINODE: usize = 50;
/// maximum number of simultaneously-mounted devices
pub const NDEV: usize = 10;
/// device number of the file system root disk
pub const ROOTDEV: u32 = 1;
/// max exec arguments
pub const MAXARG: usize = 32;
/// max # of blocks any FS op writes
pub const MAXOPBLOCKS: usize = 10;
/// max data blocks in on-disk log
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;
/// size of disk block cache
pub const NBUF: usize = MAXOPBLOCKS * 3;
/// size of file system in blocks
pub const FSSIZE: usize = 2000;
/// maximum file path length, including the root container's own prefix
pub const MAXPATH: usize = 128;

/// maximum length of a container name, not including the terminating null byte
pub const CONTNAMESZ: usize = 15;
/// maximum length of a container's rootpath, not including the terminating null byte
pub const ROOTPATHSZ: usize = 200;

/// pages per kernel stack; stacks are heap-allocated per process rather than
/// mapped at a fixed boot-time region (see `vm::Kvm::make`)
pub const NKSTACK_PAGES: usize = 1;

/// size in bytes of a pipe's ring buffer
pub const PIPESIZE: usize = 512;
/// pages of user stack per process (plus one more, below it, as a guard page)
pub const USERSTACK: usize = 1;

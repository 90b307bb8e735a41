//! Process control blocks, the per-CPU scheduler, and the fork/exit/wait/sleep/wakeup
//! primitives. Process slots live inside [`crate::cont::Container`]; this module only
//! knows slots by `(cidx, pidx)` plus the stable [`Pid`] each slot is assigned on
//! allocation.

use alloc::boxed::Box;
use alloc::string::String;
use core::cell::UnsafeCell;
use core::mem::{MaybeUninit, transmute};
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, info, warn};

use crate::cont::{CONTAINER_TABLE, Container, ContainerState};
use crate::error::KernelError;
use crate::file::File;
use crate::fs::Inode;
use crate::log;
use crate::param::{NCONT, NCPU, NKSTACK_PAGES, NOFILE, NPROC};
use crate::riscv::interrupts;
use crate::riscv::registers::{satp, tp, vma};
use crate::riscv::{PGSIZE, PTE_R, PTE_W, PTE_X};
use crate::spinlock::{SpinLock, SpinLockGuard};
use crate::swtch::swtch;
use crate::trampoline::trampoline;
use crate::vm::{PA, Uvm, VA};

pub static CPUS: Cpus = Cpus::new();

pub struct Cpus([UnsafeCell<Cpu>; NCPU]);
unsafe impl Sync for Cpus {}

pub struct Cpu {
    pub proc: Option<&'static Proc>,
    pub context: Context,
    num_off: isize,
    interrupt_enabled: bool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            proc: None,
            context: Context::new(),
            num_off: 0,
            interrupt_enabled: false,
        }
    }

    fn push_off(&mut self, old_state: bool) -> InterruptLock {
        if self.num_off == 0 {
            self.interrupt_enabled = old_state;
        }
        self.num_off += 1;
        InterruptLock {}
    }

    fn pop_off(&mut self) {
        assert!(!interrupts::get(), "cpu unlock - interruptible");
        assert!(self.num_off >= 1, "cpu unlock");

        self.num_off -= 1;
        if self.num_off == 0 && self.interrupt_enabled {
            interrupts::enable();
        }
    }
}

impl Cpus {
    const fn new() -> Self {
        let mut array: [MaybeUninit<UnsafeCell<Cpu>>; NCPU] =
            unsafe { MaybeUninit::uninit().assume_init() };
        let mut i = 0;
        while i < NCPU {
            array[i] = MaybeUninit::new(UnsafeCell::new(Cpu::new()));
            i += 1;
        }
        Self(unsafe { transmute(array) })
    }
}

/// Returns the hart id of this CPU.
///
/// # Safety
/// Must be called with interrupts disabled, to prevent a race with the process
/// being moved to a different CPU.
#[inline]
pub unsafe fn current_id() -> usize {
    unsafe { tp::read() }
}

/// Returns a mutable pointer to this CPU's [`Cpu`] struct.
///
/// # Safety
/// Must be called with interrupts disabled.
pub unsafe fn current_cpu() -> *mut Cpu {
    assert!(!interrupts::get(), "current_cpu: interrupts enabled");
    let id = unsafe { current_id() };
    CPUS.0[id].get()
}

/// Disables interrupts for the duration of the returned guard's lifetime, nesting safely.
pub fn lock_current_cpu() -> InterruptLock {
    let old_state = interrupts::get();
    interrupts::disable();

    unsafe { (*current_cpu()).push_off(old_state) }
}

pub struct InterruptLock {}

impl Drop for InterruptLock {
    fn drop(&mut self) {
        unsafe { (*current_cpu()).pop_off() }
    }
}

/// The process currently running on this CPU, if any.
pub fn current_proc_opt() -> Option<&'static Proc> {
    let _lock = lock_current_cpu();
    unsafe { (*current_cpu()).proc }
}

/// The process currently running on this CPU.
///
/// # Panics
/// If called other than from a context with a current process (a syscall or user trap).
pub fn current_proc() -> &'static Proc {
    current_proc_opt().expect("current_proc: no process on this cpu")
}

/// Saved registers for kernel context switches.
#[repr(C)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,
    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

// Per-process data for the trap handling code in trampoline.rs. Sits in a page by
// itself just under the trampoline page in the user page table; not mapped in the
// kernel page table. uservec saves user registers here, then loads kernel_sp,
// kernel_hartid, kernel_satp and jumps to kernel_trap.
#[repr(C, align(4096))]
#[derive(Clone, Copy)]
pub struct TrapFrame {
    /*   0 */ pub kernel_satp: usize,
    /*   8 */ pub kernel_sp: usize,
    /*  16 */ pub kernel_trap: usize,
    /*  24 */ pub epc: usize,
    /*  32 */ pub kernel_hartid: usize,
    /*  40 */ pub ra: usize,
    /*  48 */ pub sp: usize,
    /*  56 */ pub gp: usize,
    /*  64 */ pub tp: usize,
    /*  72 */ pub t0: usize,
    /*  80 */ pub t1: usize,
    /*  88 */ pub t2: usize,
    /*  96 */ pub s0: usize,
    /* 104 */ pub s1: usize,
    /* 112 */ pub a0: usize,
    /* 120 */ pub a1: usize,
    /* 128 */ pub a2: usize,
    /* 136 */ pub a3: usize,
    /* 144 */ pub a4: usize,
    /* 152 */ pub a5: usize,
    /* 160 */ pub a6: usize,
    /* 168 */ pub a7: usize,
    /* 176 */ pub s2: usize,
    /* 184 */ pub s3: usize,
    /* 192 */ pub s4: usize,
    /* 200 */ pub s5: usize,
    /* 208 */ pub s6: usize,
    /* 216 */ pub s7: usize,
    /* 224 */ pub s8: usize,
    /* 232 */ pub s9: usize,
    /* 240 */ pub s10: usize,
    /* 248 */ pub s11: usize,
    /* 256 */ pub t3: usize,
    /* 264 */ pub t4: usize,
    /* 272 */ pub t5: usize,
    /* 280 */ pub t6: usize,
}

/// Monotonically-assigned process id, globally unique over a slot's occupancy
/// (invariant 7). Stable and comparable, so it also doubles as the back-reference
/// used for `parent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Pid(usize);

impl Pid {
    fn alloc() -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(1);
        Pid(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(value: usize) -> Self {
        Pid(value)
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl core::ops::Deref for Pid {
    type Target = usize;
    fn deref(&self) -> &usize {
        &self.0
    }
}

/// Sleep-channel key. An opaque equality tag: two sleepers/wakers agree on a channel
/// without needing to share a pointer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Proc(usize),
    Ticks,
    Buffer(usize),
    Lock(usize),
    Log,
    PipeRead(usize),
    PipeWrite(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcState {
    #[default]
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

/// Mutable process state, protected by this slot's own lock. `parent` stores the
/// pid of the parent slot directly rather than a separate global table: no code
/// path here ever holds two different processes' `inner` locks at once, so a
/// per-slot lock is sufficient.
pub struct ProcInner {
    pub state: ProcState,
    pub chan: Option<Channel>,
    pub killed: bool,
    pub xstate: isize,
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub cidx: usize,
}

impl ProcInner {
    const fn new() -> Self {
        Self {
            state: ProcState::Unused,
            chan: None,
            killed: false,
            xstate: 0,
            pid: Pid(0),
            parent: None,
            cidx: 0,
        }
    }
}

/// Data exclusively owned by a process slot; not lock-protected, touched only by
/// the owning process itself, or by `alloc`/`fork`/`wait` while the slot is not
/// scheduled (EMBRYO or ZOMBIE).
pub struct ProcData {
    pub kstack: VA,
    pub size: usize,
    pub pagetable: Option<Uvm>,
    pub trapframe: Option<Box<TrapFrame>>,
    pub context: Context,
    pub open_files: [Option<File>; NOFILE],
    pub cwd: Inode,
    pub name: String,
}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: VA(0),
            size: 0,
            pagetable: None,
            trapframe: None,
            context: Context::new(),
            open_files: [const { None }; NOFILE],
            cwd: Inode::new(0, 0, 0),
            name: String::new(),
        }
    }
}

pub struct Proc {
    pub inner: SpinLock<ProcInner>,
    data: UnsafeCell<ProcData>,
}

unsafe impl Sync for Proc {}

impl Proc {
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(ProcInner::new(), "proc"),
            data: UnsafeCell::new(ProcData::new()),
        }
    }

    pub fn data(&self) -> &ProcData {
        unsafe { &*self.data.get() }
    }

    /// # Safety
    /// Caller must ensure no other reference to this slot's data is live, which
    /// holds for EMBRYO/ZOMBIE setup/teardown and for the single CPU currently
    /// running this process.
    pub unsafe fn data_mut(&self) -> &mut ProcData {
        unsafe { &mut *self.data.get() }
    }

    pub fn is_killed(&self) -> bool {
        self.inner.lock().killed
    }

    /// Builds a fresh user page table with the trampoline and this process's
    /// existing trapframe mapped in. Used both by `alloc_proc` (on a brand new
    /// trapframe) and by `exec` (reusing the process's current trapframe).
    pub(crate) fn create_pagetable(&self, trapframe_pa: PA) -> Result<Uvm, KernelError> {
        let mut pagetable = Uvm::try_new()?;

        if pagetable
            .map_pages(
                VA(crate::memlayout::TRAMPOLINE),
                PA(trampoline as usize),
                PGSIZE,
                PTE_R | PTE_X,
            )
            .is_err()
        {
            return Err(KernelError::InvalidPage);
        }

        if pagetable
            .map_pages(
                VA(crate::memlayout::TRAPFRAME),
                trapframe_pa,
                PGSIZE,
                PTE_R | PTE_W,
            )
            .is_err()
        {
            pagetable.unmap(VA(crate::memlayout::TRAMPOLINE), 1, false);
            return Err(KernelError::InvalidPage);
        }

        Ok(pagetable)
    }
}

type Stack = [u8; PGSIZE * NKSTACK_PAGES];

fn alloc_kstack() -> Result<VA, KernelError> {
    let mem = Box::<Stack>::try_new_zeroed()?;
    let mem = unsafe { mem.assume_init() };
    Ok(VA(Box::into_raw(mem) as usize))
}

fn free_kstack(kstack: VA) {
    if kstack.as_usize() != 0 {
        let _mem = unsafe { Box::from_raw(kstack.as_usize() as *mut Stack) };
    }
}

/// Allocates a fresh process slot inside container `cidx`, carrying out the
/// kernel-stack/trapframe/page-table setup for EMBRYO processes without holding
/// the container-table or process lock across it. On return the slot is EMBRYO
/// (`Used`); the caller still must set `parent`/registers and flip it Runnable.
fn alloc_proc(cidx: usize) -> Result<&'static Proc, KernelError> {
    CONTAINER_TABLE.require_allocatable(cidx)?;

    let container: &'static Container = CONTAINER_TABLE.at(cidx);
    let mut found: Option<&'static Proc> = None;

    for pidx in 0..NPROC {
        let proc = container.proc(pidx);
        let mut inner = proc.inner.lock();
        if inner.state == ProcState::Unused {
            inner.pid = Pid::alloc();
            inner.state = ProcState::Used;
            inner.cidx = cidx;
            inner.killed = false;
            inner.chan = None;
            inner.xstate = 0;
            inner.parent = None;
            found = Some(proc);
            break;
        }
    }

    let proc = found.ok_or(KernelError::ProcessCapacity)?;

    let setup: Result<(), KernelError> = (|| {
        let trapframe = Box::<TrapFrame>::try_new_zeroed()?;
        let trapframe = unsafe { trapframe.assume_init() };
        let trapframe_pa = PA(trapframe.as_ref() as *const TrapFrame as usize);

        let pagetable = proc.create_pagetable(trapframe_pa)?;
        let kstack = alloc_kstack()?;

        let data = unsafe { proc.data_mut() };
        data.size = 0;
        data.trapframe = Some(trapframe);
        data.pagetable = Some(pagetable);
        data.kstack = kstack;
        data.context = Context::new();
        data.context.ra = fork_ret as usize;
        data.context.sp = (kstack.as_usize() + PGSIZE * NKSTACK_PAGES) as usize;

        Ok(())
    })();

    if let Err(e) = setup {
        proc.inner.lock().state = ProcState::Unused;
        return Err(e);
    }

    debug!(
        "proc: allocated pid={} in container slot {cidx}",
        *proc.inner.lock().pid
    );
    Ok(proc)
}

/// Entered via `Context::ra` the first time a freshly-forked process is switched
/// in by the scheduler. Returns to user space through the normal trap-return path.
extern "C" fn fork_ret() {
    unsafe { crate::trap::usertrapret() };
}

static ROOT_INIT_PID: AtomicUsize = AtomicUsize::new(0);

fn root_init_pid() -> Pid {
    Pid::from_raw(ROOT_INIT_PID.load(Ordering::Relaxed))
}

/// Called once at boot, after the filesystem is up: brings up the root container
/// rooted at `/` and its init process.
pub fn user_init() {
    let rootdir =
        Inode::get(crate::param::ROOTDEV, crate::fs::ROOTINO).expect("root inode must exist");
    CONTAINER_TABLE.init_root(rootdir.clone());

    let proc = alloc_proc(crate::cont::ROOT_CIDX).expect("userinit: alloc_proc failed");

    let data = unsafe { proc.data_mut() };
    data.size = data
        .pagetable
        .as_mut()
        .unwrap()
        .alloc(0, PGSIZE, PTE_W)
        .unwrap();
    data.cwd = rootdir;
    data.name = String::from("init");

    let trapframe = data.trapframe.as_mut().unwrap();
    trapframe.epc = 0;
    trapframe.sp = PGSIZE;

    // Console fd setup is done directly here rather than through
    // `file::setup_console_fds`, which reaches for `current_proc` -- not yet
    // true of init at this point in boot.
    let mut console = File::alloc().expect("userinit: console file");
    {
        let mut inner = crate::file::FILE_TABLE.inner[console.id].lock();
        inner.readable = true;
        inner.writeable = true;
        inner.r#type = crate::file::FileType::Device {
            inode: Inode::new(0, 0, 0),
            major: crate::file::CONSOLE as u16,
        };
    }
    data.open_files[1] = Some(console.dup());
    data.open_files[2] = Some(console.dup());
    data.open_files[0] = Some(console);

    let pid = {
        let mut inner = proc.inner.lock();
        inner.parent = None;
        inner.state = ProcState::Runnable;
        inner.pid
    };

    ROOT_INIT_PID.store(pid.as_usize(), Ordering::Relaxed);
    info!("userinit: root container online, init pid={}", *pid);
}

/// Grows or shrinks the current process's heap by `increment` bytes (may be
/// negative). Returns the new size.
pub fn grow(increment: isize) -> Result<usize, KernelError> {
    let proc = current_proc();
    let data = unsafe { proc.data_mut() };
    let old_size = data.size;

    let new_size = if increment >= 0 {
        data.pagetable
            .as_mut()
            .unwrap()
            .alloc(old_size, old_size + increment as usize, PTE_W)?
    } else {
        data.pagetable
            .as_mut()
            .unwrap()
            .dealloc(old_size, old_size.saturating_sub((-increment) as usize))
    };

    data.size = new_size;
    Ok(new_size)
}

/// Chooses a container for a new child: an explicit target, else the globally
/// "current" container set by `start`, else the caller's own container. In
/// either of the first two cases the new child is parented to root init, per
/// the fork rule; otherwise it is parented directly to the caller.
fn fork_target(target: Option<usize>) -> (usize, Pid) {
    if let Some(cidx) = target {
        return (cidx, root_init_pid());
    }
    if let Some(cidx) = CONTAINER_TABLE.inherited_cidx() {
        return (cidx, root_init_pid());
    }
    let caller = current_proc();
    let inner = caller.inner.lock();
    (inner.cidx, inner.pid)
}

/// `fork()`: create a child, landing in the caller's own container unless a
/// container was `start`ed (in which case the child lands there instead, per
/// the fork-inheritance rule).
pub fn fork() -> Result<Pid, KernelError> {
    fork_impl(None)
}

/// `cfork(cid)`'s delegate: create a child directly inside container index
/// `cidx`, parented to root init.
pub(crate) fn fork_into(cidx: usize) -> Result<Pid, KernelError> {
    fork_impl(Some(cidx))
}

fn fork_impl(target: Option<usize>) -> Result<Pid, KernelError> {
    let (cidx, parent) = fork_target(target);
    let caller = current_proc();

    let child = alloc_proc(cidx)?;

    let setup: Result<(), KernelError> = (|| {
        let caller_data = unsafe { caller.data_mut() };
        let child_data = unsafe { child.data_mut() };

        child_data
            .pagetable
            .as_mut()
            .unwrap()
            .copy(caller_data.pagetable.as_mut().unwrap(), caller_data.size)?;

        child_data.size = caller_data.size;
        **child_data.trapframe.as_mut().unwrap() = **caller_data.trapframe.as_ref().unwrap();
        child_data.trapframe.as_mut().unwrap().a0 = 0;

        for (slot, file) in child_data
            .open_files
            .iter_mut()
            .zip(caller_data.open_files.iter())
        {
            *slot = file.clone().map(|mut f| f.dup());
        }
        child_data.cwd = caller_data.cwd.dup();
        child_data.name = caller_data.name.clone();
        Ok(())
    })();

    if let Err(e) = setup {
        let data = unsafe { child.data_mut() };
        if let Some(pagetable) = data.pagetable.take() {
            pagetable.proc_free(data.size);
        }
        free_kstack(data.kstack);
        *data = ProcData::new();
        child.inner.lock().state = ProcState::Unused;
        return Err(e);
    }

    let pid = {
        let mut inner = child.inner.lock();
        inner.parent = Some(parent);
        inner.state = ProcState::Runnable;
        inner.pid
    };

    debug!(
        "fork: pid={} -> child pid={} (container slot {cidx})",
        *caller.inner.lock().pid,
        *pid
    );
    Ok(pid)
}

/// `exit(status)`: never returns. Closes file descriptors, releases the cwd
/// reference, reparents this process's own children to root init (waking any
/// that are already zombies), wakes the parent, and switches out as a zombie.
pub fn exit(status: isize) -> ! {
    let proc = current_proc();
    let cidx = proc.inner.lock().cidx;

    {
        let data = unsafe { proc.data_mut() };
        for file in data.open_files.iter_mut() {
            if let Some(mut f) = file.take() {
                f.close();
            }
        }

        let cwd = core::mem::replace(&mut data.cwd, Inode::new(0, 0, 0));
        log::begin_op();
        cwd.put();
        log::end_op();
    }

    let (self_pid, parent) = {
        let mut inner = proc.inner.lock();
        inner.xstate = status;
        (inner.pid, inner.parent)
    };

    if let Some(parent_pid) = parent {
        wakeup(Channel::Proc(parent_pid.as_usize()));
    }

    // Reparent this container's own children to root init.
    let container = CONTAINER_TABLE.at(cidx);
    for pidx in 0..NPROC {
        let child = container.proc(pidx);
        let mut inner = child.inner.lock();
        if inner.parent == Some(self_pid) {
            inner.parent = Some(root_init_pid());
            if inner.state == ProcState::Zombie {
                drop(inner);
                wakeup(Channel::Proc(root_init_pid().as_usize()));
            }
        }
    }

    proc.inner.lock().state = ProcState::Zombie;
    info!("exit: pid={} container slot {cidx} status={status}", *self_pid);

    unsafe { sched(proc) };
    unreachable!("zombie process rescheduled");
}

/// `wait()`: reaps one zombie child of the caller, walking every non-FREE
/// container (a child may have been adopted into root init's container after
/// its own container was torn down). Returns the reaped pid and its exit
/// status, or an error if the caller has no children left, or was killed
/// while waiting.
pub fn wait() -> Result<(Pid, isize), KernelError> {
    let caller_pid = current_proc().inner.lock().pid;

    loop {
        let mut have_children = false;

        for cidx in 0..NCONT {
            if CONTAINER_TABLE.state_of(cidx) == ContainerState::Free {
                continue;
            }

            let container = CONTAINER_TABLE.at(cidx);
            for pidx in 0..NPROC {
                let child = container.proc(pidx);
                let mut inner = child.inner.lock();

                if inner.parent != Some(caller_pid) {
                    continue;
                }
                have_children = true;

                if inner.state == ProcState::Zombie {
                    let reaped_pid = inner.pid;
                    let xstate = inner.xstate;
                    *inner = ProcInner::new();
                    drop(inner);

                    let data = unsafe { child.data_mut() };
                    if let Some(pagetable) = data.pagetable.take() {
                        pagetable.proc_free(data.size);
                    }
                    free_kstack(data.kstack);
                    *data = ProcData::new();

                    CONTAINER_TABLE.free_if_empty(cidx);
                    debug!("wait: reaped pid={reaped_pid:?} xstate={xstate}");
                    return Ok((reaped_pid, xstate));
                }
            }

            CONTAINER_TABLE.free_if_empty(cidx);
        }

        if !have_children || current_proc().is_killed() {
            return Err(KernelError::NoChildren);
        }

        sleep_self(Channel::Proc(caller_pid.as_usize()));
    }
}

/// Forces every non-FREE process slot in `cidx` to ZOMBIE and reparents them to
/// root init, without closing file descriptors or freeing memory: `stop` +
/// `wait` is the sole teardown pair, and `wait` alone performs the actual
/// resource release.
pub(crate) fn kill_container(cidx: usize) {
    let container = CONTAINER_TABLE.at(cidx);
    let root_pid = root_init_pid();

    for pidx in 0..NPROC {
        let proc = container.proc(pidx);
        let mut inner = proc.inner.lock();
        if inner.state == ProcState::Unused {
            continue;
        }

        inner.parent = Some(root_pid);
        if inner.state != ProcState::Zombie {
            inner.killed = true;
            inner.xstate = -1;
            inner.state = ProcState::Zombie;
        }
    }

    wakeup(Channel::Proc(root_pid.as_usize()));
    warn!("cont: container slot {cidx} stopped, children reparented to root init");
}

/// Locates a process by pid, restricted to the caller's own container. Marks it
/// killed, waking it if sleeping so it observes `killed` on its next return to
/// user space.
pub fn kill(pid: Pid) -> Result<(), KernelError> {
    let cidx = current_proc().inner.lock().cidx;
    let container = CONTAINER_TABLE.at(cidx);

    for pidx in 0..NPROC {
        let proc = container.proc(pidx);
        let mut inner = proc.inner.lock();
        if inner.pid == pid && inner.state != ProcState::Unused {
            inner.killed = true;
            if inner.state == ProcState::Sleeping {
                inner.state = ProcState::Runnable;
            }
            return Ok(());
        }
    }

    Err(KernelError::ContainerNotFound)
}

/// Atomically releases `user_lock`, parks the current process on `chan`, and
/// reacquires `user_lock` once woken. The transition to SLEEPING happens while
/// still holding the process's own slot lock, so a concurrent `wakeup` either
/// observes SLEEPING and wakes it, or runs entirely before this call begins.
pub fn sleep<'a, T>(chan: Channel, user_lock: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
    let proc = current_proc();

    // Acquire proc's own lock before releasing user_lock, so the condition
    // cannot be resolved and wakeup() run to completion before we mark
    // ourselves SLEEPING: wakeup() must take this same lock to see us.
    let guard_lock;
    {
        let mut inner = proc.inner.lock();
        guard_lock = SpinLock::unlock(user_lock);

        inner.chan = Some(chan);
        inner.state = ProcState::Sleeping;
    }

    unsafe { sched(proc) };

    proc.inner.lock().chan = None;

    guard_lock.lock()
}

/// Like `sleep`, but for callers with no lock of their own to hand over, such
/// as `wait()`'s poll loop.
fn sleep_self(chan: Channel) {
    let proc = current_proc();
    {
        let mut inner = proc.inner.lock();
        inner.chan = Some(chan);
        inner.state = ProcState::Sleeping;
    }

    unsafe { sched(proc) };

    proc.inner.lock().chan = None;
}

/// Wakes every process across every container sleeping on `chan`. O(NCONT x
/// NPROC); no ordering guarantee among woken processes.
pub fn wakeup(chan: Channel) {
    for cidx in 0..NCONT {
        if CONTAINER_TABLE.state_of(cidx) == ContainerState::Free {
            continue;
        }
        let container = CONTAINER_TABLE.at(cidx);
        for pidx in 0..NPROC {
            let proc = container.proc(pidx);
            let mut inner = proc.inner.lock();
            if inner.state == ProcState::Sleeping && inner.chan == Some(chan) {
                inner.state = ProcState::Runnable;
            }
        }
    }
}

/// Cooperative reschedule: returns the CPU to the scheduler without blocking.
pub fn r#yield() {
    let proc = current_proc();
    proc.inner.lock().state = ProcState::Runnable;
    unsafe { sched(proc) };
}

/// Switches from the current process's kernel context back into the
/// scheduler's. Called with no lock held (any state change the caller wanted
/// under `proc.inner` must already have happened and been dropped).
///
/// # Safety
/// Must be called from the kernel stack of the process currently running on
/// this CPU, with interrupts disabled, and with that process's state already
/// set to something other than RUNNING.
unsafe fn sched(proc: &'static Proc) {
    assert!(!interrupts::get(), "sched: interrupts enabled");
    assert_ne!(
        proc.inner.lock().state,
        ProcState::Running,
        "sched: still running"
    );

    let interrupt_enabled = unsafe { (*current_cpu()).interrupt_enabled };
    unsafe {
        let data = proc.data_mut();
        let cpu = current_cpu();
        swtch(&mut data.context, &(*cpu).context);
    }
    unsafe { (*current_cpu()).interrupt_enabled = interrupt_enabled };
}

/// Per-CPU scheduler loop. Never returns. Container-granular round robin: each
/// pass visits every container slot once, advances its `nextproc` cursor, and
/// dispatches at most one process from it.
pub fn scheduler() -> ! {
    loop {
        unsafe { interrupts::enable() };

        for cidx in 0..NCONT {
            let Some((pidx, _already_running)) = CONTAINER_TABLE.scheduler_candidate(cidx) else {
                continue;
            };
            CONTAINER_TABLE.advance_nextproc(cidx, pidx);

            let container = CONTAINER_TABLE.at(cidx);
            let proc = container.proc(pidx);

            {
                let mut inner = proc.inner.lock();
                if inner.state != ProcState::Runnable {
                    continue;
                }
                if !CONTAINER_TABLE.try_mark_running(cidx) {
                    continue;
                }
                inner.state = ProcState::Running;
            }

            {
                let _lock = lock_current_cpu();
                unsafe { (*current_cpu()).proc = Some(proc) };
            }

            unsafe {
                let pa = proc.data().pagetable.as_ref().unwrap().as_pa();
                satp::write(satp::make(pa.as_usize()));
                vma::sfence();

                let cpu = current_cpu();
                swtch(&mut (*cpu).context, &proc.data().context);
            }

            {
                let _lock = lock_current_cpu();
                unsafe { (*current_cpu()).proc = None };
            }

            CONTAINER_TABLE.unmark_running(cidx);
        }
    }
}

/// Copies `src.len()` bytes from the kernel into the current process's address
/// space at `dst`.
pub fn copy_out_user(src: &[u8], dst: VA) -> Result<(), KernelError> {
    let proc = current_proc();
    let data = unsafe { proc.data_mut() };
    data.pagetable.as_mut().unwrap().copy_out(dst, src)
}

/// Copies `dst.len()` bytes from the current process's address space at `src`
/// into the kernel.
pub fn copy_in_user(dst: &mut [u8], src: VA) -> Result<(), KernelError> {
    let proc = current_proc();
    let data = unsafe { proc.data_mut() };
    data.pagetable.as_mut().unwrap().copy_in(dst, src)
}

//! Container table and the Container Control API (create/start/pause/resume/stop/cfork).
//!
//! A container owns a fixed-size process table of its own; the global
//! [`ContainerTable`] is just `NCONT` of these slots. Container metadata (name,
//! rootpath, rootdir, state, scheduler cursor) lives behind one table-wide lock;
//! each process slot has its own lock (see [`crate::proc::ProcInner`]). Lock order
//! is always containers before processes.

use alloc::string::String;
use core::cell::UnsafeCell;
use core::mem::{MaybeUninit, transmute};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::KernelError;
use crate::fs::Inode;
use crate::param::{CONTNAMESZ, NCONT, NPROC, ROOTPATHSZ};
use crate::proc::{self, Pid, Proc, ProcState};
use crate::spinlock::SpinLock;

/// Monotonically-assigned container id. Like [`Pid`], it is never reused until
/// wraparound, which makes the bare value itself a generation-safe handle for
/// back-references: storing a `cid` (or the fixed table index it currently
/// occupies) cannot alias a different, later container the way a raw pointer or
/// naively-reused index could.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cid(pub usize);

impl Cid {
    fn alloc() -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(1);
        Cid(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerState {
    #[default]
    Free,
    Embryo,
    Ready,
    Runnable,
    Running,
    Paused,
    Stopping,
}

/// Container metadata, guarded by [`ContainerTable`]'s table-wide lock.
pub struct ContainerMeta {
    pub cid: usize,
    pub name: String,
    pub rootpath: String,
    pub rootdir: Option<Inode>,
    pub state: ContainerState,
    pub nextproc: usize,
}

impl ContainerMeta {
    const fn new() -> Self {
        Self {
            cid: 0,
            name: String::new(),
            rootpath: String::new(),
            rootdir: None,
            state: ContainerState::Free,
            nextproc: 0,
        }
    }
}

/// A container's own process table. Slots are never relocated, so `(cidx, pidx)`
/// is a stable address for the lifetime of the kernel.
pub struct Container {
    procs: [UnsafeCell<Proc>; NPROC],
}

unsafe impl Sync for Container {}

impl Container {
    const fn new() -> Self {
        let mut array: [MaybeUninit<UnsafeCell<Proc>>; NPROC] =
            unsafe { MaybeUninit::uninit().assume_init() };
        let mut i = 0;
        while i < NPROC {
            array[i] = MaybeUninit::new(UnsafeCell::new(Proc::new()));
            i += 1;
        }
        Self {
            procs: unsafe { transmute(array) },
        }
    }

    pub fn proc(&self, pidx: usize) -> &'static Proc {
        // SAFETY: CONTAINER_TABLE is 'static and process slots are never moved or
        // freed, only reset in place; aliasing is arbitrated by `Proc::inner`'s lock.
        unsafe { &*(self.procs[pidx].get() as *const Proc) }
    }
}

pub struct ContainerTable {
    containers: [Container; NCONT],
    meta: SpinLock<[ContainerMeta; NCONT]>,
    /// Single-writer "current container" pointer, set by `start` and cleared by
    /// `pause`/`stop`. Consulted only by `fork` for container inheritance; the
    /// scheduler never reads it (see the dispatch-eligibility note on
    /// [`ContainerState::Running`] below).
    current: SpinLock<Option<usize>>,
}

unsafe impl Sync for ContainerTable {}

pub static CONTAINER_TABLE: ContainerTable = ContainerTable::new();

/// The root container always occupies slot 0 and is created once at boot.
pub const ROOT_CIDX: usize = 0;

impl ContainerTable {
    const fn new() -> Self {
        let containers = {
            let mut array: [MaybeUninit<Container>; NCONT] =
                unsafe { MaybeUninit::uninit().assume_init() };
            let mut i = 0;
            while i < NCONT {
                array[i] = MaybeUninit::new(Container::new());
                i += 1;
            }
            unsafe { transmute(array) }
        };

        let meta = {
            let mut array: [MaybeUninit<ContainerMeta>; NCONT] =
                unsafe { MaybeUninit::uninit().assume_init() };
            let mut i = 0;
            while i < NCONT {
                array[i] = MaybeUninit::new(ContainerMeta::new());
                i += 1;
            }
            SpinLock::new(unsafe { transmute(array) }, "conttable")
        };

        Self {
            containers,
            meta,
            current: SpinLock::new(None, "curcont"),
        }
    }

    pub(crate) fn at(&self, cidx: usize) -> &Container {
        &self.containers[cidx]
    }

    /// Called once at boot to bring up the root container, spanning the whole
    /// filesystem. It is created directly in the `RUNNABLE` state: there is no
    /// external creator around to call `start` on it.
    pub fn init_root(&self, rootdir: Inode) {
        let mut meta = self.meta.lock();
        let root = &mut meta[ROOT_CIDX];
        root.cid = Cid::alloc().0;
        root.name = String::from("root");
        root.rootpath = String::from("/");
        root.rootdir = Some(rootdir);
        root.state = ContainerState::Runnable;
        root.nextproc = 0;
    }

    /// The root container's id, for callers that need a stable handle to it
    /// (e.g. reparenting orphans).
    pub fn root_cid(&self) -> usize {
        self.meta.lock()[ROOT_CIDX].cid
    }

    fn find_by_name(meta: &[ContainerMeta; NCONT], name: &str) -> Option<usize> {
        meta.iter()
            .position(|m| m.state != ContainerState::Free && m.name == name)
    }

    fn find_by_cid(meta: &[ContainerMeta; NCONT], cid: usize) -> Option<usize> {
        meta.iter()
            .position(|m| m.state != ContainerState::Free && m.cid == cid)
    }

    /// `create(fullpath)`: the trailing path component becomes the container
    /// name; the whole path is resolved to an inode and bound as `rootdir`. The
    /// caller is expected to have pre-created the directory.
    pub fn create(&self, fullpath: &str) -> Result<usize, KernelError> {
        let rootpath = fullpath;
        let name = fullpath.rsplit('/').next().unwrap_or(fullpath);

        if name.is_empty() || name.len() > CONTNAMESZ {
            return Err(KernelError::Policy);
        }
        if rootpath.len() > ROOTPATHSZ {
            return Err(KernelError::Policy);
        }

        let cidx = {
            let mut meta = self.meta.lock();

            if Self::find_by_name(&meta, name).is_some() {
                return Err(KernelError::ContainerExists);
            }

            let cidx = meta
                .iter()
                .position(|m| m.state == ContainerState::Free)
                .ok_or(KernelError::ContainerCapacity)?;

            let slot = &mut meta[cidx];
            slot.cid = Cid::alloc().0;
            slot.name = String::from(name);
            slot.rootpath = String::from(rootpath);
            slot.rootdir = None;
            slot.state = ContainerState::Embryo;
            slot.nextproc = 0;
            cidx
        };

        // Resolve and validate the rootdir without holding the table lock: path
        // resolution can itself touch the filesystem layer and must not be done
        // under a spinlock.
        let rootdir = match crate::fs::Path::new(rootpath).resolve() {
            Ok(inode) => inode,
            Err(e) => {
                self.meta.lock()[cidx].state = ContainerState::Free;
                return Err(e);
            }
        };

        let mut meta = self.meta.lock();
        meta[cidx].rootdir = Some(rootdir);
        meta[cidx].state = ContainerState::Ready;

        Ok(cidx)
    }

    /// `start(name)`: {READY, RUNNABLE, RUNNING} -> RUNNABLE, and this container
    /// becomes the "current container" fork() will inherit into. Returns the
    /// container's `cid`.
    pub fn start(&self, name: &str) -> Result<usize, KernelError> {
        let mut meta = self.meta.lock();
        let cidx = Self::find_by_name(&meta, name).ok_or(KernelError::ContainerNotFound)?;

        match meta[cidx].state {
            ContainerState::Ready | ContainerState::Runnable | ContainerState::Running => {
                meta[cidx].state = ContainerState::Runnable;
                let cid = meta[cidx].cid;
                drop(meta);
                *self.current.lock() = Some(cidx);
                Ok(cid)
            }
            _ => Err(KernelError::InvalidContainerState),
        }
    }

    /// `pause(name)`: RUNNABLE/RUNNING -> PAUSED. Does not touch any process;
    /// the scheduler simply stops selecting this container's slots.
    pub fn pause(&self, name: &str) -> Result<(), KernelError> {
        let mut meta = self.meta.lock();
        let cidx = Self::find_by_name(&meta, name).ok_or(KernelError::ContainerNotFound)?;

        match meta[cidx].state {
            ContainerState::Runnable | ContainerState::Running => {
                meta[cidx].state = ContainerState::Paused;
                drop(meta);
                let mut current = self.current.lock();
                if *current == Some(cidx) {
                    *current = None;
                }
                Ok(())
            }
            _ => Err(KernelError::InvalidContainerState),
        }
    }

    /// `resume(name)`: PAUSED -> RUNNABLE, symmetric with `pause`. The policy
    /// check (caller's cwd must be a prefix of the container's rootpath) is
    /// performed by the caller, not here.
    pub fn resume(&self, name: &str) -> Result<(), KernelError> {
        let mut meta = self.meta.lock();
        let cidx = Self::find_by_name(&meta, name).ok_or(KernelError::ContainerNotFound)?;

        match meta[cidx].state {
            ContainerState::Paused => {
                meta[cidx].state = ContainerState::Runnable;
                Ok(())
            }
            _ => Err(KernelError::InvalidContainerState),
        }
    }

    /// `stop(cid)`: any non-FREE, non-STOPPING state -> STOPPING, and every live
    /// process in the container is killed. Stop never frees a process's
    /// resources directly; only `wait`, called by whoever reaps the zombie
    /// (an adopting parent in another container, or the root init), actually
    /// frees a slot and, once the container's last process is reaped, the
    /// container slot itself. This keeps teardown and the scheduler from racing
    /// over the same resources.
    pub fn stop(&self, name: &str) -> Result<(), KernelError> {
        let cidx = {
            let mut meta = self.meta.lock();
            let cidx = Self::find_by_name(&meta, name).ok_or(KernelError::ContainerNotFound)?;

            if meta[cidx].state == ContainerState::Free || meta[cidx].state == ContainerState::Stopping
            {
                return Err(KernelError::InvalidContainerState);
            }

            meta[cidx].state = ContainerState::Stopping;
            drop(meta);

            let mut current = self.current.lock();
            if *current == Some(cidx) {
                *current = None;
            }
            cidx
        };

        proc::kill_container(cidx);
        Ok(())
    }

    /// Reclaims a container slot once `wait()` has reaped its last process.
    /// Called only from `proc::wait`, never by `stop` itself.
    pub(crate) fn free_if_empty(&self, cidx: usize) {
        let container = self.at(cidx);
        let empty = (0..NPROC).all(|pidx| {
            let inner = container.proc(pidx).inner.lock();
            inner.state == ProcState::Unused
        });

        if !empty {
            return;
        }

        let mut meta = self.meta.lock();
        if meta[cidx].state == ContainerState::Stopping {
            meta[cidx] = ContainerMeta::new();
        }
    }

    /// `cfork(cid)`: like `fork`, but the child is placed in container `cid`
    /// instead of the caller's own container. `cid` must be RUNNABLE or RUNNING.
    pub fn cfork(&self, cid: usize) -> Result<Pid, KernelError> {
        let meta = self.meta.lock();
        let cidx = Self::find_by_cid(&meta, cid).ok_or(KernelError::ContainerNotFound)?;
        match meta[cidx].state {
            ContainerState::Runnable | ContainerState::Running => {}
            _ => return Err(KernelError::InvalidContainerState),
        }
        drop(meta);

        proc::fork_into(cidx)
    }

    /// The path string the caller's own container was `create`d with, for
    /// `cgetrootdir` -- userspace receives the bound path, not a raw inode.
    pub fn current_rootpath(&self) -> String {
        let cidx = proc::current_proc().inner.lock().cidx;
        self.meta.lock()[cidx].rootpath.clone()
    }

    /// The path string another container was `create`d with, by name, for
    /// `getcontrootdir`.
    pub fn rootpath_of(&self, name: &str) -> Result<String, KernelError> {
        let meta = self.meta.lock();
        let cidx = Self::find_by_name(&meta, name).ok_or(KernelError::ContainerNotFound)?;
        Ok(meta[cidx].rootpath.clone())
    }

    /// Snapshot of container states and names, for `cps`.
    pub fn snapshot(&self) -> alloc::vec::Vec<(usize, String, ContainerState)> {
        let meta = self.meta.lock();
        meta.iter()
            .filter(|m| m.state != ContainerState::Free)
            .map(|m| (m.cid, m.name.clone(), m.state))
            .collect()
    }

    /// Fork-inheritance target: whichever container `start` most recently
    /// pointed at, per the design notes' single-writer "current container"
    /// field. Not consulted by the scheduler.
    pub(crate) fn inherited_cidx(&self) -> Option<usize> {
        *self.current.lock()
    }

    /// Validates that `cidx` is allocatable into (container must be in a state
    /// that accepts new processes): READY, RUNNABLE, or RUNNING.
    pub(crate) fn require_allocatable(&self, cidx: usize) -> Result<(), KernelError> {
        let meta = self.meta.lock();
        match meta[cidx].state {
            ContainerState::Ready | ContainerState::Runnable | ContainerState::Running => Ok(()),
            _ => Err(KernelError::InvalidContainerState),
        }
    }

    /// Called by the scheduler once per pass, for container `cidx`: advances
    /// `nextproc` and reports whether the container is presently eligible for
    /// dispatch (RUNNABLE or RUNNING), along with the starting process-slot
    /// cursor to scan from.
    pub(crate) fn scheduler_candidate(&self, cidx: usize) -> Option<(usize, bool)> {
        let meta = self.meta.lock();
        let slot = &meta[cidx];
        match slot.state {
            ContainerState::Runnable | ContainerState::Running => {
                Some((slot.nextproc, slot.state == ContainerState::Running))
            }
            _ => None,
        }
    }

    pub(crate) fn advance_nextproc(&self, cidx: usize, pidx: usize) {
        self.meta.lock()[cidx].nextproc = (pidx + 1) % NPROC;
    }

    /// Current state of container slot `cidx`, for callers sweeping all slots
    /// (`wait`, `wakeup`) that need to skip FREE ones.
    pub(crate) fn state_of(&self, cidx: usize) -> ContainerState {
        self.meta.lock()[cidx].state
    }

    /// Called by the scheduler right before dispatching a process out of
    /// `cidx`. "At most one container RUNNING" is a per-CPU reading (the
    /// resolution picked for the open question in the design notes), not a
    /// table-wide exclusion: two CPUs may each mark a different container
    /// RUNNING and dispatch into it at the same time. This only flips the
    /// bookkeeping state so `cps` reports RUNNING instead of RUNNABLE while a
    /// process from this container is actually executing somewhere; dispatch
    /// itself is never refused here.
    pub(crate) fn try_mark_running(&self, cidx: usize) -> bool {
        let mut meta = self.meta.lock();
        if meta[cidx].state == ContainerState::Runnable || meta[cidx].state == ContainerState::Running {
            meta[cidx].state = ContainerState::Running;
            return true;
        }
        false
    }

    /// Called by the scheduler after a dispatched process yields or blocks.
    /// Resets the container back to RUNNABLE unless it has since moved to
    /// STOPPING or PAUSED (those transitions win).
    pub(crate) fn unmark_running(&self, cidx: usize) {
        let mut meta = self.meta.lock();
        if meta[cidx].state == ContainerState::Running {
            meta[cidx].state = ContainerState::Runnable;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_array() -> [ContainerMeta; NCONT] {
        let mut array: [MaybeUninit<ContainerMeta>; NCONT] =
            unsafe { MaybeUninit::uninit().assume_init() };
        for slot in array.iter_mut() {
            slot.write(ContainerMeta::new());
        }
        unsafe { transmute(array) }
    }

    #[test]
    fn find_by_name_skips_free_slots() {
        let mut meta = meta_array();
        meta[2].state = ContainerState::Ready;
        meta[2].name = String::from("c1");

        assert_eq!(ContainerTable::find_by_name(&meta, "c1"), Some(2));
        assert_eq!(ContainerTable::find_by_name(&meta, "c"), None);
        assert_eq!(ContainerTable::find_by_name(&meta, "c10"), None);
    }

    #[test]
    fn find_by_name_requires_full_match_not_prefix() {
        let mut meta = meta_array();
        meta[0].state = ContainerState::Running;
        meta[0].name = String::from("c10");

        // A query for "c1" must not match the "c10" slot.
        assert_eq!(ContainerTable::find_by_name(&meta, "c1"), None);
        assert_eq!(ContainerTable::find_by_name(&meta, "c10"), Some(0));
    }

    #[test]
    fn find_by_cid_skips_free_slots() {
        let mut meta = meta_array();
        meta[5].state = ContainerState::Paused;
        meta[5].cid = 42;

        assert_eq!(ContainerTable::find_by_cid(&meta, 42), Some(5));
        assert_eq!(ContainerTable::find_by_cid(&meta, 0), None);
    }
}

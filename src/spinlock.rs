use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::proc::{Cpu, InterruptLock, current_cpu, lock_current_cpu};

/// Mutual exclusion lock that busy-waits. While held, interrupts are disabled on the
/// holding CPU so the lock can be used from interrupt handlers without deadlocking against
/// itself.
///
/// Locked when `cpu` is not null.
#[derive(Debug)]
pub struct SpinLock<T> {
    name: &'static str,
    cpu: AtomicPtr<Cpu>,
    data: UnsafeCell<T>,
}

// Safety: UnsafeCell is not Sync but it can only be consumed through a guard,
// so SpinLock is safe to share across threads if the inner type is Send.
unsafe impl<T> Sync for SpinLock<T> where T: Send {}

pub struct SpinLockGuard<'a, T: 'a> {
    lock: &'a SpinLock<T>,
    _intr_lock: InterruptLock,
}

// Safety: the UnsafeCell inside SpinLock is not Sync, but only one thread can hold this
// guard at a time, so it is safe to share as long as T is Sync.
unsafe impl<T> Sync for SpinLockGuard<'_, T> where T: Sync {}

impl<T> SpinLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        SpinLock {
            name,
            cpu: AtomicPtr::new(ptr::null_mut()),
            data: UnsafeCell::new(value),
        }
    }

    /// Returns the lock's name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    // Safety: must be called with interrupts disabled.
    unsafe fn holding(&self) -> bool {
        self.cpu.load(Ordering::Relaxed) == unsafe { current_cpu() }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let _intr_lock = lock_current_cpu();

        unsafe {
            assert!(!self.holding(), "acquire lock {}", self.name);

            loop {
                if self
                    .cpu
                    .compare_exchange(
                        ptr::null_mut(),
                        current_cpu(),
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    break SpinLockGuard {
                        lock: self,
                        _intr_lock,
                    };
                }

                hint::spin_loop()
            }
        }
    }

    /// Drops `guard` and returns the lock it came from, so the caller can immediately
    /// reacquire. Used by `proc::sleep` to swap a condition lock for the process lock
    /// without leaving a window where neither is held.
    pub fn unlock(guard: SpinLockGuard<'_, T>) -> &'_ SpinLock<T> {
        let lock = guard.lock;
        drop(guard);
        lock
    }

    /// Consumes the lock and returns the inner data. Since this takes `self` by value, no
    /// other reference to the lock can exist.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Since this call mutably borrows self, we can guarantee no one else is holding a
    /// reference.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Use this over `get_mut` when only a shared reference to the lock is available.
    ///
    /// # Safety
    /// The caller must ensure no other reference to the data is live.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }

    /// Forcibly clears ownership of the lock without going through a guard's `Drop`.
    ///
    /// # Safety
    /// The caller must be the current holder and must not use any outstanding guard for
    /// this lock afterwards.
    pub unsafe fn force_unlock(&self) {
        assert!(unsafe { self.holding() }, "force_unlock {}", self.name);
        self.cpu.store(ptr::null_mut(), Ordering::Release);
    }
}

// Dropping the guard releases the lock and the interrupt lock it carries.
impl<'a, T: 'a> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        // Safety: holding a guard implies interrupts are disabled, so holding() is safe to
        // call here.
        unsafe {
            assert!(self.lock.holding(), "release lock {}", self.lock.name);
        }

        self.lock.cpu.store(ptr::null_mut(), Ordering::Release);
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

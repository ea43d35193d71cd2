//! Locking Primitives
//!
//! Two layers:
//! - [`RawLock`], a single word flipped with an atomic exchange. No owner,
//!   no queueing, no fairness.
//! - [`SpinLock`], a raw lock plus preemption control, optional local
//!   interrupt masking and the owning processor for diagnostics.
//!
//! Spinlocks guard short non-blocking sections only. Plain `lock` is not
//! reentrant: taking a spinlock the same processor already holds panics
//! with the lock's address instead of spinning forever.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::IrqFlags;
use crate::kern::startup::Kernel;
use crate::types::ProcessorId;

// ============================================================================
// Raw Lock
// ============================================================================

const RAW_FREE: usize = 0;
const RAW_HELD: usize = 1;

/// A 0/1 lock word
#[repr(C)]
pub struct RawLock {
    word: AtomicUsize,
}

impl core::fmt::Debug for RawLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RawLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl RawLock {
    /// Create a new unlocked raw lock
    pub const fn new() -> Self {
        Self {
            word: AtomicUsize::new(RAW_FREE),
        }
    }

    /// Atomically store `value`, returning what the word held before
    pub fn exchange(&self, value: usize) -> usize {
        self.word.swap(value, Ordering::AcqRel)
    }

    /// One acquisition attempt; true if this call took the lock
    pub fn try_acquire(&self) -> bool {
        self.exchange(RAW_HELD) == RAW_FREE
    }

    /// Spin until this caller flips the word from free to held
    pub fn acquire(&self) {
        while !self.try_acquire() {
            while self.is_locked() {
                core::hint::spin_loop();
            }
        }
    }

    /// Release the lock. Releasing a free lock is a fatal bug.
    pub fn release(&self) {
        if self.exchange(RAW_FREE) == RAW_FREE {
            panic!("raw lock {:p} released while not held", self);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != RAW_FREE
    }
}

impl Default for RawLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Swap in 1 and return the previous value; 0 means the lock was taken
pub fn acquire_raw(lock: &RawLock) -> usize {
    lock.exchange(RAW_HELD)
}

/// Swap in 0
pub fn release_raw(lock: &RawLock) {
    lock.release();
}

// ============================================================================
// Spin Lock with Data
// ============================================================================

const NO_OWNER: usize = usize::MAX;

/// How a guard undoes its acquisition
#[derive(Debug, Clone, Copy)]
enum Release {
    Plain,
    /// Re-enable interrupts unconditionally
    Irq,
    /// Put back exactly the saved interrupt state
    Restore(IrqFlags),
}

/// A spin lock protecting `T`, aware of preemption and interrupts
pub struct SpinLock<T> {
    raw: RawLock,
    owner: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawLock::new(),
            owner: AtomicUsize::new(NO_OWNER),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire with preemption disabled, interrupts untouched
    pub fn lock<'a>(&'a self, kernel: &'a Kernel) -> SpinLockGuard<'a, T> {
        self.acquire(kernel);
        SpinLockGuard {
            lock: self,
            kernel,
            release: Release::Plain,
        }
    }

    /// Acquire with local interrupts disabled; the guard re-enables them
    pub fn lock_irq<'a>(&'a self, kernel: &'a Kernel) -> SpinLockGuard<'a, T> {
        kernel.platform().disable_interrupts();
        self.acquire(kernel);
        SpinLockGuard {
            lock: self,
            kernel,
            release: Release::Irq,
        }
    }

    /// Acquire with local interrupts disabled; the guard restores the
    /// state saved here, so nested holders compose
    pub fn lock_irqsave<'a>(&'a self, kernel: &'a Kernel) -> SpinLockGuard<'a, T> {
        let flags = kernel.platform().save_and_disable_interrupts();
        self.acquire(kernel);
        SpinLockGuard {
            lock: self,
            kernel,
            release: Release::Restore(flags),
        }
    }

    fn acquire(&self, kernel: &Kernel) {
        kernel.preempt_disable();
        let cpu = kernel.cpu_id().0;

        while !self.raw.try_acquire() {
            if self.owner.load(Ordering::Acquire) == cpu {
                panic!(
                    "spinlock {:p}: cpu{} would deadlock re-acquiring a lock it holds",
                    self, cpu
                );
            }
            core::hint::spin_loop();
        }

        let prev = self.owner.swap(cpu, Ordering::AcqRel);
        assert_eq!(
            prev, NO_OWNER,
            "spinlock {:p}: acquired with stale owner cpu{}",
            self, prev
        );
    }

    fn release(&self, kernel: &Kernel, release: Release) {
        self.owner.store(NO_OWNER, Ordering::Release);
        self.raw.release();
        kernel.preempt_enable();

        match release {
            Release::Plain => {}
            Release::Irq => kernel.platform().enable_interrupts(),
            Release::Restore(flags) => kernel.platform().restore_interrupts(flags),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Processor currently holding the lock
    pub fn owner(&self) -> Option<ProcessorId> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            cpu => Some(ProcessorId(cpu)),
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    kernel: &'a Kernel,
    release: Release,
}

impl<'a, T> core::ops::Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> core::ops::DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release(self.kernel, self.release);
    }
}

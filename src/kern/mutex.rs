//! Sleeping Mutex
//!
//! A raw lock word says whether the mutex is held. The owner and the FIFO
//! of blocked waiters sit behind a spinlock. Unlocking with waiters hands
//! the mutex straight to the head waiter: the raw lock stays held and the
//! waiter wakes up as the owner.
//!
//! A woken waiter re-checks ownership and goes back to sleep if it was not
//! handed the mutex, so a stray wakeup cannot produce two owners.

use crate::kern::lock::{RawLock, SpinLock};
use crate::kern::sched_prim::WaitQueue;
use crate::kern::startup::{kernel, Kernel};
use crate::kern::thread::ThreadState;
use crate::types::ThreadId;

#[derive(Debug)]
struct MutexInner {
    owner: Option<ThreadId>,
    waiters: WaitQueue,
}

pub struct Mutex {
    held: RawLock,
    inner: SpinLock<MutexInner>,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            held: RawLock::new(),
            inner: SpinLock::new(MutexInner {
                owner: None,
                waiters: WaitQueue::new(),
            }),
        }
    }

    /// Take the mutex, sleeping until it is handed over if it is held
    pub fn lock(&self, kernel: &Kernel) {
        let me = kernel.current_thread().unwrap_or_else(|| {
            panic!("{}: mutex lock without a current thread", kernel.cpu_id())
        });

        let mut inner = self.inner.lock_irqsave(kernel);
        loop {
            if self.held.try_acquire() {
                assert!(
                    inner.owner.is_none(),
                    "mutex {:p} free but owned by {:?}",
                    self,
                    inner.owner
                );
                inner.owner = Some(me.id());
                inner.waiters.discard(me.id());
                return;
            }
            if inner.owner == Some(me.id()) {
                panic!("{} locking mutex {:p} it already owns", me.id(), self);
            }

            if !inner.waiters.contains(me.id()) {
                inner.waiters.push(me.clone());
            }
            me.set_state(ThreadState::Blocked);
            drop(inner);

            kernel.schedule();

            inner = self.inner.lock_irqsave(kernel);
            if inner.owner == Some(me.id()) {
                inner.waiters.discard(me.id());
                return;
            }
        }
    }

    /// Take the mutex if it is free
    pub fn try_lock(&self, kernel: &Kernel) -> bool {
        let me = match kernel.current_thread() {
            Some(me) => me,
            None => return false,
        };
        let mut inner = self.inner.lock_irqsave(kernel);
        if self.held.try_acquire() {
            inner.owner = Some(me.id());
            true
        } else {
            false
        }
    }

    /// Release the mutex, handing it to the longest waiter if there is one
    pub fn unlock(&self, kernel: &Kernel) {
        let me = kernel.current_thread().map(|t| t.id());
        let mut inner = self.inner.lock_irqsave(kernel);

        if me.is_none() || inner.owner != me {
            log::warn!(
                "mutex {:p}: unlock by {:?}, owner is {:?}",
                self,
                me,
                inner.owner
            );
            return;
        }

        match inner.waiters.pop_front() {
            None => {
                inner.owner = None;
                self.held.release();
            }
            Some(next) => {
                inner.owner = Some(next.id());
                kernel.wake_up(&next);
            }
        }
    }

    pub fn owner(&self, kernel: &Kernel) -> Option<ThreadId> {
        self.inner.lock_irqsave(kernel).owner
    }

    /// Blocked threads in the order they will get the mutex
    pub fn waiters(&self, kernel: &Kernel) -> alloc::vec::Vec<ThreadId> {
        self.inner.lock_irqsave(kernel).waiters.ids()
    }

    pub fn is_locked(&self) -> bool {
        self.held.is_locked()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .finish()
    }
}

pub fn mutex_lock(mutex: &Mutex) {
    mutex.lock(kernel());
}

pub fn mutex_unlock(mutex: &Mutex) {
    mutex.unlock(kernel());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::kern::testutil;
    use alloc::boxed::Box;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    fn leak<T>(value: T) -> &'static T {
        Box::leak(Box::new(value))
    }

    #[test]
    fn test_uncontended_lock_and_warnings() {
        let (platform, kernel) = testutil::host_kernel(KernelConfig::new());
        let mutex: &'static Mutex = leak(Mutex::new());
        let seen: &'static spin::Mutex<Vec<bool>> = leak(spin::Mutex::new(Vec::new()));
        let done: &'static AtomicBool = leak(AtomicBool::new(false));

        let task = kernel
            .create_kernel_task(Box::new(move || {
                let me = kernel.current_thread().unwrap().id();
                let mut seen = seen.lock();
                seen.push(mutex.try_lock(kernel));
                seen.push(mutex.owner(kernel) == Some(me));
                seen.push(!mutex.try_lock(kernel));
                mutex.unlock(kernel);
                seen.push(!mutex.is_locked());
                // Unlocking a free mutex is ignored
                mutex.unlock(kernel);
                seen.push(!mutex.is_locked());
                mutex.lock(kernel);
                seen.push(mutex.is_locked());
                mutex.unlock(kernel);
                done.store(true, Ordering::SeqCst);
                0
            }))
            .unwrap();
        assert!(kernel.task_state(task).is_some());

        let run = testutil::start(platform, kernel);
        run.wait_until("checks done", || done.load(Ordering::SeqCst));
        assert_eq!(*seen.lock(), [true; 6]);

        // Not the owner: ignored
        assert!(!mutex.is_locked());
        mutex.unlock(kernel);
        assert_eq!(mutex.owner(kernel), None);
    }

    #[test]
    fn test_mutual_exclusion_under_preemption() {
        const THREADS: usize = 4;
        const ROUNDS: u64 = 300;

        let config = KernelConfig::new()
            .with_cpus(2)
            .with_frequencies(1000, 1000, 100);
        let (platform, kernel) = testutil::host_kernel(config);
        let mutex: &'static Mutex = leak(Mutex::new());
        let counter: &'static AtomicU64 = leak(AtomicU64::new(0));
        let finished: &'static AtomicUsize = leak(AtomicUsize::new(0));

        for _ in 0..THREADS {
            kernel
                .create_kernel_task(Box::new(move || {
                    for i in 0..ROUNDS {
                        mutex.lock(kernel);
                        let v = counter.load(Ordering::SeqCst);
                        if i % 3 == 0 {
                            // Get preempted while holding the mutex
                            platform.tick();
                        }
                        counter.store(v + 1, Ordering::SeqCst);
                        mutex.unlock(kernel);
                    }
                    finished.fetch_add(1, Ordering::SeqCst);
                    0
                }))
                .unwrap();
        }

        let run = testutil::start(platform, kernel);
        run.wait_until("all threads done", || {
            finished.load(Ordering::SeqCst) == THREADS
        });

        assert_eq!(counter.load(Ordering::SeqCst), THREADS as u64 * ROUNDS);
        assert_eq!(mutex.owner(kernel), None);
        assert!(mutex.waiters(kernel).is_empty());
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_waiters_acquire_in_arrival_order() {
        let (platform, kernel) =
            testutil::host_kernel(KernelConfig::new().with_preemption(false));
        let mutex: &'static Mutex = leak(Mutex::new());
        let order: &'static spin::Mutex<Vec<usize>> = leak(spin::Mutex::new(Vec::new()));

        kernel
            .create_kernel_task(Box::new(move || {
                mutex.lock(kernel);
                while mutex.waiters(kernel).len() < 3 {
                    kernel.schedule();
                }
                mutex.unlock(kernel);
                0
            }))
            .unwrap();

        for n in 1..=3 {
            kernel
                .create_kernel_task(Box::new(move || {
                    mutex.lock(kernel);
                    order.lock().push(n);
                    mutex.unlock(kernel);
                    0
                }))
                .unwrap();
        }

        let run = testutil::start(platform, kernel);
        run.wait_until("all threads done", || kernel.thread_count() == 0);

        assert_eq!(*order.lock(), [1, 2, 3]);
        assert_eq!(mutex.owner(kernel), None);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_handoff_wakes_head_as_owner() {
        let (platform, kernel) =
            testutil::host_kernel(KernelConfig::new().with_preemption(false));
        let mutex: &'static Mutex = leak(Mutex::new());
        let release: &'static AtomicBool = leak(AtomicBool::new(false));
        let owned_on_wake: &'static AtomicBool = leak(AtomicBool::new(false));

        kernel
            .create_kernel_task(Box::new(move || {
                mutex.lock(kernel);
                while !release.load(Ordering::SeqCst) {
                    kernel.schedule();
                }
                mutex.unlock(kernel);
                0
            }))
            .unwrap();
        let waiter = kernel
            .create_kernel_task(Box::new(move || {
                mutex.lock(kernel);
                let me = kernel.current_thread().unwrap().id();
                owned_on_wake.store(mutex.owner(kernel) == Some(me), Ordering::SeqCst);
                mutex.unlock(kernel);
                0
            }))
            .unwrap();
        let waiter = kernel.task_threads(waiter).unwrap()[0];

        let run = testutil::start(platform, kernel);
        run.wait_until("waiter queued", || mutex.waiters(kernel) == [waiter]);
        assert_eq!(kernel.thread_state(waiter), Some(ThreadState::Blocked));

        // A stray wakeup must not let the waiter in
        let thread = kernel.thread(waiter).unwrap();
        kernel.wake_up(&thread);
        run.wait_until("waiter back asleep", || {
            kernel.thread_state(waiter) == Some(ThreadState::Blocked)
        });
        assert_eq!(mutex.waiters(kernel), [waiter]);
        assert_ne!(mutex.owner(kernel), Some(waiter));

        release.store(true, Ordering::SeqCst);
        run.wait_until("all threads done", || kernel.thread_count() == 0);
        assert!(owned_on_wake.load(Ordering::SeqCst));
        assert_eq!(mutex.owner(kernel), None);
        assert!(mutex.waiters(kernel).is_empty());
    }

    #[test]
    fn test_two_writers_never_interleave() {
        let config = KernelConfig::new()
            .with_cpus(2)
            .with_frequencies(1000, 1000, 100);
        let (platform, kernel) = testutil::host_kernel(config);
        let mutex: &'static Mutex = leak(Mutex::new());
        let x: &'static AtomicU64 = leak(AtomicU64::new(0));
        let corrupt: &'static AtomicUsize = leak(AtomicUsize::new(0));

        for value in [1u64, 2] {
            kernel
                .create_kernel_task(Box::new(move || {
                    for i in 0..1000 {
                        mutex.lock(kernel);
                        x.store(value, Ordering::SeqCst);
                        if i % 50 == 0 {
                            platform.tick();
                        }
                        if x.load(Ordering::SeqCst) != value {
                            corrupt.fetch_add(1, Ordering::SeqCst);
                        }
                        mutex.unlock(kernel);
                    }
                    0
                }))
                .unwrap();
        }

        let run = testutil::start(platform, kernel);
        run.wait_until("writers done", || kernel.thread_count() == 0);

        assert_eq!(corrupt.load(Ordering::SeqCst), 0);
        assert!(matches!(x.load(Ordering::SeqCst), 1 | 2));
        assert_eq!(mutex.owner(kernel), None);
        assert!(mutex.waiters(kernel).is_empty());
    }
}

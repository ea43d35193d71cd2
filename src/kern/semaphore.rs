//! Counting Semaphore
//!
//! `up` with sleepers hands its unit to the head waiter instead of bumping
//! the count, so a thread calling `down` in between cannot steal it. A
//! waiter knows it was handed a unit when it is no longer queued.

use alloc::vec::Vec;

use crate::kern::lock::SpinLock;
use crate::kern::sched_prim::WaitQueue;
use crate::kern::startup::{kernel, Kernel};
use crate::kern::thread::ThreadState;
use crate::types::ThreadId;

#[derive(Debug)]
struct SemInner {
    count: usize,
    waiters: WaitQueue,
}

pub struct Semaphore {
    inner: SpinLock<SemInner>,
}

impl Semaphore {
    pub const fn new(count: usize) -> Self {
        Self {
            inner: SpinLock::new(SemInner {
                count,
                waiters: WaitQueue::new(),
            }),
        }
    }

    /// Take a unit, sleeping until one is handed over if none is free
    pub fn down(&self, kernel: &Kernel) {
        let mut inner = self.inner.lock_irqsave(kernel);
        if inner.count > 0 {
            inner.count -= 1;
            return;
        }

        let me = kernel.current_thread().unwrap_or_else(|| {
            panic!("{}: semaphore down without a current thread", kernel.cpu_id())
        });
        loop {
            if !inner.waiters.contains(me.id()) {
                inner.waiters.push(me.clone());
            }
            me.set_state(ThreadState::Blocked);
            drop(inner);

            kernel.schedule();

            inner = self.inner.lock_irqsave(kernel);
            if !inner.waiters.contains(me.id()) {
                // `up` dequeued us along with its unit
                return;
            }
            if inner.count > 0 {
                inner.count -= 1;
                inner.waiters.discard(me.id());
                return;
            }
        }
    }

    /// Take a unit if one is free
    pub fn try_down(&self, kernel: &Kernel) -> bool {
        let mut inner = self.inner.lock_irqsave(kernel);
        if inner.count > 0 {
            inner.count -= 1;
            true
        } else {
            false
        }
    }

    /// Return a unit, waking the longest waiter with it if there is one
    pub fn up(&self, kernel: &Kernel) {
        let mut inner = self.inner.lock_irqsave(kernel);
        match inner.waiters.pop_front() {
            None => inner.count += 1,
            Some(next) => {
                kernel.wake_up(&next);
            }
        }
    }

    pub fn count(&self, kernel: &Kernel) -> usize {
        self.inner.lock_irqsave(kernel).count
    }

    pub fn waiters(&self, kernel: &Kernel) -> Vec<ThreadId> {
        self.inner.lock_irqsave(kernel).waiters.ids()
    }
}

impl core::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Semaphore").finish_non_exhaustive()
    }
}

pub fn sem_down(sem: &Semaphore) {
    sem.down(kernel());
}

pub fn sem_up(sem: &Semaphore) {
    sem.up(kernel());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::kern::testutil;
    use alloc::boxed::Box;
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn leak<T>(value: T) -> &'static T {
        Box::leak(Box::new(value))
    }

    #[test]
    fn test_counting_without_contention() {
        let (_, kernel) = testutil::host_kernel(KernelConfig::new());
        let sem = Semaphore::new(2);
        assert!(sem.try_down(kernel));
        sem.down(kernel);
        assert!(!sem.try_down(kernel));
        assert_eq!(sem.count(kernel), 0);

        sem.up(kernel);
        sem.up(kernel);
        sem.up(kernel);
        assert_eq!(sem.count(kernel), 3);
        assert!(sem.waiters(kernel).is_empty());
    }

    #[test]
    fn test_holders_never_exceed_count() {
        const CAPACITY: usize = 2;
        let config = KernelConfig::new()
            .with_cpus(2)
            .with_frequencies(1000, 1000, 100);
        let (platform, kernel) = testutil::host_kernel(config);
        let sem: &'static Semaphore = leak(Semaphore::new(CAPACITY));
        let inside: &'static AtomicUsize = leak(AtomicUsize::new(0));
        let peak: &'static AtomicUsize = leak(AtomicUsize::new(0));

        for _ in 0..5 {
            kernel
                .create_kernel_task(Box::new(move || {
                    for i in 0..200 {
                        sem.down(kernel);
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        if i % 4 == 0 {
                            platform.tick();
                        }
                        inside.fetch_sub(1, Ordering::SeqCst);
                        sem.up(kernel);
                    }
                    0
                }))
                .unwrap();
        }

        let run = testutil::start(platform, kernel);
        run.wait_until("threads done", || kernel.thread_count() == 0);

        assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
        assert!(peak.load(Ordering::SeqCst) >= 1);
        assert_eq!(sem.count(kernel), CAPACITY);
        assert!(sem.waiters(kernel).is_empty());
    }

    #[test]
    fn test_units_handed_to_waiters_in_arrival_order() {
        let (platform, kernel) =
            testutil::host_kernel(KernelConfig::new().with_preemption(false));
        let sem: &'static Semaphore = leak(Semaphore::new(2));
        let entered: &'static spin::Mutex<Vec<usize>> = leak(spin::Mutex::new(Vec::new()));
        let release: &'static AtomicBool = leak(AtomicBool::new(false));

        let mut ids = Vec::new();
        for n in 1..=5 {
            let task = kernel
                .create_kernel_task(Box::new(move || {
                    sem.down(kernel);
                    entered.lock().push(n);
                    while !release.load(Ordering::SeqCst) {
                        kernel.schedule();
                    }
                    0
                }))
                .unwrap();
            ids.push(kernel.task_threads(task).unwrap()[0]);
        }

        let run = testutil::start(platform, kernel);
        run.wait_until("three waiters queued", || sem.waiters(kernel).len() == 3);
        assert_eq!(*entered.lock(), [1, 2]);
        assert_eq!(sem.waiters(kernel), &ids[2..]);
        assert_eq!(sem.count(kernel), 0);

        for (released, n) in (3..=5).enumerate() {
            sem.up(kernel);
            run.wait_until("waiter enters", || entered.lock().len() == n);
            assert_eq!(entered.lock().last(), Some(&n));
            assert_eq!(sem.waiters(kernel), &ids[3 + released..]);
            assert_eq!(sem.count(kernel), 0);
        }

        release.store(true, Ordering::SeqCst);
        run.wait_until("threads done", || kernel.thread_count() == 0);
        assert_eq!(*entered.lock(), [1, 2, 3, 4, 5]);
        assert_eq!(sem.count(kernel), 0);
    }
}

//! Scheduling Primitives
//!
//! Dispatch (`schedule`, `init_sched`), round-robin selection with idle
//! polling, first-enqueue placement across processors, thread start and
//! finish, and the FIFO wait queues the blocking primitives sleep on.
//!
//! Every suspension goes the same way: the thread marks itself BLOCKED and
//! calls `schedule`. Whoever wakes it flips BLOCKED back to READY and the
//! next scan of its home run queue picks it up.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::KernResult;
use crate::kern::processor::{Processor, ProcessorState};
use crate::kern::runq::{PolicyData, RunqEntry, SchedPolicy};
use crate::kern::startup::{kernel, Kernel};
use crate::kern::task::Task;
use crate::kern::thread::{Thread, ThreadState};
use crate::types::{ProcessorId, ThreadId};

// ============================================================================
// Wait Queue
// ============================================================================

/// FIFO of blocked threads, owned by a mutex or semaphore and protected by
/// that primitive's spinlock
#[derive(Debug, Default)]
pub struct WaitQueue {
    waiters: VecDeque<Arc<Thread>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    /// Append a waiter. A thread already queued is left where it is.
    pub fn push(&mut self, thread: Arc<Thread>) -> bool {
        if self.contains(thread.id()) {
            log::warn!("{} already in wait queue", thread.id());
            return false;
        }
        self.waiters.push_back(thread);
        true
    }

    /// Remove a waiter wherever it sits. Warns if it is not queued.
    pub fn remove(&mut self, id: ThreadId) -> bool {
        if self.discard(id) {
            true
        } else {
            log::warn!("{} not in wait queue", id);
            false
        }
    }

    /// Remove a waiter if present, silently
    pub(crate) fn discard(&mut self, id: ThreadId) -> bool {
        match self.waiters.iter().position(|t| t.id() == id) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn front(&self) -> Option<&Arc<Thread>> {
        self.waiters.front()
    }

    pub fn pop_front(&mut self) -> Option<Arc<Thread>> {
        self.waiters.pop_front()
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.waiters.iter().any(|t| t.id() == id)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Waiter ids in queue order
    pub fn ids(&self) -> Vec<ThreadId> {
        self.waiters.iter().map(|t| t.id()).collect()
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Where a run-queue scan begins
#[derive(Debug, Clone, Copy)]
enum ScanStart {
    /// Just past the given thread's entry, which must be queued
    After(ThreadId),
    /// At a slot index
    At(usize),
}

impl Kernel {
    /// The thread running on this processor
    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.current_processor().current(self)
    }

    /// The task owning the thread running on this processor
    pub fn current_task(&self) -> Option<Arc<Task>> {
        self.current_thread().and_then(|t| self.task(t.task()))
    }

    pub fn current_thread_on(&self, cpu: ProcessorId) -> KernResult<Option<Arc<Thread>>> {
        Ok(self.processor(cpu)?.current(self))
    }

    /// Pick the next READY thread on this processor and switch to it.
    ///
    /// The caller may be the running thread yielding or blocking, or the
    /// timer path. Returns when the calling thread is dispatched again.
    pub fn schedule(&self) {
        let cpu = self.current_processor();
        let depth = cpu.preempt_depth();
        if depth != 0 {
            panic!(
                "{}: schedule() with preemption disabled (depth {})",
                cpu.id(),
                depth
            );
        }

        let flags = self.platform().save_and_disable_interrupts();
        cpu.preempt_disable();

        let prev = cpu.current(self);
        let start = match &prev {
            Some(prev) => ScanStart::After(prev.id()),
            None => ScanStart::At(0),
        };
        let next = self.pick_next(cpu, start);
        cpu.set_current(self, next.clone());

        match prev {
            Some(prev) if Arc::ptr_eq(&prev, &next) => {}
            Some(prev) => {
                cpu.count_dispatch();
                unsafe { self.platform().switch_context(&prev, &next) };
            }
            None => {
                // No context to come back to. `next` re-enables preemption
                // and interrupts as it starts or resumes.
                cpu.count_dispatch();
                unsafe { self.platform().switch_initial(&next) };
                return;
            }
        }

        // Resumed; threads never leave their home processor.
        cpu.preempt_enable();
        self.platform().restore_interrupts(flags);
    }

    /// First dispatch on this processor.
    ///
    /// Never returns on hardware. An empty run queue here is fatal.
    pub fn init_sched(&self) {
        let cpu = self.current_processor();
        if !cpu.is_online() {
            panic!("{}: init_sched on an offline processor", cpu.id());
        }

        self.platform().disable_interrupts();
        cpu.preempt_disable();

        let first = {
            let rq = cpu.runq().lock_irqsave(self);
            let found = rq
                .next_ready_from(0)
                .and_then(|idx| rq.get(idx))
                .map(|e| e.thread().clone());
            found.unwrap_or_else(|| {
                panic!(
                    "{}: init_sched with nothing runnable, run queue {:?}",
                    cpu.id(),
                    rq.summary()
                )
            })
        };

        cpu.set_current(self, first.clone());
        cpu.set_preemption(self.config().preemption);
        cpu.count_dispatch();
        log::info!("{}: scheduler started with {}", cpu.id(), first.id());

        unsafe { self.platform().switch_initial(&first) };
    }

    fn pick_next(&self, cpu: &Processor, start: ScanStart) -> Arc<Thread> {
        match cpu.policy() {
            SchedPolicy::RoundRobin => self.pick_round_robin(cpu, start),
            SchedPolicy::Priority => {
                panic!("{}: priority scheduling selected but not implemented", cpu.id())
            }
        }
    }

    fn pick_round_robin(&self, cpu: &Processor, start: ScanStart) -> Arc<Thread> {
        loop {
            {
                let rq = cpu.runq().lock_irqsave(self);
                let found = match start {
                    ScanStart::After(id) => rq.next_ready_after(id).unwrap_or_else(|| {
                        panic!(
                            "{}: current {} missing from run queue {:?}",
                            cpu.id(),
                            id,
                            rq.summary()
                        )
                    }),
                    ScanStart::At(slot) => rq.next_ready_from(slot),
                };

                if let Some(thread) = found.and_then(|idx| rq.get(idx)).map(|e| e.thread()) {
                    return thread.clone();
                }
            }

            self.idle_wait(cpu);
        }
    }

    /// One round of idling with interrupts enabled so ticks and wakeups
    /// can land. The caller's interrupt state is restored afterwards.
    fn idle_wait(&self, cpu: &Processor) {
        let flags = self.platform().save_and_disable_interrupts();
        cpu.set_state(ProcessorState::Idle);

        self.platform().enable_interrupts();
        self.platform().wait_for_interrupt();
        self.platform().disable_interrupts();

        cpu.set_state(ProcessorState::Running);
        self.platform().restore_interrupts(flags);
    }

    /// Switch the policy tag of a processor
    pub fn set_policy(&self, cpu: ProcessorId, policy: SchedPolicy) -> KernResult<()> {
        self.processor(cpu)?.set_policy(policy);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sleep and wakeup
    // ------------------------------------------------------------------

    /// Mark the running thread BLOCKED. It keeps running until it calls
    /// `schedule`.
    pub(crate) fn block_current(&self) -> Arc<Thread> {
        let thread = self.current_thread().unwrap_or_else(|| {
            panic!("{}: cannot block without a current thread", self.cpu_id())
        });
        thread.set_state(ThreadState::Blocked);
        thread
    }

    /// BLOCKED -> READY
    pub fn wake_up(&self, thread: &Thread) -> bool {
        let woke = thread.wake();
        if !woke {
            log::debug!("wakeup of {} in state {:?}", thread.id(), thread.state());
        }
        woke
    }

    // ------------------------------------------------------------------
    // Enqueue and placement
    // ------------------------------------------------------------------

    /// Processor with the fewest queued threads, ties going to the one
    /// with fewest READY threads, then the lowest id
    pub fn least_loaded_processor(&self) -> ProcessorId {
        self.processors()
            .filter(|p| p.is_online())
            .map(|p| (p.load(self), p.id()))
            .min_by_key(|&((queued, ready), id)| (queued, ready, id))
            .map(|(_, id)| id)
            .unwrap_or_else(|| self.cpu_id())
    }

    /// Queue a fresh thread on its home processor, choosing the home on
    /// first enqueue. The thread becomes READY.
    pub fn add_thread_to_rq(&self, thread: &Arc<Thread>) -> KernResult<()> {
        if thread.state() != ThreadState::Init {
            panic!("{} enqueued in state {:?}", thread.id(), thread.state());
        }

        let target = match thread.home() {
            Some(home) => home,
            None => self.least_loaded_processor(),
        };
        let cpu = self.processor(target)?;

        let mut rq = cpu.runq().lock_irqsave(self);
        let slice = self.config().rr_slice;
        rq.push(RunqEntry::new(
            thread.clone(),
            PolicyData::for_policy(cpu.policy(), slice),
        ))?;
        thread.settle_on(target);
        thread.transition(ThreadState::Init, ThreadState::Ready);
        drop(rq);

        log::debug!("{} queued on {}", thread.id(), target);
        Ok(())
    }

    pub fn queued_threads(&self, cpu: ProcessorId) -> KernResult<usize> {
        Ok(self.processor(cpu)?.load(self).0)
    }

    pub fn ready_threads(&self, cpu: ProcessorId) -> KernResult<usize> {
        Ok(self.processor(cpu)?.load(self).1)
    }

    /// Context switches performed on a processor
    pub fn dispatch_count(&self, cpu: ProcessorId) -> KernResult<u64> {
        Ok(self.processor(cpu)?.dispatches())
    }

    // ------------------------------------------------------------------
    // Thread start and finish
    // ------------------------------------------------------------------

    /// Tear down the running thread after its entry returned and switch
    /// to the next runnable thread. Does not return on hardware.
    pub(crate) fn finish_thread(&self, thread: Arc<Thread>, code: i32) {
        let cpu = self.current_processor();
        self.platform().disable_interrupts();
        cpu.preempt_disable();

        thread.set_exit_code(code);
        thread.set_state(ThreadState::Complete);

        let slot = {
            let mut rq = cpu.runq().lock_irqsave(self);
            let slot = rq.position(thread.id()).unwrap_or_else(|| {
                panic!(
                    "{}: finishing {} missing from run queue {:?}",
                    cpu.id(),
                    thread.id(),
                    rq.summary()
                )
            });
            rq.remove_at(slot);
            slot
        };

        self.retire_thread(&thread);
        log::debug!("{} finished with code {}", thread.id(), code);

        let next = self.pick_next(cpu, ScanStart::At(slot));
        cpu.set_current(self, next.clone());
        cpu.count_dispatch();

        unsafe { self.platform().exit_context(&thread, &next) };
    }
}

/// First code a new thread runs, reached from the initial context with
/// the kernel pointer and the thread id
pub(crate) extern "C-unwind" fn thread_trampoline(kernel: usize, thread: usize) {
    // SAFETY: the context was built by `Kernel::spawn_thread` with the
    // address of a kernel that outlives its threads.
    let kernel = unsafe { &*(kernel as *const Kernel) };
    let id = ThreadId(thread as u64);
    let thread = kernel
        .thread(id)
        .unwrap_or_else(|| panic!("{} started but not registered", id));

    kernel.preempt_enable();
    kernel.platform().enable_interrupts();

    let entry = thread
        .take_entry()
        .unwrap_or_else(|| panic!("{} started twice", id));
    let code = entry();

    kernel.finish_thread(thread, code);
}

// ============================================================================
// Compatibility Functions
// ============================================================================

/// Reschedule on the executing processor
pub fn schedule() {
    kernel().schedule();
}

/// First dispatch on the executing processor
pub fn init_sched() {
    kernel().init_sched();
}

pub fn current_thread() -> Option<Arc<Thread>> {
    kernel().current_thread()
}

pub fn current_task() -> Option<Arc<Task>> {
    kernel().current_task()
}

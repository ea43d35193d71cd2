//! Processor Management
//!
//! One [`Processor`] per physical CPU, held in a fixed-size table owned by
//! the kernel and indexed by [`ProcessorId`]. Each carries its run queue,
//! current thread, policy tag and preemption state.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use heapless::HistoryBuffer;

use crate::kern::lock::SpinLock;
use crate::kern::runq::{RunQueue, SchedPolicy};
use crate::kern::startup::Kernel;
use crate::kern::thread::{Thread, ThreadState};
use crate::types::{ProcessorId, ThreadId};

/// Scheduling decisions remembered per processor
pub const SELECTION_HISTORY: usize = 64;

// ============================================================================
// Processor State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProcessorState {
    /// Not brought up yet
    OffLine = 0,
    /// Running threads
    Running = 1,
    /// Polling for a READY thread with interrupts enabled
    Idle = 2,
}

impl ProcessorState {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Idle,
            _ => Self::OffLine,
        }
    }
}

// ============================================================================
// Processor
// ============================================================================

pub struct Processor {
    id: ProcessorId,
    state: AtomicU32,
    boot: AtomicBool,
    /// Timer ticks may call the scheduler
    preempt_on: AtomicBool,
    /// Nesting depth of preemption-disabled sections
    preempt_depth: AtomicUsize,
    policy: AtomicU8,
    runq: SpinLock<RunQueue>,
    current: SpinLock<Option<Arc<Thread>>>,
    local_ticks: AtomicU32,
    dispatches: AtomicU64,
    selections: SpinLock<HistoryBuffer<(ThreadId, ThreadState), SELECTION_HISTORY>>,
}

impl Processor {
    pub fn new(id: ProcessorId, policy: SchedPolicy) -> Self {
        Self {
            id,
            state: AtomicU32::new(ProcessorState::OffLine as u32),
            boot: AtomicBool::new(false),
            preempt_on: AtomicBool::new(false),
            preempt_depth: AtomicUsize::new(0),
            policy: AtomicU8::new(policy as u8),
            runq: SpinLock::new(RunQueue::new()),
            current: SpinLock::new(None),
            local_ticks: AtomicU32::new(0),
            dispatches: AtomicU64::new(0),
            selections: SpinLock::new(HistoryBuffer::new()),
        }
    }

    pub fn id(&self) -> ProcessorId {
        self.id
    }

    pub fn state(&self) -> ProcessorState {
        ProcessorState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ProcessorState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub fn is_online(&self) -> bool {
        self.state() != ProcessorState::OffLine
    }

    pub fn is_boot(&self) -> bool {
        self.boot.load(Ordering::Acquire)
    }

    /// Bring the processor into the system. Returns false if it was
    /// already online.
    pub(crate) fn start(&self, boot: bool) -> bool {
        let started = self
            .state
            .compare_exchange(
                ProcessorState::OffLine as u32,
                ProcessorState::Running as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if started && boot {
            self.boot.store(true, Ordering::Release);
        }
        started
    }

    // ------------------------------------------------------------------
    // Preemption
    // ------------------------------------------------------------------

    pub fn preempt_disable(&self) {
        self.preempt_depth.fetch_add(1, Ordering::AcqRel);
    }

    pub fn preempt_enable(&self) {
        let prev = self.preempt_depth.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            panic!("{}: preempt_enable without matching disable", self.id);
        }
    }

    pub fn preempt_depth(&self) -> usize {
        self.preempt_depth.load(Ordering::Acquire)
    }

    pub fn preemption_enabled(&self) -> bool {
        self.preempt_on.load(Ordering::Acquire)
    }

    pub fn set_preemption(&self, on: bool) {
        self.preempt_on.store(on, Ordering::Release);
    }

    /// Whether a timer tick may switch threads right now
    pub fn preemptible(&self) -> bool {
        self.preemption_enabled() && self.preempt_depth() == 0
    }

    // ------------------------------------------------------------------
    // Scheduling state
    // ------------------------------------------------------------------

    pub fn policy(&self) -> SchedPolicy {
        SchedPolicy::from_u8(self.policy.load(Ordering::Acquire))
    }

    pub fn set_policy(&self, policy: SchedPolicy) {
        self.policy.store(policy as u8, Ordering::Release);
    }

    pub(crate) fn runq(&self) -> &SpinLock<RunQueue> {
        &self.runq
    }

    pub fn current(&self, kernel: &Kernel) -> Option<Arc<Thread>> {
        self.current.lock_irqsave(kernel).clone()
    }

    pub(crate) fn set_current(&self, kernel: &Kernel, thread: Arc<Thread>) {
        let state = thread.state();
        let id = thread.id();
        *self.current.lock_irqsave(kernel) = Some(thread);
        self.selections.lock_irqsave(kernel).write((id, state));
    }

    /// Record a context switch
    pub(crate) fn count_dispatch(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dispatches(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }

    /// Most recent selections, oldest first, with the state each thread
    /// had when picked
    pub fn recent_selections(&self, kernel: &Kernel) -> Vec<(ThreadId, ThreadState)> {
        self.selections
            .lock_irqsave(kernel)
            .oldest_ordered()
            .copied()
            .collect()
    }

    /// Advance the local tick count, returning the new value
    pub(crate) fn tick(&self) -> u32 {
        self.local_ticks
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1)
    }

    pub fn local_ticks(&self) -> u32 {
        self.local_ticks.load(Ordering::Acquire)
    }

    /// (queued, ready) thread counts used for placement
    pub fn load(&self, kernel: &Kernel) -> (usize, usize) {
        let rq = self.runq.lock_irqsave(kernel);
        (rq.len(), rq.ready_count())
    }
}

impl core::fmt::Debug for Processor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("boot", &self.is_boot())
            .field("preempt_on", &self.preemption_enabled())
            .field("preempt_depth", &self.preempt_depth())
            .field("policy", &self.policy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processor_bring_up() {
        let cpu = Processor::new(ProcessorId(1), SchedPolicy::RoundRobin);
        assert_eq!(cpu.state(), ProcessorState::OffLine);
        assert!(!cpu.is_online());

        assert!(cpu.start(false));
        assert!(!cpu.start(true));
        assert!(cpu.is_online());
        assert!(!cpu.is_boot());
    }

    #[test]
    fn test_preemption_nesting() {
        let cpu = Processor::new(ProcessorId(0), SchedPolicy::RoundRobin);
        assert!(!cpu.preemptible());

        cpu.set_preemption(true);
        assert!(cpu.preemptible());

        cpu.preempt_disable();
        cpu.preempt_disable();
        assert!(!cpu.preemptible());
        cpu.preempt_enable();
        assert!(!cpu.preemptible());
        cpu.preempt_enable();
        assert!(cpu.preemptible());
    }

    #[test]
    #[should_panic(expected = "without matching disable")]
    fn test_preempt_underflow_panics() {
        let cpu = Processor::new(ProcessorId(0), SchedPolicy::RoundRobin);
        cpu.preempt_enable();
    }

    #[test]
    fn test_local_tick_wraps() {
        let cpu = Processor::new(ProcessorId(0), SchedPolicy::RoundRobin);
        cpu.local_ticks.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(cpu.tick(), 0);
        assert_eq!(cpu.tick(), 1);
    }

    #[test]
    fn test_policy_tag() {
        let cpu = Processor::new(ProcessorId(0), SchedPolicy::RoundRobin);
        cpu.set_policy(SchedPolicy::Priority);
        assert_eq!(cpu.policy(), SchedPolicy::Priority);
    }
}

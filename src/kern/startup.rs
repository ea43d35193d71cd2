//! Kernel Startup
//!
//! [`Kernel`] ties the subsystems together: the platform, the processor
//! table, the task and thread registries and the global tick count. Boot
//! code builds one with [`setup_main`], which also publishes it for the
//! free-function API ([`kernel`]).
//!
//! ## Startup Sequence
//!
//! 1. Early init (logging)
//! 2. Scheduler structures (processor table, boot processor online)
//! 3. Timer handler installed
//! 4. Boot code creates the init task and calls `init_sched` on each processor

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::arch::Platform;
use crate::config::{KernelConfig, MAX_CPUS};
use crate::error::{KernError, KernResult};
use crate::kern::lock::SpinLock;
use crate::kern::processor::Processor;
use crate::kern::task::Task;
use crate::kern::thread::Thread;
use crate::types::{ProcessorId, TaskId, ThreadId};

// ============================================================================
// Boot State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StartupPhase {
    NotStarted = 0,
    /// Console and logger ready
    EarlyInit = 1,
    /// Processor table built, boot processor online
    SchedInit = 2,
    /// Tick handler registered
    TimerInit = 3,
    /// Kernel published and usable
    Running = 4,
}

impl StartupPhase {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::EarlyInit,
            2 => Self::SchedInit,
            3 => Self::TimerInit,
            4 => Self::Running,
            _ => Self::NotStarted,
        }
    }
}

// ============================================================================
// Kernel
// ============================================================================

pub struct Kernel {
    platform: &'static dyn Platform,
    config: KernelConfig,
    processors: heapless::Vec<Processor, MAX_CPUS>,
    pub(crate) tasks: SpinLock<BTreeMap<TaskId, Arc<Task>>>,
    pub(crate) threads: SpinLock<BTreeMap<ThreadId, Arc<Thread>>>,
    next_task: AtomicU64,
    next_thread: AtomicU64,
    next_space: AtomicU64,
    pub(crate) ticks: AtomicU32,
    phase: AtomicU32,
}

impl Kernel {
    /// Build a kernel with every processor offline
    pub fn new(platform: &'static dyn Platform, config: KernelConfig) -> KernResult<Self> {
        config.validate()?;

        let mut processors = heapless::Vec::new();
        for i in 0..config.cpus {
            processors
                .push(Processor::new(ProcessorId(i), config.policy))
                .map_err(|_| KernError::InvalidConfig("cpus"))?;
        }

        Ok(Self {
            platform,
            config,
            processors,
            tasks: SpinLock::new(BTreeMap::new()),
            threads: SpinLock::new(BTreeMap::new()),
            next_task: AtomicU64::new(1),
            next_thread: AtomicU64::new(1),
            next_space: AtomicU64::new(1),
            ticks: AtomicU32::new(0),
            phase: AtomicU32::new(StartupPhase::NotStarted as u32),
        })
    }

    pub fn platform(&self) -> &'static dyn Platform {
        self.platform
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn phase(&self) -> StartupPhase {
        StartupPhase::from_u32(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: StartupPhase) {
        self.phase.store(phase as u32, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Processors
    // ------------------------------------------------------------------

    /// Identity of the executing processor
    pub fn cpu_id(&self) -> ProcessorId {
        ProcessorId(self.platform.cpu_id())
    }

    pub fn current_processor(&self) -> &Processor {
        let id = self.cpu_id();
        self.processors.get(id.0).unwrap_or_else(|| {
            panic!(
                "{} outside the processor table ({} slots)",
                id,
                self.processors.len()
            )
        })
    }

    pub fn processor(&self, id: ProcessorId) -> KernResult<&Processor> {
        self.processors.get(id.0).ok_or(KernError::NoSuchProcessor(id))
    }

    pub fn processors(&self) -> impl Iterator<Item = &Processor> {
        self.processors.iter()
    }

    pub fn preempt_disable(&self) {
        self.current_processor().preempt_disable();
    }

    pub fn preempt_enable(&self) {
        self.current_processor().preempt_enable();
    }

    /// Bring the executing processor online as the boot processor
    pub fn init_boot_processor(&self) -> KernResult<()> {
        let cpu = self.processor(self.cpu_id())?;
        if cpu.start(true) {
            log::info!("{}: boot processor online", cpu.id());
        }
        Ok(())
    }

    /// Bring an application processor online so placement considers it
    pub fn processor_up(&self, id: ProcessorId) -> KernResult<()> {
        let cpu = self.processor(id)?;
        if cpu.start(false) {
            log::info!("{}: online", id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Registries
    // ------------------------------------------------------------------

    pub(crate) fn alloc_task_id(&self) -> TaskId {
        TaskId(self.next_task.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn alloc_thread_id(&self) -> ThreadId {
        ThreadId(self.next_thread.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn alloc_space(&self) -> u64 {
        self.next_space.fetch_add(1, Ordering::Relaxed)
    }

    pub fn thread(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.threads.lock_irqsave(self).get(&id).cloned()
    }

    pub fn task(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.lock_irqsave(self).get(&id).cloned()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock_irqsave(self).len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock_irqsave(self).len()
    }

    // ------------------------------------------------------------------
    // Timer
    // ------------------------------------------------------------------

    /// Route the platform's tick interrupt to [`Kernel::timer_interrupt`]
    pub fn install_timer(&'static self) -> KernResult<()> {
        self.platform
            .register_timer_handler(Box::new(move || self.timer_interrupt()))
    }
}

// ============================================================================
// Main Startup Entry Point
// ============================================================================

static KERNEL: spin::Once<&'static Kernel> = spin::Once::new();

/// Build and publish the kernel.
///
/// Called once from boot code on the boot processor. Application
/// processors then call [`Kernel::processor_up`] for themselves, and every
/// processor eventually enters `init_sched`.
pub fn setup_main(
    platform: &'static dyn Platform,
    config: KernelConfig,
) -> KernResult<&'static Kernel> {
    if KERNEL.is_completed() {
        return Err(KernError::AlreadyInitialized);
    }

    crate::console::init_logging(log::LevelFilter::Info);

    let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new(platform, config)?));
    kernel.set_phase(StartupPhase::EarlyInit);

    kernel.init_boot_processor()?;
    kernel.set_phase(StartupPhase::SchedInit);

    kernel.install_timer()?;
    kernel.set_phase(StartupPhase::TimerInit);

    let mut published = false;
    KERNEL.call_once(|| {
        published = true;
        kernel
    });
    if !published {
        return Err(KernError::AlreadyInitialized);
    }

    kernel.set_phase(StartupPhase::Running);
    log::info!(
        "kernel up: {} cpus, tick {} Hz, sched {} Hz, alarm {} Hz",
        config.cpus,
        config.tick_hz,
        config.sched_hz,
        config.alarm_hz
    );
    Ok(kernel)
}

/// The kernel published by [`setup_main`]
pub fn kernel() -> &'static Kernel {
    match KERNEL.get() {
        Some(kernel) => kernel,
        None => panic!("kernel used before setup_main"),
    }
}

/// Whether [`setup_main`] has completed
pub fn kernel_ready() -> bool {
    KERNEL.is_completed()
}

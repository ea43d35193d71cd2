//! Kern subsystem - scheduling and synchronization core
//!
//! Contains the processor table, run queues and dispatcher, the task and
//! thread model, the locking primitives and the tick-driven timer.

pub mod lock;
pub mod mutex;
pub mod processor;
pub mod runq;
pub mod sched_prim;
pub mod semaphore;
pub mod startup;
pub mod task;
pub mod thread;
pub mod timer;

#[cfg(test)]
pub(crate) mod testutil;

pub use lock::{acquire_raw, release_raw, RawLock, SpinLock, SpinLockGuard};
pub use mutex::{mutex_lock, mutex_unlock, Mutex};
pub use processor::{Processor, ProcessorState};
pub use runq::{PolicyData, RunQueue, RunqEntry, SchedPolicy};
pub use sched_prim::{current_task, current_thread, init_sched, schedule, WaitQueue};
pub use semaphore::{sem_down, sem_up, Semaphore};
pub use startup::{kernel, kernel_ready, setup_main, Kernel, StartupPhase};
pub use task::{create_kernel_task, create_task, create_thread, Task, TaskState};
pub use thread::{with_arg, Thread, ThreadEntry, ThreadState};
pub use timer::{alarm_span, pause, time_after, time_before, Alarm, Ticks, MAX_ALARM_TICKS};

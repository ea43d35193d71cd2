//! mpkern - multiprocessor scheduling and synchronization core
//!
//! Per-processor round-robin run queues with least-loaded placement, a
//! task/thread lifecycle, spinlocks, sleeping mutexes and semaphores with
//! FIFO handoff, and a tick-driven timer with polled alarms.
//!
//! The machine is reached through [`arch::Platform`]. A bare-metal x86_64
//! backend is included; the `std` feature (and every test build) adds a
//! hosted simulator that runs each simulated processor on OS threads.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Run queue and registry sizes are reported as plain lengths
#![allow(clippy::len_without_is_empty)]

// Standard library replacement for no_std
extern crate alloc;

// Core types
pub mod config;
pub mod error;
pub mod types;

pub mod arch;
pub mod console;
pub mod kern;
pub mod panic;

pub use config::KernelConfig;
pub use error::{KernError, KernResult};
pub use kern::{
    create_kernel_task, create_task, create_thread, current_task, current_thread, init_sched,
    kernel, mutex_lock, mutex_unlock, pause, schedule, sem_down, sem_up, setup_main, Kernel,
    Mutex, Semaphore, SpinLock,
};
pub use types::{AddressSpace, ProcessorId, TaskId, ThreadId};

/// Kernel version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "mpkern";

#[cfg(all(target_os = "none", feature = "panic-handler"))]
#[panic_handler]
fn on_panic(info: &core::panic::PanicInfo) -> ! {
    let platform = if kern::kernel_ready() {
        Some(kern::kernel().platform())
    } else {
        None
    };
    panic::kernel_panic(info, platform)
}

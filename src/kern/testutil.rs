//! Hosted kernels for unit tests

use std::boxed::Box;
use std::time::{Duration, Instant};

use crate::arch::hosted::HostPlatform;
use crate::config::KernelConfig;
use crate::kern::startup::Kernel;
use crate::types::ProcessorId;

const WAIT_LIMIT: Duration = Duration::from_secs(30);

/// A kernel with `config.cpus` online processors and one extra offline
/// slot that the test thread itself runs as. Nothing is published through
/// `setup_main`, so tests stay independent.
pub(crate) fn host_kernel(config: KernelConfig) -> (&'static HostPlatform, &'static Kernel) {
    let cpus = config.cpus;
    let platform: &'static HostPlatform = Box::leak(Box::new(HostPlatform::with_observer(cpus)));
    let kernel: &'static Kernel = Box::leak(Box::new(
        Kernel::new(platform, config.with_cpus(cpus + 1)).unwrap(),
    ));

    platform
        .run_on(0, move || kernel.init_boot_processor())
        .join()
        .unwrap()
        .unwrap();
    for cpu in 1..cpus {
        kernel.processor_up(ProcessorId(cpu)).unwrap();
    }
    kernel.install_timer().unwrap();
    (platform, kernel)
}

/// Threads running on a hosted kernel. Dropping it shuts the platform down.
pub(crate) struct HostRun {
    platform: &'static HostPlatform,
}

/// Enter `init_sched` on every online processor that has work queued
pub(crate) fn start(platform: &'static HostPlatform, kernel: &'static Kernel) -> HostRun {
    let busy: std::vec::Vec<_> = kernel
        .processors()
        .filter(|p| p.is_online() && p.load(kernel).0 > 0)
        .map(|p| p.id())
        .collect();
    for cpu in busy {
        platform
            .run_on(cpu.0, move || kernel.init_sched())
            .join()
            .unwrap();
    }
    HostRun { platform }
}

impl HostRun {
    /// Poll `cond` until it holds, failing the test if a kernel thread
    /// panicked or the wait runs too long
    pub(crate) fn wait_until(&self, what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + WAIT_LIMIT;
        loop {
            let failures = self.platform.failures();
            if !failures.is_empty() {
                panic!("kernel thread failed while waiting for {}: {:?}", what, failures);
            }
            if cond() {
                return;
            }
            if Instant::now() > deadline {
                panic!("timed out waiting for {}", what);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for HostRun {
    fn drop(&mut self) {
        self.platform.shutdown();
    }
}

//! Hosted platform
//!
//! Simulates a multiprocessor on OS threads so the scheduling core runs
//! unmodified under `cargo test` or with the `std` feature.
//!
//! Every kernel thread gets its own OS thread, started lazily on its first
//! dispatch. A per-thread baton makes sure only the thread a simulated
//! processor switched to is running on it: a switch grants the incoming
//! baton and then parks on the outgoing one. Interrupt flags are tracked per
//! simulated processor, and idling delivers a simulated timer tick.
//!
//! OS threads that were not started through the platform act as a default
//! processor. [`HostPlatform::with_observer`] makes that an extra slot so
//! test code can inspect the kernel without touching the state of the
//! processors that run threads.

use std::boxed::Box;
use std::cell::Cell;
use std::collections::HashMap;
use std::string::{String, ToString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use std::vec::Vec;

use super::{IrqFlags, Platform, TimerHandler};
use crate::error::{KernError, KernResult};
use crate::kern::thread::Thread;
use crate::types::ThreadId;

std::thread_local! {
    static CPU: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Payload used to unwind parked threads when the platform shuts down
#[derive(Debug)]
pub struct HostShutdown;

const PARK_POLL: Duration = Duration::from_millis(20);
const IDLE_NAP: Duration = Duration::from_micros(50);

/// Run permission for one kernel thread
struct Baton {
    granted: Mutex<bool>,
    cv: Condvar,
    started: AtomicBool,
}

impl Baton {
    fn new() -> Self {
        Self {
            granted: Mutex::new(false),
            cv: Condvar::new(),
            started: AtomicBool::new(false),
        }
    }

    fn grant(&self) {
        let mut granted = self.granted.lock().unwrap_or_else(|e| e.into_inner());
        *granted = true;
        self.cv.notify_one();
    }

    fn wait(&self, shared: &Shared) {
        let mut granted = self.granted.lock().unwrap_or_else(|e| e.into_inner());
        while !*granted {
            if shared.shutdown.load(Ordering::Acquire) {
                drop(granted);
                std::panic::resume_unwind(Box::new(HostShutdown));
            }
            granted = self
                .cv
                .wait_timeout(granted, PARK_POLL)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        *granted = false;
    }
}

struct Shared {
    irq: Vec<AtomicBool>,
    batons: Mutex<HashMap<ThreadId, Arc<Baton>>>,
    shutdown: AtomicBool,
    failures: Mutex<Vec<String>>,
}

/// Simulated multiprocessor
pub struct HostPlatform {
    shared: Arc<Shared>,
    default_cpu: usize,
    timer: spin::Once<TimerHandler>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl HostPlatform {
    /// Platform whose unbound OS threads act as processor 0
    pub fn new(cpus: usize) -> Self {
        Self::build(cpus, 0)
    }

    /// Platform with `cpus` processors plus one more, used by unbound OS
    /// threads
    pub fn with_observer(cpus: usize) -> Self {
        Self::build(cpus + 1, cpus)
    }

    fn build(slots: usize, default_cpu: usize) -> Self {
        Self {
            default_cpu,
            shared: Arc::new(Shared {
                irq: (0..slots).map(|_| AtomicBool::new(false)).collect(),
                batons: Mutex::new(HashMap::new()),
                shutdown: AtomicBool::new(false),
                failures: Mutex::new(Vec::new()),
            }),
            timer: spin::Once::new(),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Run `f` on a fresh OS thread acting as processor `cpu`
    pub fn run_on<F, T>(&self, cpu: usize, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        std::thread::spawn(move || {
            CPU.with(|c| c.set(Some(cpu)));
            f()
        })
    }

    /// Deliver one timer tick on the calling processor
    pub fn tick(&self) {
        if let Some(handler) = self.timer.get() {
            handler();
        }
    }

    /// Unwind every parked or idling kernel thread
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let batons: Vec<_> = self
            .shared
            .batons
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for baton in batons {
            baton.cv.notify_all();
        }

        let handles = core::mem::take(&mut *self.threads.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Panic messages of kernel threads that died
    pub fn failures(&self) -> Vec<String> {
        self.shared
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn baton(&self, id: ThreadId) -> Arc<Baton> {
        self.shared
            .batons
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id)
            .or_insert_with(|| Arc::new(Baton::new()))
            .clone()
    }

    fn check_shutdown(&self) {
        if self.is_shut_down() {
            std::panic::resume_unwind(Box::new(HostShutdown));
        }
    }

    /// Hand the current processor to `next`, starting its OS thread on
    /// first dispatch
    fn dispatch(&self, next: &Thread) {
        let baton = self.baton(next.id());

        if !baton.started.swap(true, Ordering::AcqRel) {
            let cpu = self.cpu_id();
            let (routine, arg0, arg1) = next.context().start_routine();
            let shared = self.shared.clone();
            let parked = baton.clone();

            let handle = std::thread::spawn(move || {
                CPU.with(|c| c.set(Some(cpu)));
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    parked.wait(&shared);
                    // SAFETY: the kernel built this context with a
                    // `extern "C-unwind" fn(usize, usize)` start routine.
                    let start: extern "C-unwind" fn(usize, usize) =
                        unsafe { core::mem::transmute(routine) };
                    start(arg0, arg1);
                }));

                if let Err(payload) = result {
                    if !payload.is::<HostShutdown>() {
                        let msg = payload
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "kernel thread panicked".to_string());
                        shared
                            .failures
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(msg);
                    }
                }
            });
            self.threads
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(handle);
        }

        baton.grant();
    }
}

impl Drop for HostPlatform {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
    }
}

impl Platform for HostPlatform {
    fn cpu_id(&self) -> usize {
        CPU.with(|c| c.get()).unwrap_or(self.default_cpu)
    }

    fn interrupts_enabled(&self) -> bool {
        self.shared.irq[self.cpu_id()].load(Ordering::Acquire)
    }

    fn enable_interrupts(&self) {
        self.shared.irq[self.cpu_id()].store(true, Ordering::Release);
    }

    fn disable_interrupts(&self) {
        self.shared.irq[self.cpu_id()].store(false, Ordering::Release);
    }

    fn save_and_disable_interrupts(&self) -> IrqFlags {
        let was = self.shared.irq[self.cpu_id()].swap(false, Ordering::AcqRel);
        IrqFlags(was as usize)
    }

    fn restore_interrupts(&self, flags: IrqFlags) {
        self.shared.irq[self.cpu_id()].store(flags.0 != 0, Ordering::Release);
    }

    fn wait_for_interrupt(&self) {
        self.check_shutdown();
        std::thread::sleep(IDLE_NAP);
        if self.interrupts_enabled() {
            self.tick();
        }
    }

    fn register_timer_handler(&self, handler: TimerHandler) -> KernResult<()> {
        let mut installed = false;
        self.timer.call_once(|| {
            installed = true;
            handler
        });
        if installed {
            Ok(())
        } else {
            Err(KernError::TimerBusy)
        }
    }

    fn start_address(&self) -> usize {
        // Hosted threads call the start routine directly.
        0
    }

    unsafe fn switch_context(&self, prev: &Thread, next: &Thread) {
        let parked = self.baton(prev.id());
        self.dispatch(next);
        parked.wait(&self.shared);
    }

    unsafe fn switch_initial(&self, next: &Thread) {
        self.dispatch(next);
    }

    unsafe fn exit_context(&self, dead: &Thread, next: &Thread) {
        self.dispatch(next);
        self.shared
            .batons
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&dead.id());
    }

    fn halt(&self) -> ! {
        loop {
            self.check_shutdown();
            std::thread::sleep(PARK_POLL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_interrupt_flags_are_per_cpu() {
        let platform = Arc::new(HostPlatform::new(2));

        platform.enable_interrupts();
        assert!(platform.interrupts_enabled());

        let other = platform.clone();
        let seen = platform
            .run_on(1, move || {
                let before = other.interrupts_enabled();
                other.enable_interrupts();
                let saved = other.save_and_disable_interrupts();
                let masked = !other.interrupts_enabled();
                other.restore_interrupts(saved);
                (other.cpu_id(), before, masked, other.interrupts_enabled())
            })
            .join()
            .unwrap();

        assert_eq!(seen, (1, false, true, true));
        assert_eq!(platform.cpu_id(), 0);
    }

    #[test]
    fn test_observer_slot() {
        let platform = HostPlatform::with_observer(2);
        assert_eq!(platform.cpu_id(), 2);
        platform.enable_interrupts();
        let cpu0 = platform.run_on(0, || ()).join();
        assert!(cpu0.is_ok());
        assert!(!platform.shared.irq[0].load(Ordering::SeqCst));
        assert!(platform.shared.irq[2].load(Ordering::SeqCst));
    }

    #[test]
    fn test_timer_registration_and_idle_tick() {
        static TICKS: AtomicUsize = AtomicUsize::new(0);

        let platform = HostPlatform::new(1);
        platform
            .register_timer_handler(Box::new(|| {
                TICKS.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(
            platform.register_timer_handler(Box::new(|| {})),
            Err(KernError::TimerBusy)
        );

        platform.disable_interrupts();
        platform.wait_for_interrupt();
        assert_eq!(TICKS.load(Ordering::SeqCst), 0);

        platform.enable_interrupts();
        platform.wait_for_interrupt();
        assert_eq!(TICKS.load(Ordering::SeqCst), 1);
    }
}

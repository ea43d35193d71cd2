//! Kernel Timer and Alarms
//!
//! One periodic tick drives everything time-related. Each processor counts
//! its own ticks and derives two slower rates from them:
//! - the alarm rate, at which it scans its run queue for expired alarms;
//! - the scheduling rate, at which it burns a quantum of the running
//!   thread and reschedules once the quantum is used up.
//!
//! Global time only advances on the boot processor.
//!
//! Timed sleep is polling: `pause` arms the thread's alarm and blocks, and
//! the alarm scan on the thread's home processor wakes it.

use core::sync::atomic::Ordering;

use crate::kern::processor::Processor;
use crate::kern::startup::{kernel, Kernel};
use crate::kern::thread::ThreadState;

/// Tick count, wrapping
pub type Ticks = u32;

/// `a` is later than `b`, correct across counter wraparound as long as the
/// two are less than half the counter range apart
#[inline]
pub fn time_after(a: Ticks, b: Ticks) -> bool {
    (b.wrapping_sub(a) as i32) < 0
}

#[inline]
pub fn time_before(a: Ticks, b: Ticks) -> bool {
    time_after(b, a)
}

// ============================================================================
// Alarm
// ============================================================================

/// Longest span a single alarm covers. Deadlines further out would compare
/// as already passed.
pub const MAX_ALARM_TICKS: Ticks = i32::MAX as Ticks;

/// Split a sleep of `total` ticks into the span to arm now and the rest
pub fn alarm_span(total: u64) -> (Ticks, u64) {
    let span = total.min(MAX_ALARM_TICKS as u64);
    (span as Ticks, total - span)
}

/// One-shot deadline attached to a thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Alarm {
    enabled: bool,
    start: Ticks,
    duration: Ticks,
}

impl Alarm {
    pub const fn new() -> Self {
        Self {
            enabled: false,
            start: 0,
            duration: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Arm for `duration` ticks starting at `now`, at most
    /// [`MAX_ALARM_TICKS`]
    pub fn set(&mut self, now: Ticks, duration: Ticks) {
        self.start = now;
        self.duration = duration.min(MAX_ALARM_TICKS);
        self.enabled = true;
    }

    pub fn unset(&mut self) {
        self.enabled = false;
    }

    pub fn is_set(&self) -> bool {
        self.enabled
    }

    /// Arm again from `now` with the previous duration
    pub fn restart(&mut self, now: Ticks) {
        self.set(now, self.duration);
    }

    pub fn deadline(&self) -> Ticks {
        self.start.wrapping_add(self.duration)
    }

    pub fn duration(&self) -> Ticks {
        self.duration
    }

    /// Armed, and `now` has reached the deadline
    pub fn expired(&self, now: Ticks) -> bool {
        self.enabled && !time_before(now, self.deadline())
    }
}

// ============================================================================
// Tick handling
// ============================================================================

impl Kernel {
    /// Global tick count
    pub fn ticks(&self) -> Ticks {
        self.ticks.load(Ordering::Acquire)
    }

    pub fn ms_to_ticks(&self, ms: u32) -> Ticks {
        let ticks = ms as u64 * self.config().tick_hz as u64 / 1000;
        ticks.min(Ticks::MAX as u64) as Ticks
    }

    pub fn ticks_to_ms(&self, ticks: Ticks) -> u64 {
        ticks as u64 * 1000 / self.config().tick_hz as u64
    }

    /// Tick interrupt handler for the executing processor
    pub fn timer_interrupt(&self) {
        let cpu = self.current_processor();
        if !cpu.is_online() {
            return;
        }

        if cpu.is_boot() {
            self.ticks.fetch_add(1, Ordering::AcqRel);
        }
        let local = cpu.tick();
        let config = self.config();

        if local % config.hz_div(config.alarm_hz) == 0 {
            self.check_alarms(cpu);
        }

        if local % config.hz_div(config.sched_hz) == 0
            && cpu.preemptible()
            && self.quantum_expired(cpu)
        {
            self.schedule();
        }
    }

    /// Burn one scheduling period of the running thread's quantum
    fn quantum_expired(&self, cpu: &Processor) -> bool {
        let current = match cpu.current(self) {
            Some(current) => current,
            None => return false,
        };
        let refill = self.config().rr_slice;
        let mut rq = cpu.runq().lock_irqsave(self);
        match rq.entry_mut(current.id()) {
            Some(entry) => entry.policy.consume(refill),
            None => true,
        }
    }

    /// Wake every thread on this processor whose alarm has expired
    pub(crate) fn check_alarms(&self, cpu: &Processor) -> usize {
        let now = self.ticks();
        let mut woken = 0;

        let rq = cpu.runq().lock_irqsave(self);
        for entry in rq.iter() {
            let thread = entry.thread();
            let mut alarm = thread.alarm().lock_irqsave(self);
            if alarm.expired(now) {
                alarm.unset();
                if thread.wake() {
                    woken += 1;
                }
            }
        }
        woken
    }

    /// Block the calling thread for at least `seconds` worth of ticks.
    ///
    /// Sleeps longer than one alarm can cover are taken in several spans.
    pub fn pause(&self, seconds: u32) {
        let thread = self.current_thread().unwrap_or_else(|| {
            panic!("{}: pause without a current thread", self.cpu_id())
        });
        let mut remaining = seconds as u64 * self.config().tick_hz as u64;

        loop {
            let (span, rest) = alarm_span(remaining);
            remaining = rest;
            {
                let mut alarm = thread.alarm().lock_irqsave(self);
                alarm.reset();
                alarm.set(self.ticks(), span);
            }

            loop {
                {
                    let alarm = thread.alarm().lock_irqsave(self);
                    if !alarm.is_set() {
                        break;
                    }
                    thread.set_state(ThreadState::Blocked);
                }
                self.schedule();
            }

            if remaining == 0 {
                break;
            }
        }
    }
}

// ============================================================================
// Compatibility Functions
// ============================================================================

/// Sleep the calling thread
pub fn pause(seconds: u32) {
    kernel().pause(seconds);
}

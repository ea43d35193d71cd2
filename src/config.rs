//! Kernel configuration
//!
//! Compile-time limits plus the runtime [`KernelConfig`], which boot code
//! builds directly or parses from the kernel command line.

use crate::error::{KernError, KernResult};
use crate::kern::runq::SchedPolicy;

// ============================================================
// Limits and defaults
// ============================================================

/// Size of the processor table
pub const MAX_CPUS: usize = 16;

/// Base timer interrupt frequency
pub const CLOCK_INT_HZ: u32 = 1000;

/// Default scheduling frequency
pub const SCHED_HZ: u32 = 100;

/// Default alarm-scan frequency
pub const ALARM_HZ: u32 = 100;

/// Default kernel stack size per thread
pub const KERNEL_STACK_SIZE: usize = 0x4000;

/// Default live-thread limit
pub const MAX_THREADS: usize = 1024;

/// Default live-task limit
pub const MAX_TASKS: usize = 256;

// ============================================================
// Runtime configuration
// ============================================================

/// Tunables for one kernel instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Processors to manage (slots in the processor table)
    pub cpus: usize,
    /// Base tick frequency of the timer interrupt
    pub tick_hz: u32,
    /// How often the timer path invokes the scheduler
    pub sched_hz: u32,
    /// How often the timer path scans for expired alarms
    pub alarm_hz: u32,
    /// Scheduling periods per round-robin quantum
    pub rr_slice: u32,
    /// Kernel stack bytes per thread
    pub stack_size: usize,
    pub max_threads: usize,
    pub max_tasks: usize,
    /// Whether timer ticks may preempt running threads
    pub preemption: bool,
    /// Policy installed on every processor at boot
    pub policy: SchedPolicy,
}

impl KernelConfig {
    pub const fn new() -> Self {
        Self {
            cpus: 1,
            tick_hz: CLOCK_INT_HZ,
            sched_hz: SCHED_HZ,
            alarm_hz: ALARM_HZ,
            rr_slice: 1,
            stack_size: KERNEL_STACK_SIZE,
            max_threads: MAX_THREADS,
            max_tasks: MAX_TASKS,
            preemption: true,
            policy: SchedPolicy::RoundRobin,
        }
    }

    pub const fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus;
        self
    }

    pub const fn with_frequencies(mut self, tick_hz: u32, sched_hz: u32, alarm_hz: u32) -> Self {
        self.tick_hz = tick_hz;
        self.sched_hz = sched_hz;
        self.alarm_hz = alarm_hz;
        self
    }

    pub const fn with_preemption(mut self, on: bool) -> Self {
        self.preemption = on;
        self
    }

    pub const fn with_limits(mut self, max_threads: usize, max_tasks: usize) -> Self {
        self.max_threads = max_threads;
        self.max_tasks = max_tasks;
        self
    }

    pub const fn with_policy(mut self, policy: SchedPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Ticks between firings of an action running at `hz`
    pub fn hz_div(&self, hz: u32) -> u32 {
        if hz >= self.tick_hz {
            1
        } else {
            self.tick_hz / hz
        }
    }

    pub fn validate(&self) -> KernResult<()> {
        if self.cpus == 0 || self.cpus > MAX_CPUS {
            return Err(KernError::InvalidConfig("cpus"));
        }
        if self.tick_hz == 0 {
            return Err(KernError::InvalidConfig("hz"));
        }
        if self.sched_hz == 0 || self.sched_hz > self.tick_hz {
            return Err(KernError::InvalidConfig("sched_hz"));
        }
        if self.alarm_hz == 0 || self.alarm_hz > self.tick_hz {
            return Err(KernError::InvalidConfig("alarm_hz"));
        }
        if self.rr_slice == 0 {
            return Err(KernError::InvalidConfig("slice"));
        }
        if self.stack_size == 0 {
            return Err(KernError::InvalidConfig("stack"));
        }
        if self.max_threads == 0 {
            return Err(KernError::InvalidConfig("max_threads"));
        }
        if self.max_tasks == 0 {
            return Err(KernError::InvalidConfig("max_tasks"));
        }
        Ok(())
    }

    /// Parse `key=value` pairs from a boot command line
    ///
    /// Keys not meant for the scheduler are skipped with a warning. The
    /// result is validated before it is returned.
    pub fn from_cmdline(cmdline: &str) -> KernResult<Self> {
        let mut config = Self::new();

        for arg in cmdline.split_whitespace() {
            let Some((key, value)) = arg.split_once('=') else {
                log::warn!("cmdline: ignoring bare argument '{}'", arg);
                continue;
            };

            match key {
                "cpus" => config.cpus = parse(value, "cpus")?,
                "hz" => config.tick_hz = parse(value, "hz")?,
                "sched_hz" => config.sched_hz = parse(value, "sched_hz")?,
                "alarm_hz" => config.alarm_hz = parse(value, "alarm_hz")?,
                "slice" => config.rr_slice = parse(value, "slice")?,
                "stack" => config.stack_size = parse(value, "stack")?,
                "max_threads" => config.max_threads = parse(value, "max_threads")?,
                "max_tasks" => config.max_tasks = parse(value, "max_tasks")?,
                "preempt" => {
                    config.preemption = match value {
                        "on" | "1" | "yes" => true,
                        "off" | "0" | "no" => false,
                        _ => return Err(KernError::InvalidConfig("preempt")),
                    }
                }
                "sched" => {
                    config.policy = match value {
                        "rr" => SchedPolicy::RoundRobin,
                        "prio" => SchedPolicy::Priority,
                        _ => return Err(KernError::InvalidConfig("sched")),
                    }
                }
                _ => log::warn!("cmdline: unknown key '{}'", key),
            }
        }

        config.validate()?;
        Ok(config)
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse<T: TryFrom<u64>>(value: &str, key: &'static str) -> KernResult<T> {
    let n = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    }
    .map_err(|_| KernError::InvalidConfig(key))?;
    T::try_from(n).map_err(|_| KernError::InvalidConfig(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;
    use proptest::prelude::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = KernelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.hz_div(config.sched_hz), 10);
        assert_eq!(config.hz_div(config.tick_hz), 1);
        assert_eq!(config.hz_div(5000), 1);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert_eq!(
            KernelConfig::new().with_cpus(0).validate(),
            Err(KernError::InvalidConfig("cpus"))
        );
        assert_eq!(
            KernelConfig::new().with_cpus(MAX_CPUS + 1).validate(),
            Err(KernError::InvalidConfig("cpus"))
        );
        assert_eq!(
            KernelConfig::new().with_frequencies(1000, 2000, 100).validate(),
            Err(KernError::InvalidConfig("sched_hz"))
        );
        assert_eq!(
            KernelConfig::new().with_frequencies(1000, 100, 0).validate(),
            Err(KernError::InvalidConfig("alarm_hz"))
        );
        assert_eq!(
            KernelConfig::new().with_limits(0, 1).validate(),
            Err(KernError::InvalidConfig("max_threads"))
        );
    }

    #[test]
    fn test_cmdline_parsing() {
        let config =
            KernelConfig::from_cmdline("root=/dev/ram0 cpus=4 sched_hz=250 preempt=off sched=rr")
                .unwrap();
        assert_eq!(config.cpus, 4);
        assert_eq!(config.sched_hz, 250);
        assert!(!config.preemption);
        assert_eq!(config.policy, SchedPolicy::RoundRobin);
        assert_eq!(config.tick_hz, CLOCK_INT_HZ);
    }

    #[test]
    fn test_cmdline_errors() {
        assert_eq!(
            KernelConfig::from_cmdline("cpus=many"),
            Err(KernError::InvalidConfig("cpus"))
        );
        assert_eq!(
            KernelConfig::from_cmdline("preempt=maybe"),
            Err(KernError::InvalidConfig("preempt"))
        );
        assert_eq!(
            KernelConfig::from_cmdline("hz=100 sched_hz=1000"),
            Err(KernError::InvalidConfig("sched_hz"))
        );
    }

    #[test]
    fn test_cmdline_priority_policy() {
        let config = KernelConfig::from_cmdline("sched=prio").unwrap();
        assert_eq!(config.policy, SchedPolicy::Priority);
        assert_eq!(config, KernelConfig::new().with_policy(SchedPolicy::Priority));
        assert_eq!(
            KernelConfig::from_cmdline("sched=fifo"),
            Err(KernError::InvalidConfig("sched"))
        );
    }

    #[test]
    fn test_cmdline_hex_stack() {
        let config = KernelConfig::from_cmdline("stack=0x8000").unwrap();
        assert_eq!(config.stack_size, 0x8000);
    }

    proptest! {
        #[test]
        fn prop_cmdline_cpus_roundtrip(cpus in 1usize..=MAX_CPUS, sched in 1u32..=1000) {
            let line = format!("cpus={} sched_hz={}", cpus, sched);
            let config = KernelConfig::from_cmdline(&line).unwrap();
            prop_assert_eq!(config.cpus, cpus);
            prop_assert_eq!(config.sched_hz, sched);
            prop_assert!(config.hz_div(sched) >= 1);
        }
    }
}

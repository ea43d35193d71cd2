//! Kernel error type
//!
//! Only recoverable conditions live here: resource exhaustion and bad
//! configuration. Broken invariants panic with diagnostics instead.

use thiserror::Error;

use crate::types::{ProcessorId, TaskId};

/// Errors reported to callers of the scheduling core
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernError {
    #[error("out of memory allocating {0}")]
    OutOfMemory(&'static str),

    #[error("thread table full ({0} threads)")]
    TooManyThreads(usize),

    #[error("task table full ({0} tasks)")]
    TooManyTasks(usize),

    #[error("no current thread on {0}")]
    NoCurrentThread(ProcessorId),

    #[error("no such processor: {0}")]
    NoSuchProcessor(ProcessorId),

    #[error("no such task: {0}")]
    NoSuchTask(TaskId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("kernel already initialized")]
    AlreadyInitialized,

    #[error("timer handler already registered")]
    TimerBusy,
}

/// Result alias used throughout the crate
pub type KernResult<T> = Result<T, KernError>;

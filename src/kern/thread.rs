//! Thread Management
//!
//! A thread is the unit the scheduler dispatches. It belongs to exactly one
//! task, owns a kernel stack and a saved register context, and carries the
//! alarm used for timed sleeps.
//!
//! Only four states are stored. "Running" is derived: a READY thread that
//! some processor points to as its current thread.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI32, AtomicU8, AtomicUsize, Ordering};

use crate::arch::Context;
use crate::error::{KernError, KernResult};
use crate::kern::lock::SpinLock;
use crate::kern::timer::Alarm;
use crate::types::{ProcessorId, TaskId, ThreadId};

// ============================================================================
// Thread State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Created, never enqueued
    Init = 0,
    /// On a run queue and eligible for selection (or running)
    Ready = 1,
    /// Waiting on a mutex, semaphore or alarm
    Blocked = 2,
    /// Entry function returned
    Complete = 3,
}

impl ThreadState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Init,
            1 => Self::Ready,
            2 => Self::Blocked,
            _ => Self::Complete,
        }
    }
}

/// Body of a kernel thread; the return value is kept as the exit code
pub type ThreadEntry = Box<dyn FnOnce() -> i32 + Send + 'static>;

/// Entry that calls `routine(arg)`
pub fn with_arg(routine: fn(usize) -> i32, arg: usize) -> ThreadEntry {
    Box::new(move || routine(arg))
}

const NO_HOME: usize = usize::MAX;

// ============================================================================
// Thread
// ============================================================================

pub struct Thread {
    id: ThreadId,
    task: TaskId,
    state: AtomicU8,
    /// Written only by the switch primitives of the processor running or
    /// resuming this thread
    context: UnsafeCell<Context>,
    stack: Box<[u8]>,
    home: AtomicUsize,
    alarm: SpinLock<Alarm>,
    entry: spin::Mutex<Option<ThreadEntry>>,
    exit_code: AtomicI32,
}

unsafe impl Sync for Thread {}

impl Thread {
    /// Allocate a thread and its kernel stack.
    ///
    /// The initial context starts at `start`, which calls
    /// `routine(kernel, id)` on the new stack.
    pub(crate) fn new(
        id: ThreadId,
        task: TaskId,
        entry: ThreadEntry,
        stack_size: usize,
        start: usize,
        routine: usize,
        kernel: usize,
    ) -> KernResult<Self> {
        let mut stack = Vec::new();
        stack
            .try_reserve_exact(stack_size)
            .map_err(|_| KernError::OutOfMemory("kernel stack"))?;
        stack.resize(stack_size, 0u8);
        let stack = stack.into_boxed_slice();

        let top = stack.as_ptr() as usize + stack.len();
        let context = Context::initial(top, start, routine, kernel, id.0 as usize);

        Ok(Self {
            id,
            task,
            state: AtomicU8::new(ThreadState::Init as u8),
            context: UnsafeCell::new(context),
            stack,
            home: AtomicUsize::new(NO_HOME),
            alarm: SpinLock::new(Alarm::new()),
            entry: spin::Mutex::new(Some(entry)),
            exit_code: AtomicI32::new(0),
        })
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Owning task
    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to` if the thread is still in `from`
    pub(crate) fn transition(&self, from: ThreadState, to: ThreadState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// BLOCKED -> READY. False if the thread was not blocked.
    pub(crate) fn wake(&self) -> bool {
        self.transition(ThreadState::Blocked, ThreadState::Ready)
    }

    /// Processor the thread was placed on at first enqueue
    pub fn home(&self) -> Option<ProcessorId> {
        match self.home.load(Ordering::Acquire) {
            NO_HOME => None,
            cpu => Some(ProcessorId(cpu)),
        }
    }

    /// Fix the home processor. Only the first call has an effect.
    pub(crate) fn settle_on(&self, cpu: ProcessorId) -> ProcessorId {
        match self
            .home
            .compare_exchange(NO_HOME, cpu.0, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => cpu,
            Err(existing) => ProcessorId(existing),
        }
    }

    /// Copy of the saved register context
    pub fn context(&self) -> Context {
        unsafe { *self.context.get() }
    }

    pub(crate) fn context_ptr(&self) -> *mut Context {
        self.context.get()
    }

    pub fn stack_base(&self) -> usize {
        self.stack.as_ptr() as usize
    }

    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    pub(crate) fn alarm(&self) -> &SpinLock<Alarm> {
        &self.alarm
    }

    /// Take the entry closure; `None` once the thread has started
    pub(crate) fn take_entry(&self) -> Option<ThreadEntry> {
        self.entry.lock().take()
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    pub(crate) fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::Release);
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("task", &self.task)
            .field("state", &self.state())
            .field("home", &self.home())
            .finish()
    }
}

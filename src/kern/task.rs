//! Task Management
//!
//! A task groups threads under one address-space handle. Kernel tasks are
//! privileged and share the kernel space; ordinary tasks each get a fresh
//! handle. The task lives until its last thread finishes.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::error::{KernError, KernResult};
use crate::kern::lock::SpinLock;
use crate::kern::sched_prim::thread_trampoline;
use crate::kern::startup::{kernel, Kernel};
use crate::kern::thread::{Thread, ThreadEntry, ThreadState};
use crate::types::{AddressSpace, TaskId, ThreadId};

// ============================================================================
// Task State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Created, first thread not yet queued
    Init = 0,
    /// At least one thread queued
    Ready = 1,
    /// Last thread finished
    Complete = 2,
}

impl TaskState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Init,
            1 => Self::Ready,
            _ => Self::Complete,
        }
    }
}

// ============================================================================
// Task
// ============================================================================

pub struct Task {
    id: TaskId,
    state: AtomicU8,
    space: AddressSpace,
    parent: Option<TaskId>,
    privileged: bool,
    /// Live threads, in creation order
    threads: SpinLock<Vec<ThreadId>>,
}

impl Task {
    fn new(id: TaskId, space: AddressSpace, parent: Option<TaskId>, privileged: bool) -> Self {
        Self {
            id,
            state: AtomicU8::new(TaskState::Init as u8),
            space,
            parent,
            privileged,
            threads: SpinLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn space(&self) -> AddressSpace {
        self.space
    }

    pub fn parent(&self) -> Option<TaskId> {
        self.parent
    }

    /// Runs with kernel privilege
    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn threads(&self, kernel: &Kernel) -> Vec<ThreadId> {
        self.threads.lock_irqsave(kernel).clone()
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("space", &self.space)
            .field("parent", &self.parent)
            .field("privileged", &self.privileged)
            .finish()
    }
}

// ============================================================================
// Creation and teardown
// ============================================================================

impl Kernel {
    /// Create a privileged task in the kernel address space and queue its
    /// first thread
    pub fn create_kernel_task(&'static self, entry: ThreadEntry) -> KernResult<TaskId> {
        self.create_task_inner(AddressSpace::KERNEL, true, entry)
    }

    /// Create an ordinary task with its own address-space handle and queue
    /// its first thread
    pub fn create_task(&'static self, entry: ThreadEntry) -> KernResult<TaskId> {
        let space = AddressSpace(self.alloc_space());
        self.create_task_inner(space, false, entry)
    }

    /// Add a thread to the calling thread's task and queue it
    pub fn create_thread(&'static self, entry: ThreadEntry) -> KernResult<ThreadId> {
        let task = self
            .current_task()
            .ok_or_else(|| KernError::NoCurrentThread(self.cpu_id()))?;
        self.create_thread_in(task.id(), entry)
    }

    /// Add a thread to `task` and queue it
    pub fn create_thread_in(&'static self, task: TaskId, entry: ThreadEntry) -> KernResult<ThreadId> {
        let task = self.task(task).ok_or(KernError::NoSuchTask(task))?;
        let thread = self.spawn_thread(&task, entry)?;
        if let Err(e) = self.add_thread_to_rq(&thread) {
            self.unregister_thread(&task, thread.id());
            return Err(e);
        }
        Ok(thread.id())
    }

    fn create_task_inner(
        &'static self,
        space: AddressSpace,
        privileged: bool,
        entry: ThreadEntry,
    ) -> KernResult<TaskId> {
        let parent = self.current_task().map(|t| t.id());
        let task = Arc::new(Task::new(self.alloc_task_id(), space, parent, privileged));

        {
            let mut tasks = self.tasks.lock_irqsave(self);
            if tasks.len() >= self.config().max_tasks {
                return Err(KernError::TooManyTasks(self.config().max_tasks));
            }
            tasks.insert(task.id(), task.clone());
        }

        let first = match self.spawn_thread(&task, entry) {
            Ok(thread) => thread,
            Err(e) => {
                self.tasks.lock_irqsave(self).remove(&task.id());
                return Err(e);
            }
        };

        if let Err(e) = self.add_task_to_rq(&task, &first) {
            self.unregister_thread(&task, first.id());
            self.tasks.lock_irqsave(self).remove(&task.id());
            return Err(e);
        }

        log::debug!(
            "created {} ({}, parent {:?}) with {}",
            task.id(),
            if privileged { "kernel" } else { "user" },
            parent,
            first.id()
        );
        Ok(task.id())
    }

    /// Queue the first thread of a fresh task; the task becomes READY
    fn add_task_to_rq(&self, task: &Task, first: &Arc<Thread>) -> KernResult<()> {
        if task.state() != TaskState::Init {
            panic!("{} enqueued in state {:?}", task.id(), task.state());
        }
        self.add_thread_to_rq(first)?;
        task.set_state(TaskState::Ready);
        Ok(())
    }

    /// Allocate a thread in `task` and register it. The thread stays INIT
    /// until queued.
    fn spawn_thread(&'static self, task: &Task, entry: ThreadEntry) -> KernResult<Arc<Thread>> {
        let max = self.config().max_threads;
        if self.thread_count() >= max {
            return Err(KernError::TooManyThreads(max));
        }

        let thread = Arc::new(Thread::new(
            self.alloc_thread_id(),
            task.id(),
            entry,
            self.config().stack_size,
            self.platform().start_address(),
            thread_trampoline as usize,
            self as *const Kernel as usize,
        )?);

        let mut members = task.threads.lock_irqsave(self);
        let mut threads = self.threads.lock_irqsave(self);
        if threads.len() >= max {
            return Err(KernError::TooManyThreads(max));
        }
        threads.insert(thread.id(), thread.clone());
        members.push(thread.id());
        Ok(thread)
    }

    fn unregister_thread(&self, task: &Task, id: ThreadId) {
        task.threads.lock_irqsave(self).retain(|&t| t != id);
        self.threads.lock_irqsave(self).remove(&id);
    }

    /// Drop a finished thread from the registries. The last thread out
    /// completes its task.
    pub(crate) fn retire_thread(&self, thread: &Thread) {
        {
            let mut tasks = self.tasks.lock_irqsave(self);
            if let Some(task) = tasks.get(&thread.task()).cloned() {
                let last = {
                    let mut members = task.threads.lock_irqsave(self);
                    members.retain(|&t| t != thread.id());
                    members.is_empty()
                };
                if last {
                    task.set_state(TaskState::Complete);
                    tasks.remove(&task.id());
                    log::debug!("{} complete", task.id());
                }
            }
        }
        self.threads.lock_irqsave(self).remove(&thread.id());
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// State of a live thread; `None` once it finished and was reaped
    pub fn thread_state(&self, id: ThreadId) -> Option<ThreadState> {
        self.thread(id).map(|t| t.state())
    }

    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.task(id).map(|t| t.state())
    }

    pub fn task_threads(&self, id: TaskId) -> KernResult<Vec<ThreadId>> {
        Ok(self.task(id).ok_or(KernError::NoSuchTask(id))?.threads(self))
    }

    pub fn task_parent(&self, id: TaskId) -> KernResult<Option<TaskId>> {
        Ok(self.task(id).ok_or(KernError::NoSuchTask(id))?.parent())
    }
}

// ============================================================================
// Compatibility Functions
// ============================================================================

pub fn create_kernel_task(entry: ThreadEntry) -> KernResult<TaskId> {
    kernel().create_kernel_task(entry)
}

pub fn create_task(entry: ThreadEntry) -> KernResult<TaskId> {
    kernel().create_task(entry)
}

pub fn create_thread(entry: ThreadEntry) -> KernResult<ThreadId> {
    kernel().create_thread(entry)
}

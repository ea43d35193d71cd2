//! Run Queue Management
//!
//! Each processor keeps one run queue: a circular list of entries, one per
//! thread homed on that processor, whatever the thread's state. Entries are
//! separate nodes pairing a thread handle with policy data, so a thread's
//! own layout never dictates queue linkage.
//!
//! Selection walks the list circularly from a starting slot and takes the
//! first READY thread; BLOCKED entries are skipped.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KernError, KernResult};
use crate::kern::thread::{Thread, ThreadState};
use crate::types::ThreadId;

// ============================================================================
// Policy
// ============================================================================

/// Scheduling policy installed on a processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SchedPolicy {
    /// Circular scan of the run queue
    #[default]
    RoundRobin = 0,
    /// Reserved. Selecting a thread under it panics.
    Priority = 1,
}

impl SchedPolicy {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Priority,
            _ => Self::RoundRobin,
        }
    }
}

/// Per-entry scheduler bookkeeping, tagged by policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyData {
    RoundRobin { slice: u32 },
    Priority { slice: u32, priority: i32 },
}

impl PolicyData {
    pub fn for_policy(policy: SchedPolicy, slice: u32) -> Self {
        match policy {
            SchedPolicy::RoundRobin => Self::RoundRobin { slice },
            SchedPolicy::Priority => Self::Priority { slice, priority: 0 },
        }
    }

    pub fn policy(&self) -> SchedPolicy {
        match self {
            Self::RoundRobin { .. } => SchedPolicy::RoundRobin,
            Self::Priority { .. } => SchedPolicy::Priority,
        }
    }

    /// Remaining scheduling periods in the current quantum
    pub fn slice(&self) -> u32 {
        match *self {
            Self::RoundRobin { slice } | Self::Priority { slice, .. } => slice,
        }
    }

    /// Burn one period of the quantum. Returns true when it ran out, in
    /// which case the quantum is refilled to `refill`.
    pub fn consume(&mut self, refill: u32) -> bool {
        let slice = match self {
            Self::RoundRobin { slice } | Self::Priority { slice, .. } => slice,
        };
        *slice = slice.saturating_sub(1);
        if *slice == 0 {
            *slice = refill;
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Run Queue Entry
// ============================================================================

#[derive(Debug, Clone)]
pub struct RunqEntry {
    thread: Arc<Thread>,
    pub policy: PolicyData,
}

impl RunqEntry {
    pub fn new(thread: Arc<Thread>, policy: PolicyData) -> Self {
        Self { thread, policy }
    }

    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }

    pub fn is_ready(&self) -> bool {
        self.thread.state() == ThreadState::Ready
    }
}

// ============================================================================
// Run Queue
// ============================================================================

#[derive(Debug, Default)]
pub struct RunQueue {
    entries: VecDeque<RunqEntry>,
}

impl RunQueue {
    pub const fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Threads homed here, in any state
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn ready_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_ready()).count()
    }

    /// Append an entry. Fails without side effects when the node cannot be
    /// allocated.
    pub fn push(&mut self, entry: RunqEntry) -> KernResult<()> {
        if let Some(pos) = self.position(entry.thread.id()) {
            panic!(
                "{} queued twice (already at slot {} of {:?})",
                entry.thread.id(),
                pos,
                self.summary()
            );
        }
        self.entries
            .try_reserve(1)
            .map_err(|_| KernError::OutOfMemory("run-queue entry"))?;
        self.entries.push_back(entry);
        Ok(())
    }

    pub fn position(&self, id: ThreadId) -> Option<usize> {
        self.entries.iter().position(|e| e.thread.id() == id)
    }

    pub fn get(&self, index: usize) -> Option<&RunqEntry> {
        self.entries.get(index)
    }

    pub fn entry_mut(&mut self, id: ThreadId) -> Option<&mut RunqEntry> {
        self.entries.iter_mut().find(|e| e.thread.id() == id)
    }

    pub fn remove_at(&mut self, index: usize) -> Option<RunqEntry> {
        self.entries.remove(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RunqEntry> {
        self.entries.iter()
    }

    /// Index of the first READY entry scanning circularly from `start`
    /// (inclusive) through every slot once
    pub fn next_ready_from(&self, start: usize) -> Option<usize> {
        let len = self.entries.len();
        (0..len)
            .map(|step| (start + step) % len)
            .find(|&idx| self.entries[idx].is_ready())
    }

    /// Index of the first READY entry after thread `id`, wrapping around
    /// and ending with `id` itself. `None` if `id` is not queued here.
    pub fn next_ready_after(&self, id: ThreadId) -> Option<Option<usize>> {
        let pos = self.position(id)?;
        Some(self.next_ready_from(pos + 1))
    }

    /// Queue contents for diagnostics
    pub fn summary(&self) -> Vec<(ThreadId, ThreadState)> {
        self.entries
            .iter()
            .map(|e| (e.thread.id(), e.thread.state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskId;
    use alloc::boxed::Box;

    fn thread(id: u64, state: ThreadState) -> Arc<Thread> {
        let t = Thread::new(ThreadId(id), TaskId(1), Box::new(|| 0), 256, 0, 0, 0).unwrap();
        t.set_state(state);
        Arc::new(t)
    }

    fn queue(states: &[ThreadState]) -> RunQueue {
        let mut rq = RunQueue::new();
        for (i, &state) in states.iter().enumerate() {
            rq.push(RunqEntry::new(
                thread(i as u64 + 1, state),
                PolicyData::for_policy(SchedPolicy::RoundRobin, 1),
            ))
            .unwrap();
        }
        rq
    }

    use ThreadState::{Blocked, Ready};

    #[test]
    fn test_scan_wraps_and_skips_blocked() {
        let rq = queue(&[Ready, Blocked, Blocked, Ready]);
        assert_eq!(rq.len(), 4);
        assert_eq!(rq.ready_count(), 2);

        assert_eq!(rq.next_ready_after(ThreadId(1)), Some(Some(3)));
        assert_eq!(rq.next_ready_after(ThreadId(4)), Some(Some(0)));
        assert_eq!(rq.next_ready_after(ThreadId(2)), Some(Some(3)));
        assert_eq!(rq.next_ready_after(ThreadId(99)), None);
    }

    #[test]
    fn test_scan_returns_self_last() {
        let rq = queue(&[Blocked, Ready, Blocked]);
        assert_eq!(rq.next_ready_after(ThreadId(2)), Some(Some(1)));

        let idle = queue(&[Blocked, Blocked]);
        assert_eq!(idle.next_ready_after(ThreadId(1)), Some(None));
        assert_eq!(idle.next_ready_from(0), None);
        assert_eq!(RunQueue::new().next_ready_from(0), None);
    }

    #[test]
    fn test_one_lap_visits_every_ready_thread() {
        let rq = queue(&[Ready, Ready, Ready, Ready, Ready]);
        let mut current = ThreadId(3);
        let mut seen = alloc::vec::Vec::new();
        for _ in 0..5 {
            let idx = rq.next_ready_after(current).unwrap().unwrap();
            current = rq.get(idx).unwrap().thread().id();
            seen.push(current.0);
        }
        seen.sort();
        assert_eq!(seen, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut rq = queue(&[Ready, Ready, Ready]);
        let removed = rq.remove_at(1).unwrap();
        assert_eq!(removed.thread().id(), ThreadId(2));
        assert_eq!(
            rq.summary(),
            [(ThreadId(1), Ready), (ThreadId(3), Ready)]
        );
        // The slot of the removed entry now holds its successor
        assert_eq!(rq.next_ready_from(1), Some(1));
    }

    #[test]
    #[should_panic(expected = "queued twice")]
    fn test_duplicate_enqueue_panics() {
        let mut rq = RunQueue::new();
        let t = thread(1, Ready);
        rq.push(RunqEntry::new(t.clone(), PolicyData::RoundRobin { slice: 1 }))
            .unwrap();
        let _ = rq.push(RunqEntry::new(t, PolicyData::RoundRobin { slice: 1 }));
    }

    #[test]
    fn test_quantum_consumption() {
        let mut data = PolicyData::for_policy(SchedPolicy::RoundRobin, 3);
        assert!(!data.consume(3));
        assert!(!data.consume(3));
        assert!(data.consume(3));
        assert_eq!(data.slice(), 3);

        let mut short = PolicyData::RoundRobin { slice: 1 };
        assert!(short.consume(1));
        assert!(short.consume(1));

        let prio = PolicyData::for_policy(SchedPolicy::Priority, 2);
        assert_eq!(prio.policy(), SchedPolicy::Priority);
        assert_eq!(SchedPolicy::from_u8(SchedPolicy::Priority as u8), SchedPolicy::Priority);
    }
}

//! Scheduler containers: ready queue, tracking set and sleep set
//!
//! Every fiber a scheduler knows about sits in at most one of these, in a
//! container matching its state. Only the ready queue is reachable from other
//! threads (through migration), so only it carries a lock.

use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use crate::fiber::{Fiber, FiberState};

/// Fibers in state `ready`, in run order
///
/// Guarded by a spin lock: every critical section is a single push or pop,
/// and migration touches it from foreign threads.
#[derive(Default)]
pub(crate) struct ReadyQueue {
    fibers: spin::Mutex<VecDeque<Fiber>>,
}

impl ReadyQueue {
    /// Create an empty queue
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append to the back (normal fairness order)
    pub(crate) fn push_back(&self, fiber: Fiber) {
        self.fibers.lock().push_back(fiber);
    }

    /// Put in front of everything already queued
    pub(crate) fn push_front(&self, fiber: Fiber) {
        self.fibers.lock().push_front(fiber);
    }

    /// Append a batch, keeping its order
    pub(crate) fn extend(&self, fibers: impl IntoIterator<Item = Fiber>) {
        self.fibers.lock().extend(fibers);
    }

    /// Take the next fiber to run
    pub(crate) fn pop_front(&self) -> Option<Fiber> {
        self.fibers.lock().pop_front()
    }

    /// Take the most recently queued fiber, if it is ready and not pinned
    /// to this thread
    pub(crate) fn pop_back_movable(&self) -> Option<Fiber> {
        let mut fibers = self.fibers.lock();
        match fibers.back() {
            Some(fiber) if !fiber.is_ready() => {
                log::error!("{} is queued as ready in state {:?}", fiber, fiber.state());
                None
            }
            Some(fiber) if fiber.may_leave_thread() => fibers.pop_back(),
            _ => None,
        }
    }

    /// Whether `fiber` is queued
    pub(crate) fn contains(&self, fiber: &Fiber) -> bool {
        self.fibers.lock().iter().any(|queued| queued.ptr_eq(fiber))
    }

    /// Check if the queue is empty
    pub(crate) fn is_empty(&self) -> bool {
        self.fibers.lock().is_empty()
    }

    /// Get the number of queued fibers
    pub(crate) fn len(&self) -> usize {
        self.fibers.lock().len()
    }
}

/// Outcome of one partition pass over the tracking set
#[derive(Debug, Default)]
pub(crate) struct Partition {
    /// Fibers found ready, in tracking order
    pub(crate) ready: Vec<Fiber>,
    /// Terminated fibers dropped from tracking
    pub(crate) retired: usize,
}

/// Fibers the scheduler knows about that are neither queued nor sleeping
#[derive(Default)]
pub(crate) struct TrackingSet {
    fibers: Vec<Fiber>,
}

impl TrackingSet {
    /// Create an empty set
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start tracking `fiber`
    pub(crate) fn push(&mut self, fiber: Fiber) {
        self.fibers.push(fiber);
    }

    /// Stop tracking `fiber`; returns whether it was tracked
    pub(crate) fn remove(&mut self, fiber: &Fiber) -> bool {
        match self.fibers.iter().position(|tracked| tracked.ptr_eq(fiber)) {
            Some(index) => {
                self.fibers.remove(index);
                true
            }
            None => false,
        }
    }

    /// Whether `fiber` is tracked
    pub(crate) fn contains(&self, fiber: &Fiber) -> bool {
        self.fibers.iter().any(|tracked| tracked.ptr_eq(fiber))
    }

    /// Number of tracked fibers
    pub(crate) fn len(&self) -> usize {
        self.fibers.len()
    }

    /// Reclassify every tracked fiber by its current state.
    ///
    /// Ready fibers leave in tracking order, terminated ones are dropped for
    /// good, everything else stays in place. The pass is a stable partition so
    /// repeated passes keep round-robin order.
    pub(crate) fn partition(&mut self) -> Partition {
        let mut partition = Partition::default();
        let mut kept = Vec::with_capacity(self.fibers.len());

        for fiber in self.fibers.drain(..) {
            match fiber.state() {
                FiberState::Ready => partition.ready.push(fiber),
                FiberState::Terminated => partition.retired += 1,
                _ => kept.push(fiber),
            }
        }

        self.fibers = kept;
        partition
    }
}

/// Sleeping fibers ordered by wake deadline, ties by insertion order
#[derive(Default)]
pub(crate) struct SleepSet {
    entries: BTreeMap<(Instant, u64), Fiber>,
    next_seq: u64,
}

impl SleepSet {
    /// Create an empty set
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Park `fiber` until `deadline`
    pub(crate) fn insert(&mut self, deadline: Instant, fiber: Fiber) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((deadline, seq), fiber);
    }

    /// Take every fiber whose deadline is at or before `now`, earliest first
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Vec<Fiber> {
        let mut expired = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            expired.push(entry.remove());
        }
        expired
    }

    /// Earliest pending deadline
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Number of sleeping fibers
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

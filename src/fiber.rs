//! Fiber records: the scheduler-visible side of a fiber
//!
//! A [`Fiber`] is a cheap, clonable handle to one record. The record carries
//! the lifecycle state, the priority, the list of fibers joining it and the
//! execution context that actually runs the body.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::context::{Activation, Entry, ExecutionContext, Suspender};
use crate::error::{violation, Result};

/// Unique identifier for a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    pub(crate) fn next() -> Self {
        static FIBER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

        FiberId(FIBER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber#{}", self.0)
    }
}

/// Fiber lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FiberState {
    /// Eligible to run (or never run yet)
    Ready = 0,
    /// Executing on its scheduler's thread
    Running = 1,
    /// Parked until another fiber or a primitive wakes it
    Waiting = 2,
    /// Parked until a deadline passes
    Sleeping = 3,
    /// Body returned or panicked; terminal
    Terminated = 4,
}

impl FiberState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            2 => FiberState::Waiting,
            3 => FiberState::Sleeping,
            _ => FiberState::Terminated,
        }
    }
}

pub(crate) struct FiberRecord {
    id: FiberId,
    name: Option<String>,
    state: AtomicU8,
    priority: AtomicI32,
    /// Fibers blocked in `join` on this one, in join order
    joiners: Mutex<Vec<Weak<FiberRecord>>>,
    /// Released as soon as the body finishes
    context: Mutex<Option<ExecutionContext>>,
    suspender: Arc<Suspender>,
    failure: Mutex<Option<String>>,
    /// Set by a yield, cleared when the scheduler files the fiber
    yielded: AtomicBool,
    /// Whether the body may be resumed on a thread other than its first
    migratable: bool,
    /// Thread of the first resume; a pinned fiber never runs anywhere else
    home: OnceLock<ThreadId>,
}

impl Drop for FiberRecord {
    fn drop(&mut self) {
        let stranded = !self.migratable
            && self
                .home
                .get()
                .is_some_and(|home| *home != thread::current().id());
        if !stranded {
            return;
        }
        // Unwinding here would run the body's destructors off its thread
        if let Some(context) = self.context.get_mut().take() {
            log::warn!("{} released off its thread while suspended; leaking its stack", self.id);
            std::mem::forget(context);
        }
    }
}

/// Handle to a fiber record
///
/// Handles are shared: the scheduler's queues, the creator and any
/// [`JoinHandle`](crate::routine::JoinHandle) all point at the same record,
/// which is freed when the last handle goes away.
#[derive(Clone)]
pub struct Fiber {
    inner: Arc<FiberRecord>,
}

impl Fiber {
    /// Build a record whose body is produced from a weak handle to itself.
    ///
    /// The body only keeps a weak reference so that a parked fiber does not
    /// keep its own stack alive.
    pub(crate) fn new(
        name: Option<String>,
        priority: i32,
        stack_size: usize,
        migratable: bool,
        make_entry: impl FnOnce(Weak<FiberRecord>) -> Entry,
    ) -> Result<Self> {
        let id = FiberId::next();
        let suspender = Arc::new(Suspender::new(id));
        let inner = Arc::new(FiberRecord {
            id,
            name,
            state: AtomicU8::new(FiberState::Ready as u8),
            priority: AtomicI32::new(priority),
            joiners: Mutex::new(Vec::new()),
            context: Mutex::new(None),
            suspender: Arc::clone(&suspender),
            failure: Mutex::new(None),
            yielded: AtomicBool::new(false),
            migratable,
            home: OnceLock::new(),
        });

        let entry = make_entry(Arc::downgrade(&inner));
        let context = ExecutionContext::new(stack_size, suspender, entry)?;
        *inner.context.lock() = Some(context);

        Ok(Fiber { inner })
    }

    pub(crate) fn from_record(inner: Arc<FiberRecord>) -> Self {
        Fiber { inner }
    }

    /// Get the fiber ID
    pub fn id(&self) -> FiberId {
        self.inner.id
    }

    /// Get the debug name, if one was given
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Current lifecycle state
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Whether the fiber is ready to run
    pub fn is_ready(&self) -> bool {
        self.state() == FiberState::Ready
    }

    /// Whether the fiber is executing
    pub fn is_running(&self) -> bool {
        self.state() == FiberState::Running
    }

    /// Whether the fiber is blocked waiting
    pub fn is_waiting(&self) -> bool {
        self.state() == FiberState::Waiting
    }

    /// Whether the fiber is parked until a deadline
    pub fn is_sleeping(&self) -> bool {
        self.state() == FiberState::Sleeping
    }

    /// Whether the fiber has finished
    pub fn is_terminated(&self) -> bool {
        self.state() == FiberState::Terminated
    }

    /// Scheduling priority; higher runs sooner within a partition batch
    pub fn priority(&self) -> i32 {
        self.inner.priority.load(Ordering::Relaxed)
    }

    /// Panic message of the body, once it has failed
    pub fn failure(&self) -> Option<String> {
        self.inner.failure.lock().clone()
    }

    /// Number of fibers currently blocked joining this one
    pub fn joiner_count(&self) -> usize {
        self.inner.joiners.lock().len()
    }

    /// Whether the fiber was built to be resumable on any thread
    pub fn is_migratable(&self) -> bool {
        self.inner.migratable
    }

    /// Whether the fiber may be resumed on `thread`.
    ///
    /// A fiber that has never run may go anywhere. Once started, only a
    /// migratable fiber may leave the thread it first ran on.
    pub fn may_run_on(&self, thread: ThreadId) -> bool {
        self.inner.migratable || self.inner.home.get().map_or(true, |home| *home == thread)
    }

    /// Whether the fiber may be handed to a scheduler on any other thread
    pub(crate) fn may_leave_thread(&self) -> bool {
        self.inner.migratable || self.inner.home.get().is_none()
    }

    /// Whether both handles refer to the same fiber
    pub fn ptr_eq(&self, other: &Fiber) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn set_priority(&self, priority: i32) {
        self.inner.priority.store(priority, Ordering::Relaxed);
    }

    /// Move to `to`, returning the previous state
    pub(crate) fn set_state(&self, to: FiberState) -> FiberState {
        let previous = FiberState::from_u8(self.inner.state.swap(to as u8, Ordering::AcqRel));
        debug_assert!(
            previous != FiberState::Terminated || to == FiberState::Terminated,
            "{} left the terminated state for {:?}",
            self,
            to
        );
        previous
    }

    /// Move from `from` to `to` only if the fiber is still in `from`
    pub(crate) fn compare_set_state(&self, from: FiberState, to: FiberState) -> bool {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn mark_yielded(&self) {
        self.inner.yielded.store(true, Ordering::Release);
    }

    /// Whether the last suspension was a yield still waiting to be filed
    pub(crate) fn take_yielded(&self) -> bool {
        self.inner.yielded.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn record_failure(&self, message: String) {
        *self.inner.failure.lock() = Some(message);
    }

    /// Register `joiner`, unless this fiber already terminated.
    ///
    /// Termination is published before the joiner list is drained, so a
    /// joiner accepted here is always seen by the drain.
    pub(crate) fn add_joiner(&self, joiner: &Fiber) -> bool {
        let mut joiners = self.inner.joiners.lock();
        if self.is_terminated() {
            return false;
        }
        joiners.push(Arc::downgrade(&joiner.inner));
        true
    }

    /// Drain the joiners that are still alive, in join order
    pub(crate) fn take_joiners(&self) -> Vec<Fiber> {
        let joiners = std::mem::take(&mut *self.inner.joiners.lock());
        joiners
            .into_iter()
            .filter_map(|weak| weak.upgrade())
            .map(Fiber::from_record)
            .collect()
    }

    /// Whether this fiber's stack is executing on the calling thread
    pub(crate) fn is_executing(&self) -> bool {
        self.inner.suspender.is_executing()
    }

    /// Mark the fiber running and switch into it.
    ///
    /// The context lock is held for the whole activation, so a second
    /// resume of the same fiber is reported instead of corrupting its stack.
    pub(crate) fn resume(&self) -> Result<Activation> {
        let mut slot = match self.inner.context.try_lock() {
            Some(slot) => slot,
            None => return violation(format!("{} is already executing", self)),
        };
        let context = match slot.as_mut() {
            Some(context) if !context.is_finished() => context,
            _ => return violation(format!("{} has no resumable context", self)),
        };
        let here = thread::current().id();
        if !self.inner.migratable && *self.inner.home.get_or_init(|| here) != here {
            return violation(format!("{} is pinned to another thread", self));
        }

        self.set_state(FiberState::Running);
        let activation = context.resume();
        if matches!(activation, Activation::Finished(_)) {
            *slot = None;
        }
        Ok(activation)
    }

    /// Prepare to park this fiber without holding a strong reference to it
    pub(crate) fn park(&self) -> Parked {
        Parked {
            fiber: Arc::downgrade(&self.inner),
            suspender: Arc::clone(&self.inner.suspender),
        }
    }
}

impl PartialEq for Fiber {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Fiber {}

impl fmt::Display for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", self.id(), name),
            None => write!(f, "{}", self.id()),
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .field("priority", &self.priority())
            .finish()
    }
}

/// A fiber about to suspend, detached from its own strong references
pub(crate) struct Parked {
    fiber: Weak<FiberRecord>,
    suspender: Arc<Suspender>,
}

impl Parked {
    /// Suspend, then check the fiber came back running.
    ///
    /// Nothing scheduler-owned is touched after the switch: the fiber may be
    /// resumed by a different scheduler on a different thread.
    pub(crate) fn suspend(self) -> Result<()> {
        self.suspender.suspend()?;
        match self.fiber.upgrade().map(Fiber::from_record) {
            Some(fiber) if fiber.is_running() => Ok(()),
            Some(fiber) => violation(format!(
                "{} was resumed in state {:?}",
                fiber,
                fiber.state()
            )),
            None => violation("fiber was resumed after its record was released"),
        }
    }
}

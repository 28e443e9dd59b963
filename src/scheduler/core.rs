//! Per-thread cooperative scheduler
//!
//! A [`Scheduler`] owns the active fiber slot, the ready queue, the tracking
//! set and the sleep set. Every operation except migration runs on the
//! thread that created the scheduler; fibers hand control back to it only at
//! explicit suspension points (yield, wait, sleep, join, termination).

use std::cell::RefCell;
use std::cmp::Reverse;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::migrate::Migrator;
use super::queue::{ReadyQueue, SleepSet, TrackingSet};
use crate::context::{panic_message, Activation, Outcome, MIN_STACK_SIZE};
use crate::error::{ensure, violation, Error, Result};
use crate::fiber::{Fiber, FiberState, Parked};
use crate::routine::{deadline_after, Builder, FiberContext, JoinHandle, DEFAULT_STACK_SIZE};

thread_local! {
    /// Scheduler driving the fiber executing on this thread
    static DRIVER: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Name used in log lines
    pub name: String,
    /// Stack size for fibers built through this scheduler
    pub stack_size: usize,
    /// Priority for fibers built through this scheduler
    pub default_priority: i32,
    /// Order each partition batch by priority (otherwise pure FIFO)
    pub priority_ordering: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "fibers".to_string(),
            stack_size: DEFAULT_STACK_SIZE,
            default_priority: 0,
            priority_ordering: true,
        }
    }
}

impl SchedulerConfig {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig {
                reason: "scheduler name must not be empty".to_string(),
            });
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "stack size {} is below the minimum of {} bytes",
                    self.stack_size, MIN_STACK_SIZE
                ),
            });
        }
        Ok(())
    }
}

/// Scheduler statistics
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Fibers started through `spawn`
    pub spawned: AtomicUsize,
    /// Context switches into a fiber
    pub activations: AtomicUsize,
    /// Partition passes over the tracking set
    pub partition_passes: AtomicUsize,
    /// Voluntary yields
    pub yields: AtomicUsize,
    /// Blocking waits on a primitive
    pub waits: AtomicUsize,
    /// Joins, from fibers or from the scheduler thread
    pub joins: AtomicUsize,
    /// Sleeps that actually suspended
    pub sleeps: AtomicUsize,
    /// Sleepers moved back to the ready queue
    pub sleep_wakeups: AtomicUsize,
    /// Fibers that returned or panicked
    pub terminations: AtomicUsize,
    /// Fibers received through migration
    pub migrated_in: AtomicUsize,
    /// Fibers given away through migration
    pub migrated_out: AtomicUsize,
}

impl Clone for SchedulerStats {
    fn clone(&self) -> Self {
        let load = |counter: &AtomicUsize| AtomicUsize::new(counter.load(Ordering::Relaxed));
        SchedulerStats {
            spawned: load(&self.spawned),
            activations: load(&self.activations),
            partition_passes: load(&self.partition_passes),
            yields: load(&self.yields),
            waits: load(&self.waits),
            joins: load(&self.joins),
            sleeps: load(&self.sleeps),
            sleep_wakeups: load(&self.sleep_wakeups),
            terminations: load(&self.terminations),
            migrated_in: load(&self.migrated_in),
            migrated_out: load(&self.migrated_out),
        }
    }
}

/// Where a fiber that yielded goes once its stack has switched out
#[derive(Debug, Clone, Copy)]
enum Filing {
    /// Back of the ready queue (activation from `run`)
    Requeue,
    /// Tracking set, for the next partition pass (activation from `spawn`)
    Track,
}

struct Inner {
    config: SchedulerConfig,
    name: Arc<str>,
    owner: ThreadId,
    active: Mutex<Option<Fiber>>,
    ready: Arc<ReadyQueue>,
    tracking: Mutex<TrackingSet>,
    sleeping: Mutex<SleepSet>,
    stats: Arc<SchedulerStats>,
}

/// Cooperative scheduler for the fibers of one OS thread
///
/// Clones share the same scheduler. The locks inside are never contended by
/// scheduler operations themselves; they exist so a suspended fiber can be
/// migrated to another thread's scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler owned by the calling thread
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_config(config))
    }

    /// Create a scheduler with the default configuration
    pub fn with_defaults() -> Self {
        Self::from_config(SchedulerConfig::default())
    }

    fn from_config(config: SchedulerConfig) -> Self {
        log::debug!("{}: scheduler created", config.name);
        Self {
            inner: Arc::new(Inner {
                name: Arc::from(config.name.as_str()),
                config,
                owner: thread::current().id(),
                active: Mutex::new(None),
                ready: Arc::new(ReadyQueue::new()),
                tracking: Mutex::new(TrackingSet::new()),
                sleeping: Mutex::new(SleepSet::new()),
                stats: Arc::new(SchedulerStats::default()),
            }),
        }
    }

    /// The scheduler driving the fiber executing on this thread, if any
    // Not inlined: a migrated fiber must see its new thread's driver
    #[inline(never)]
    pub fn current() -> Option<Scheduler> {
        DRIVER.with(|driver| driver.borrow().clone())
    }

    /// Get the scheduler name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get the configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> SchedulerStats {
        (*self.inner.stats).clone()
    }

    /// Whether both handles refer to the same scheduler
    pub fn ptr_eq(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The fiber currently executing on this scheduler
    pub fn active(&self) -> Option<Fiber> {
        self.inner.active.lock().clone()
    }

    /// Number of fibers queued to run
    pub fn ready_len(&self) -> usize {
        self.inner.ready.len()
    }

    /// Number of fibers waiting or awaiting the next partition pass
    pub fn tracked_len(&self) -> usize {
        self.inner.tracking.lock().len()
    }

    /// Number of sleeping fibers
    pub fn sleeping_len(&self) -> usize {
        self.inner.sleeping.lock().len()
    }

    /// Earliest wake deadline among sleeping fibers
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.sleeping.lock().next_deadline()
    }

    /// A fiber builder carrying this scheduler's defaults
    pub fn builder(&self) -> Builder {
        Builder::new()
            .priority(self.inner.config.default_priority)
            .stack_size(self.inner.config.stack_size)
    }

    /// Build a fiber from a plain closure and spawn it
    pub fn go<F, T>(&self, body: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce(&FiberContext) -> T + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.builder().build(body)?;
        self.spawn(handle.fiber())?;
        Ok(handle)
    }

    /// Build a fiber from a future-returning closure and spawn it
    pub fn go_async<F, Fut>(&self, body: F) -> Result<JoinHandle<Fut::Output>>
    where
        F: FnOnce(&FiberContext) -> Fut + Send + 'static,
        Fut: Future + 'static,
        Fut::Output: Send + 'static,
    {
        let handle = self.builder().build_async(body)?;
        self.spawn(handle.fiber())?;
        Ok(handle)
    }

    /// Run a fresh fiber synchronously until it first suspends or finishes.
    ///
    /// A fiber still alive afterwards is tracked and picked up by a later
    /// partition pass.
    pub fn spawn(&self, fiber: &Fiber) -> Result<()> {
        self.check_owner("spawn")?;
        ensure(!fiber.is_terminated(), || {
            format!("cannot spawn {}: it already terminated", fiber)
        })?;
        ensure(
            self.active().map_or(true, |active| !active.ptr_eq(fiber)),
            || format!("cannot spawn {}: it is the active fiber", fiber),
        )?;
        ensure(fiber.is_ready(), || {
            format!("cannot spawn {} in state {:?}", fiber, fiber.state())
        })?;
        ensure(
            !self.inner.ready.contains(fiber) && !self.inner.tracking.lock().contains(fiber),
            || format!("cannot spawn {}: it is already scheduled", fiber),
        )?;

        log::debug!("{}: spawning {}", self.name(), fiber);
        self.inner.stats.spawned.fetch_add(1, Ordering::Relaxed);
        self.activate(fiber, Filing::Track)
    }

    /// Advance by exactly one fiber activation.
    ///
    /// Returns `false` when no fiber was ready to run.
    pub fn run(&self) -> Result<bool> {
        self.check_owner("run")?;
        self.wake_sleepers(Instant::now());
        if self.inner.ready.is_empty() {
            self.partition();
        }

        let fiber = match self.inner.ready.pop_front() {
            Some(fiber) => fiber,
            None => return Ok(false),
        };
        ensure(fiber.is_ready(), || {
            format!("{} was queued as ready in state {:?}", fiber, fiber.state())
        })?;

        self.activate(&fiber, Filing::Requeue)?;
        Ok(true)
    }

    /// Run until nothing is ready, sleeping through idle gaps before deadlines.
    ///
    /// Fibers left waiting stay tracked. Returns the number of activations.
    pub fn run_until_idle(&self) -> Result<usize> {
        self.check_owner("run_until_idle")?;
        if let Some(active) = self.active() {
            return violation(format!(
                "{}: run_until_idle called from inside {}",
                self.name(),
                active
            ));
        }

        let mut activations = 0;
        loop {
            if self.run()? {
                activations += 1;
                continue;
            }
            match self.next_deadline() {
                Some(deadline) => thread::sleep(deadline.saturating_duration_since(Instant::now())),
                None => return Ok(activations),
            }
        }
    }

    /// Give every other ready fiber a turn; called from the active fiber
    pub fn yield_now(&self) -> Result<()> {
        self.prepare_yield()?.suspend()
    }

    /// Block the active fiber, releasing `lock` after it is marked waiting.
    ///
    /// Synchronization primitives hold their own lock while deciding to block
    /// and hand it in here; another fiber wakes the waiter with
    /// [`notify`](Self::notify).
    pub fn wait<G>(&self, lock: G) -> Result<()> {
        self.prepare_wait(lock)?.suspend()
    }

    /// Suspend the active fiber until `deadline`
    pub fn sleep(&self, deadline: Instant) -> Result<()> {
        match self.prepare_sleep(deadline)? {
            Some(parked) => parked.suspend(),
            None => Ok(()),
        }
    }

    /// Suspend the active fiber for at least `duration`
    pub fn sleep_for(&self, duration: Duration) -> Result<()> {
        self.sleep(deadline_after(duration))
    }

    /// Block until `target` terminates.
    ///
    /// From inside a fiber the caller is parked until `target` ends. From the
    /// scheduler thread itself the scheduler is driven until it does.
    pub fn join(&self, target: &Fiber) -> Result<()> {
        self.check_owner("join")?;
        if self.active().is_some() {
            if let Some(parked) = self.prepare_join(target)? {
                parked.suspend()?;
            }
            return ensure_joined(target);
        }

        ensure(!target.is_terminated(), || {
            format!("cannot join {}: it already terminated", target)
        })?;
        self.inner.stats.joins.fetch_add(1, Ordering::Relaxed);
        log::trace!("{}: driving until {} terminates", self.name(), target);

        while !target.is_terminated() {
            if self.run()? {
                continue;
            }
            match self.next_deadline() {
                Some(deadline) => thread::sleep(deadline.saturating_duration_since(Instant::now())),
                None => {
                    log::warn!("{}: {} can no longer make progress", self.name(), target);
                    return Err(Error::Stalled {
                        fiber: target.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Cancellation is not supported; the scheduler is left untouched
    pub fn cancel(&self, target: &Fiber) -> Result<()> {
        log::warn!("{}: refusing to cancel {}", self.name(), target);
        Err(Error::Unsupported {
            operation: "cancel",
        })
    }

    /// Wake a fiber blocked in [`wait`](Self::wait), behind every ready fiber
    pub fn notify(&self, fiber: &Fiber) -> Result<()> {
        self.check_owner("notify")?;
        ensure(fiber.is_waiting(), || {
            format!("cannot notify {} in state {:?}", fiber, fiber.state())
        })?;
        let removed = self.inner.tracking.lock().remove(fiber);
        ensure(removed, || {
            format!("cannot notify {}: it is not parked on {}", fiber, self.name())
        })?;

        fiber.set_state(FiberState::Ready);
        self.inner.ready.push_back(fiber.clone());
        log::trace!("{}: notified {}", self.name(), fiber);
        Ok(())
    }

    /// Change `fiber`'s priority; it takes effect at the next partition pass
    pub fn priority(&self, fiber: &Fiber, priority: i32) -> Result<()> {
        self.check_owner("priority")?;
        fiber.set_priority(priority);
        Ok(())
    }

    /// Thread-safe handle for moving ready fibers in and out
    pub fn migrator(&self) -> Migrator {
        Migrator::new(
            Arc::clone(&self.inner.name),
            self.inner.owner,
            Arc::clone(&self.inner.ready),
            Arc::clone(&self.inner.stats),
        )
    }

    /// Accept a ready fiber from another scheduler; safe from any thread
    pub fn migrate_to(&self, fiber: Fiber) -> Result<()> {
        self.migrator().migrate_to(fiber)
    }

    /// Give away the most recently queued ready fiber; safe from any thread
    pub fn migrate_from(&self) -> Option<Fiber> {
        self.migrator().migrate_from()
    }

    pub(crate) fn prepare_yield(&self) -> Result<Parked> {
        let fiber = self.running_fiber("yield")?;
        fiber.set_state(FiberState::Ready);
        fiber.mark_yielded();
        self.inner.stats.yields.fetch_add(1, Ordering::Relaxed);
        log::trace!("{}: {} yields", self.name(), fiber);
        Ok(fiber.park())
    }

    pub(crate) fn prepare_wait<G>(&self, lock: G) -> Result<Parked> {
        let fiber = self.running_fiber("wait")?;
        fiber.set_state(FiberState::Waiting);
        self.inner.tracking.lock().push(fiber.clone());
        // Observers must find the fiber waiting once the lock is free
        drop(lock);
        self.inner.stats.waits.fetch_add(1, Ordering::Relaxed);
        log::trace!("{}: {} waits", self.name(), fiber);
        Ok(fiber.park())
    }

    pub(crate) fn prepare_sleep(&self, deadline: Instant) -> Result<Option<Parked>> {
        let fiber = self.running_fiber("sleep")?;
        if deadline <= Instant::now() {
            return Ok(None);
        }
        fiber.set_state(FiberState::Sleeping);
        self.inner.sleeping.lock().insert(deadline, fiber.clone());
        self.inner.stats.sleeps.fetch_add(1, Ordering::Relaxed);
        log::trace!("{}: {} sleeps", self.name(), fiber);
        Ok(Some(fiber.park()))
    }

    /// Park the active fiber on `target`; `None` if it ended meanwhile
    pub(crate) fn prepare_join(&self, target: &Fiber) -> Result<Option<Parked>> {
        let fiber = self.running_fiber("join")?;
        ensure(!target.ptr_eq(&fiber), || format!("{} cannot join itself", fiber))?;
        ensure(!target.is_terminated(), || {
            format!("{} cannot join {}: it already terminated", fiber, target)
        })?;

        // Filed before the target can see it: it may end on another thread
        fiber.set_state(FiberState::Waiting);
        self.inner.tracking.lock().push(fiber.clone());
        if !target.add_joiner(&fiber) {
            self.inner.tracking.lock().remove(&fiber);
            fiber.set_state(FiberState::Running);
            log::trace!("{}: {} ended before {} could join", self.name(), target, fiber);
            return Ok(None);
        }

        self.inner.stats.joins.fetch_add(1, Ordering::Relaxed);
        log::trace!("{}: {} joins {}", self.name(), fiber, target);
        Ok(Some(fiber.park()))
    }

    fn check_owner(&self, operation: &str) -> Result<()> {
        ensure(thread::current().id() == self.inner.owner, || {
            format!(
                "{}: {} called off the owning thread",
                self.name(),
                operation
            )
        })
    }

    /// The active fiber, provided its own stack is the caller
    fn running_fiber(&self, operation: &str) -> Result<Fiber> {
        self.check_owner(operation)?;
        let active = self.inner.active.lock().clone();
        let fiber = match active {
            Some(fiber) => fiber,
            None => {
                return violation(format!(
                    "{}: {} called with no active fiber",
                    self.name(),
                    operation
                ))
            }
        };
        ensure(fiber.is_running() && fiber.is_executing(), || {
            format!(
                "{}: {} called from outside the active fiber {}",
                self.name(),
                operation,
                fiber
            )
        })?;
        Ok(fiber)
    }

    /// Switch into `fiber` and settle its bookkeeping once control returns
    fn activate(&self, fiber: &Fiber, filing: Filing) -> Result<()> {
        let previous = self.inner.active.lock().replace(fiber.clone());
        if let Some(displaced) = &previous {
            displaced.set_state(FiberState::Waiting);
        }
        let driver = DRIVER.with(|driver| driver.replace(Some(self.clone())));
        let guard = ActivationGuard {
            scheduler: self,
            previous,
            driver,
        };

        self.inner.stats.activations.fetch_add(1, Ordering::Relaxed);
        log::trace!("{}: resuming {}", self.name(), fiber);
        let activation = fiber.resume();
        drop(guard);

        match activation? {
            Activation::Suspended => self.file_suspended(fiber, filing),
            Activation::Finished(outcome) => self.retire(fiber, outcome),
        }
    }

    fn file_suspended(&self, fiber: &Fiber, filing: Filing) -> Result<()> {
        if !fiber.take_yielded() {
            // Filed by the wait, sleep or join that parked it. A join target
            // ending on another thread may already have made it ready.
            return match fiber.state() {
                FiberState::Waiting | FiberState::Sleeping | FiberState::Ready => Ok(()),
                state => violation(format!("{} suspended in state {:?}", fiber, state)),
            };
        }
        match fiber.state() {
            FiberState::Ready => {
                match filing {
                    Filing::Requeue => self.inner.ready.push_back(fiber.clone()),
                    Filing::Track => self.inner.tracking.lock().push(fiber.clone()),
                }
                Ok(())
            }
            state => violation(format!("{} yielded but suspended in state {:?}", fiber, state)),
        }
    }

    fn retire(&self, fiber: &Fiber, outcome: Outcome) -> Result<()> {
        if let Err(payload) = outcome {
            let message = panic_message(&*payload);
            log::debug!("{}: {} panicked: {}", self.name(), fiber, message);
            fiber.record_failure(message);
        }
        fiber.set_state(FiberState::Terminated);
        self.inner.stats.terminations.fetch_add(1, Ordering::Relaxed);
        log::debug!("{}: {} terminated", self.name(), fiber);

        let mut strays = Vec::new();
        for joiner in fiber.take_joiners() {
            if !joiner.compare_set_state(FiberState::Waiting, FiberState::Ready) {
                strays.push(format!("{} ({:?})", joiner, joiner.state()));
                continue;
            }
            // A joiner parked on another scheduler is picked up by its own partition pass
            if self.inner.tracking.lock().remove(&joiner) {
                self.inner.ready.push_back(joiner);
            }
        }
        ensure(strays.is_empty(), || {
            format!("{} had joiners that were not waiting: {}", fiber, strays.join(", "))
        })
    }

    /// Move every ready tracked fiber to the ready queue
    fn partition(&self) {
        let mut partition = self.inner.tracking.lock().partition();
        self.inner.stats.partition_passes.fetch_add(1, Ordering::Relaxed);
        if self.inner.config.priority_ordering {
            partition.ready.sort_by_key(|fiber| Reverse(fiber.priority()));
        }
        log::trace!(
            "{}: partition pass moved {} fibers, retired {}",
            self.name(),
            partition.ready.len(),
            partition.retired
        );
        self.inner.ready.extend(partition.ready);
    }

    /// Put expired sleepers at the front of the ready queue, earliest first
    fn wake_sleepers(&self, now: Instant) {
        let expired = self.inner.sleeping.lock().pop_expired(now);
        if expired.is_empty() {
            return;
        }
        self.inner
            .stats
            .sleep_wakeups
            .fetch_add(expired.len(), Ordering::Relaxed);
        for fiber in expired.into_iter().rev() {
            fiber.set_state(FiberState::Ready);
            self.inner.ready.push_front(fiber);
        }
    }
}

/// Check a resumed joiner's target really ended
pub(crate) fn ensure_joined(target: &Fiber) -> Result<()> {
    ensure(target.is_terminated(), || {
        format!("joiner resumed before {} terminated", target)
    })
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name())
            .field("active", &self.active().map(|fiber| fiber.id()))
            .field("ready", &self.ready_len())
            .field("tracked", &self.tracked_len())
            .field("sleeping", &self.sleeping_len())
            .finish()
    }
}

/// Restores the active slot and the thread's driver when an activation ends
struct ActivationGuard<'a> {
    scheduler: &'a Scheduler,
    previous: Option<Fiber>,
    driver: Option<Scheduler>,
}

impl Drop for ActivationGuard<'_> {
    fn drop(&mut self) {
        let previous = self.previous.take();
        if let Some(displaced) = &previous {
            displaced.set_state(FiberState::Running);
        }
        *self.scheduler.inner.active.lock() = previous;
        let driver = self.driver.take();
        DRIVER.with(|slot| *slot.borrow_mut() = driver);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn failure_of(handle: JoinHandle<()>, scheduler: &Scheduler) -> String {
        match handle.join(scheduler) {
            Err(Error::FiberPanicked { message, .. }) => message,
            other => panic!("expected a failed fiber, got {:?}", other),
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(Scheduler::new(SchedulerConfig::default()).is_ok());

        let tiny = SchedulerConfig {
            stack_size: 1024,
            ..Default::default()
        };
        assert!(matches!(
            Scheduler::new(tiny),
            Err(Error::InvalidConfig { .. })
        ));

        let unnamed = SchedulerConfig {
            name: String::new(),
            ..Default::default()
        };
        assert!(Scheduler::new(unnamed).is_err());
    }

    #[test]
    fn test_spawn_runs_until_first_yield() {
        let scheduler = Scheduler::with_defaults();
        let steps = Arc::new(AtomicUsize::new(0));
        let steps_clone = Arc::clone(&steps);

        let handle = scheduler
            .go(move |cx| {
                for _ in 0..5 {
                    steps_clone.fetch_add(1, Ordering::Relaxed);
                    cx.yield_now().unwrap();
                }
            })
            .unwrap();

        assert_eq!(steps.load(Ordering::Relaxed), 1);
        assert!(handle.fiber().is_ready());
        assert_eq!(scheduler.tracked_len(), 1);
        assert_eq!(scheduler.ready_len(), 0);
        assert!(scheduler.active().is_none());

        for _ in 0..5 {
            assert!(scheduler.run().unwrap());
        }
        assert!(handle.is_finished());
        assert_eq!(steps.load(Ordering::Relaxed), 5);
        assert!(!scheduler.run().unwrap());
        assert_eq!(scheduler.tracked_len(), 0);
        assert_eq!(scheduler.ready_len(), 0);
    }

    #[test]
    fn test_scheduler_join_drives_until_terminated() {
        let scheduler = Scheduler::with_defaults();
        let handle = scheduler
            .builder()
            .build(|cx| {
                cx.yield_now().unwrap();
                cx.yield_now().unwrap();
                "done"
            })
            .unwrap();

        scheduler.migrate_to(handle.fiber().clone()).unwrap();
        scheduler.join(handle.fiber()).unwrap();
        assert!(handle.is_finished());
        assert_eq!(scheduler.stats().activations.load(Ordering::Relaxed), 3);
        assert_eq!(handle.join(&scheduler).unwrap(), "done");
    }

    #[test]
    fn test_join_from_fiber_parks_joiner() {
        let scheduler = Scheduler::with_defaults();
        let log = recorder();

        let target_log = Arc::clone(&log);
        let target = scheduler
            .go(move |cx| {
                cx.yield_now().unwrap();
                target_log.lock().push("target done");
                11
            })
            .unwrap();

        let joiner_log = Arc::clone(&log);
        let target_fiber = target.fiber().clone();
        let joiner = scheduler
            .go(move |cx| {
                cx.join(&target_fiber).unwrap();
                joiner_log.lock().push("joiner resumed");
            })
            .unwrap();

        assert!(joiner.fiber().is_waiting());
        assert_eq!(target.fiber().joiner_count(), 1);

        // Target finishes and hands the joiner straight to the ready queue
        assert!(scheduler.run().unwrap());
        assert!(target.is_finished());
        assert!(joiner.fiber().is_ready());
        assert_eq!(scheduler.ready_len(), 1);

        assert!(scheduler.run().unwrap());
        assert!(joiner.is_finished());
        assert_eq!(*log.lock(), vec!["target done", "joiner resumed"]);
        assert_eq!(target.join(&scheduler).unwrap(), 11);
    }

    #[test]
    fn test_partition_orders_by_priority() {
        let scheduler = Scheduler::with_defaults();
        let log = recorder();

        for (name, priority) in [("low", 1), ("high", 5), ("mid", 3)] {
            let log = Arc::clone(&log);
            let handle = scheduler
                .builder()
                .priority(priority)
                .build(move |cx| {
                    cx.yield_now().unwrap();
                    log.lock().push(name);
                })
                .unwrap();
            scheduler.spawn(handle.fiber()).unwrap();
        }

        while scheduler.run().unwrap() {}
        assert_eq!(*log.lock(), vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_partition_without_priority_is_fifo() {
        let config = SchedulerConfig {
            priority_ordering: false,
            ..Default::default()
        };
        let scheduler = Scheduler::new(config).unwrap();
        let log = recorder();

        for (name, priority) in [("first", 1), ("second", 5)] {
            let log = Arc::clone(&log);
            let handle = scheduler
                .builder()
                .priority(priority)
                .build(move |cx| {
                    cx.yield_now().unwrap();
                    log.lock().push(name);
                })
                .unwrap();
            scheduler.spawn(handle.fiber()).unwrap();
        }

        assert_eq!(scheduler.run_until_idle().unwrap(), 2);
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_expired_sleeper_jumps_the_queue() {
        let scheduler = Scheduler::with_defaults();
        let log = recorder();

        let sleeper_log = Arc::clone(&log);
        let sleeper = scheduler
            .go(move |cx| {
                cx.sleep_for(Duration::from_millis(50)).unwrap();
                sleeper_log.lock().push("sleeper");
            })
            .unwrap();
        assert!(sleeper.fiber().is_sleeping());
        assert_eq!(scheduler.sleeping_len(), 1);

        for name in ["b", "c"] {
            let log = Arc::clone(&log);
            scheduler
                .go(move |cx| {
                    cx.yield_now().unwrap();
                    log.lock().push(name);
                })
                .unwrap();
        }

        // b runs and finishes, c stays queued
        assert!(scheduler.run().unwrap());
        assert_eq!(scheduler.ready_len(), 1);

        thread::sleep(Duration::from_millis(60));
        assert!(scheduler.run().unwrap());
        assert!(scheduler.run().unwrap());
        assert_eq!(*log.lock(), vec!["b", "sleeper", "c"]);
        assert_eq!(scheduler.stats().sleep_wakeups.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_past_deadline_does_not_suspend() {
        let scheduler = Scheduler::with_defaults();
        let handle = scheduler
            .go(|cx| {
                cx.sleep_until(Instant::now() - Duration::from_millis(1)).unwrap();
            })
            .unwrap();

        assert!(handle.is_finished());
        assert_eq!(scheduler.stats().sleeps.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_wait_releases_lock_after_marking_waiting() {
        let scheduler = Scheduler::with_defaults();
        let resource = Arc::new(Mutex::new(0u32));
        let observed_waiting = Arc::new(AtomicBool::new(false));

        let waiter_resource = Arc::clone(&resource);
        let waiter = scheduler
            .go(move |cx| {
                let guard = waiter_resource.lock();
                cx.wait(guard).unwrap();
                *waiter_resource.lock() += 1;
            })
            .unwrap();

        assert!(waiter.fiber().is_waiting());
        assert!(resource.try_lock().is_some());

        let waiter_fiber = waiter.fiber().clone();
        let observer_flag = Arc::clone(&observed_waiting);
        scheduler
            .go(move |cx| {
                observer_flag.store(waiter_fiber.is_waiting(), Ordering::Relaxed);
                cx.scheduler().unwrap().notify(&waiter_fiber).unwrap();
            })
            .unwrap();

        assert!(observed_waiting.load(Ordering::Relaxed));
        assert!(waiter.fiber().is_ready());
        assert!(scheduler.run().unwrap());
        assert!(waiter.is_finished());
        assert_eq!(*resource.lock(), 1);
    }

    #[test]
    fn test_cancel_is_unsupported() {
        let scheduler = Scheduler::with_defaults();
        let handle = scheduler
            .go(|cx| {
                cx.yield_now().unwrap();
            })
            .unwrap();

        let err = scheduler.cancel(handle.fiber()).unwrap_err();
        assert_eq!(err, Error::Unsupported { operation: "cancel" });
        assert!(handle.fiber().is_ready());
        assert_eq!(scheduler.tracked_len(), 1);
    }

    #[test]
    fn test_nested_spawn_displaces_parent() {
        let scheduler = Scheduler::with_defaults();
        let parent_state = Arc::new(Mutex::new(None));

        let state_slot = Arc::clone(&parent_state);
        let parent = scheduler
            .go(move |cx| {
                let parent = cx.fiber();
                let child = cx
                    .go(move |cx| {
                        *state_slot.lock() = Some(parent.state());
                        cx.id()
                    })
                    .unwrap();
                assert!(cx.fiber().is_running());
                child.join_in(cx).unwrap()
            })
            .unwrap();

        assert!(parent.is_finished());
        assert_eq!(*parent_state.lock(), Some(FiberState::Waiting));
        assert!(parent.join(&scheduler).is_ok());
    }

    #[test]
    fn test_current_is_set_only_inside_fibers() {
        let scheduler = Scheduler::with_defaults();
        assert!(Scheduler::current().is_none());

        let handle = scheduler
            .go(|_| Scheduler::current().map(|current| current.name().to_string()))
            .unwrap();
        assert_eq!(handle.join(&scheduler).unwrap(), Some("fibers".to_string()));
        assert!(Scheduler::current().is_none());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "no active fiber")]
    fn test_yield_outside_fiber_is_rejected() {
        let scheduler = Scheduler::with_defaults();
        let _ = scheduler.yield_now();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "already terminated")]
    fn test_spawning_terminated_fiber_is_rejected() {
        let scheduler = Scheduler::with_defaults();
        let handle = scheduler.go(|_| ()).unwrap();
        let _ = scheduler.spawn(handle.fiber());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "already terminated")]
    fn test_scheduler_join_of_terminated_fiber_is_rejected() {
        let scheduler = Scheduler::with_defaults();
        let handle = scheduler.go(|_| ()).unwrap();
        let _ = scheduler.join(handle.fiber());
    }

    #[test]
    #[cfg(debug_assertions)]
    fn test_fiber_join_of_terminated_fiber_is_rejected() {
        let scheduler = Scheduler::with_defaults();
        let done = scheduler.go(|_| ()).unwrap();

        let done_fiber = done.fiber().clone();
        let joiner = scheduler
            .go(move |cx| {
                let _ = cx.join(&done_fiber);
            })
            .unwrap();

        assert!(failure_of(joiner, &scheduler).contains("already terminated"));
        assert_eq!(done.fiber().joiner_count(), 0);
        assert_eq!(scheduler.tracked_len(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    fn test_fiber_joining_itself_is_rejected() {
        let scheduler = Scheduler::with_defaults();
        let handle = scheduler
            .go(|cx| {
                let _ = cx.join(&cx.fiber());
            })
            .unwrap();

        assert!(failure_of(handle, &scheduler).contains("cannot join itself"));
        assert_eq!(scheduler.tracked_len(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    fn test_spawning_the_active_fiber_is_rejected() {
        let scheduler = Scheduler::with_defaults();
        let handle = scheduler
            .go(|cx| {
                let _ = cx.scheduler().unwrap().spawn(&cx.fiber());
            })
            .unwrap();

        assert!(failure_of(handle, &scheduler).contains("is the active fiber"));
        assert_eq!(scheduler.stats().spawned.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_failed_activation_restores_active_fiber() {
        let scheduler = Scheduler::with_defaults();

        // Started on another thread, so resuming it here fails
        let stranger = Builder::new()
            .build(|cx| {
                cx.yield_now().unwrap();
            })
            .unwrap();
        let stranger_fiber = stranger.fiber().clone();
        thread::spawn(move || {
            let away = Scheduler::with_defaults();
            away.spawn(&stranger_fiber).unwrap();
        })
        .join()
        .unwrap();
        assert!(stranger.fiber().is_ready());

        let observed = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&observed);
        let target = stranger.fiber().clone();
        let parent = scheduler
            .go(move |cx| {
                let scheduler = cx.scheduler().unwrap();
                let spawned =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| scheduler.spawn(&target)));
                let me = cx.fiber();
                *slot.lock() = Some((
                    matches!(spawned, Ok(Ok(()))),
                    me.is_running(),
                    scheduler.active().is_some_and(|active| active.ptr_eq(&me)),
                    Scheduler::current().is_some_and(|current| current.ptr_eq(&scheduler)),
                ));
            })
            .unwrap();

        assert!(parent.is_finished());
        assert_eq!(*observed.lock(), Some((false, true, true, true)));
        assert!(parent.join(&scheduler).is_ok());
        assert!(scheduler.active().is_none());
        assert!(Scheduler::current().is_none());
        assert!(stranger.fiber().is_ready());
        assert_eq!(scheduler.ready_len() + scheduler.tracked_len(), 0);
    }

    #[test]
    fn test_target_ending_on_another_thread_mid_join() {
        let home = Scheduler::with_defaults();
        let target = Builder::new().build(|_| 5).unwrap();

        let target_fiber = target.fiber().clone();
        let joiner = home
            .go(move |cx| {
                let scheduler = cx.scheduler().unwrap();
                let parked = scheduler.prepare_join(&target_fiber).unwrap().unwrap();

                // The target runs to completion elsewhere before this stack switches out
                let away_fiber = target_fiber.clone();
                thread::spawn(move || {
                    let away = Scheduler::with_defaults();
                    away.migrate_to(away_fiber).unwrap();
                    assert_eq!(away.run_until_idle().unwrap(), 1);
                })
                .join()
                .unwrap();
                assert!(cx.fiber().is_ready());

                parked.suspend().unwrap();
                ensure_joined(&target_fiber).unwrap();
            })
            .unwrap();

        // Filed once, by the join itself
        assert!(joiner.fiber().is_ready());
        assert_eq!(home.tracked_len(), 1);
        assert_eq!(home.ready_len(), 0);

        assert_eq!(home.run_until_idle().unwrap(), 1);
        assert!(joiner.join(&home).is_ok());
        assert_eq!(target.join(&home).unwrap(), 5);
        assert_eq!(home.tracked_len() + home.ready_len(), 0);
    }

    #[test]
    fn test_join_with_nothing_runnable_stalls() {
        let scheduler = Scheduler::with_defaults();
        let resource = Arc::new(Mutex::new(()));
        let waiter_resource = Arc::clone(&resource);
        let handle = scheduler
            .go(move |cx| {
                let guard = waiter_resource.lock();
                cx.wait(guard).unwrap();
            })
            .unwrap();

        assert!(matches!(
            scheduler.join(handle.fiber()),
            Err(Error::Stalled { .. })
        ));
    }
}

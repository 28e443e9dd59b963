//! Fiber bodies, builders and join handles
//!
//! A body is anything that can be started on a fiber's stack and leaves a
//! value (or a panic) behind. Two kinds are supported: plain closures, and
//! closures returning a future, which is polled on the fiber's own stack and
//! yields the fiber to its scheduler whenever it is pending.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::task::{waker_ref, ArcWake};
use parking_lot::Mutex;

use crate::error::{violation, Error, Result};
use crate::fiber::{Fiber, FiberId, FiberRecord};
use crate::scheduler::core::ensure_joined;
use crate::scheduler::Scheduler;

/// Stack size used when none is configured
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

type Slot<T> = Arc<Mutex<Option<T>>>;

/// Something that can run on a fiber's stack
pub(crate) trait Body: Send {
    fn start(self: Box<Self>, cx: &FiberContext);
}

struct PlainBody<F, T> {
    body: F,
    slot: Slot<T>,
}

impl<F, T> Body for PlainBody<F, T>
where
    F: FnOnce(&FiberContext) -> T + Send,
    T: Send,
{
    fn start(self: Box<Self>, cx: &FiberContext) {
        let PlainBody { body, slot } = *self;
        let value = body(cx);
        *slot.lock() = Some(value);
    }
}

struct FutureBody<F, Fut: Future> {
    body: F,
    slot: Slot<Fut::Output>,
    _future: PhantomData<fn() -> Fut>,
}

impl<F, Fut> Body for FutureBody<F, Fut>
where
    F: FnOnce(&FiberContext) -> Fut + Send,
    Fut: Future,
    Fut::Output: Send,
{
    fn start(self: Box<Self>, cx: &FiberContext) {
        let FutureBody { body, slot, .. } = *self;
        let value = drive(cx, body(cx));
        *slot.lock() = Some(value);
    }
}

/// Waker that counts wakeups, for trace output only
#[derive(Default)]
struct FiberWaker {
    wakeups: AtomicUsize,
}

impl ArcWake for FiberWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.wakeups.fetch_add(1, Ordering::Relaxed);
    }
}

/// Poll `future` to completion, yielding the fiber after every pending poll.
///
/// The fiber is polled again each time it is scheduled, so a wakeup never
/// has to be acted on. A future that wakes itself still lets others run.
fn drive<Fut: Future>(cx: &FiberContext, future: Fut) -> Fut::Output {
    let mut future = Box::pin(future);
    let wake_handle = Arc::new(FiberWaker::default());
    let waker = waker_ref(&wake_handle);
    let mut context = Context::from_waker(&waker);

    loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut context) {
            return output;
        }
        log::trace!(
            "{} pending after {} wakeups",
            cx.id(),
            wake_handle.wakeups.swap(0, Ordering::Relaxed)
        );
        if let Err(err) = cx.yield_now() {
            panic!("future-returning fiber could not yield: {}", err);
        }
    }
}

/// The per-activation handle passed to every fiber body
///
/// It names the fiber being run and reaches the scheduler currently driving
/// it, which may change if the fiber is migrated.
pub struct FiberContext {
    fiber: Weak<FiberRecord>,
}

impl FiberContext {
    fn new(fiber: Weak<FiberRecord>) -> Self {
        Self { fiber }
    }

    /// The fiber this body runs on
    pub fn fiber(&self) -> Fiber {
        // The resumer holds a strong handle for the whole activation
        let record = self
            .fiber
            .upgrade()
            .expect("a running fiber is always referenced by its resumer");
        Fiber::from_record(record)
    }

    /// ID of the fiber this body runs on
    pub fn id(&self) -> FiberId {
        self.fiber().id()
    }

    /// The scheduler driving this fiber on the current thread
    pub fn scheduler(&self) -> Result<Scheduler> {
        match Scheduler::current() {
            Some(scheduler) => Ok(scheduler),
            None => violation(format!("{} is not being driven by a scheduler", self.id())),
        }
    }

    /// Give every other ready fiber a turn before continuing
    pub fn yield_now(&self) -> Result<()> {
        let parked = self.scheduler()?.prepare_yield()?;
        parked.suspend()
    }

    /// Park until `deadline`; returns at once if it already passed
    pub fn sleep_until(&self, deadline: Instant) -> Result<()> {
        match self.scheduler()?.prepare_sleep(deadline)? {
            Some(parked) => parked.suspend(),
            None => Ok(()),
        }
    }

    /// Park for at least `duration`
    pub fn sleep_for(&self, duration: Duration) -> Result<()> {
        self.sleep_until(deadline_after(duration))
    }

    /// Block until `target` terminates
    pub fn join(&self, target: &Fiber) -> Result<()> {
        if let Some(parked) = self.scheduler()?.prepare_join(target)? {
            parked.suspend()?;
        }
        ensure_joined(target)
    }

    /// Block this fiber, releasing `lock` once it is marked waiting.
    ///
    /// Another fiber wakes it with [`Scheduler::notify`].
    pub fn wait<G>(&self, lock: G) -> Result<()> {
        let parked = self.scheduler()?.prepare_wait(lock)?;
        parked.suspend()
    }

    /// Spawn a plain fiber on the driving scheduler
    pub fn go<F, T>(&self, body: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce(&FiberContext) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.scheduler()?.go(body)
    }

    /// Spawn a future-returning fiber on the driving scheduler
    pub fn go_async<F, Fut>(&self, body: F) -> Result<JoinHandle<Fut::Output>>
    where
        F: FnOnce(&FiberContext) -> Fut + Send + 'static,
        Fut: Future + 'static,
        Fut::Output: Send + 'static,
    {
        self.scheduler()?.go_async(body)
    }
}

impl fmt::Debug for FiberContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberContext").field("fiber", &self.id()).finish()
    }
}

/// Future that is pending exactly once before completing
///
/// Awaited inside a future-returning fiber body it yields the fiber to its
/// scheduler. Polled anywhere else it just asks to be polled again.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`]
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

pub(crate) fn deadline_after(duration: Duration) -> Instant {
    let now = Instant::now();
    // Saturate far in the future instead of overflowing
    now.checked_add(duration)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365 * 30))
}

/// Fiber factory with name, priority and stack size
#[derive(Debug, Clone)]
pub struct Builder {
    name: Option<String>,
    priority: i32,
    stack_size: usize,
    migratable: bool,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Create a builder with default priority and stack size
    pub fn new() -> Self {
        Self {
            name: None,
            priority: 0,
            stack_size: DEFAULT_STACK_SIZE,
            migratable: false,
        }
    }

    /// Name the fiber for logs and debugging
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the scheduling priority (higher runs sooner)
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the stack size in bytes
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Allow the fiber to be resumed on another thread after it has started.
    ///
    /// Without this a fiber may still migrate before its first activation,
    /// but is pinned to the thread it first ran on afterwards.
    ///
    /// # Safety
    ///
    /// Whatever the body keeps alive across a suspension point (a yield,
    /// wait, sleep or join) must be safe to use from another thread: no `Rc`,
    /// no lock guards, no references into thread-local storage. The caller
    /// must also make sure the fiber's last handle is released only where
    /// its stack may be unwound.
    #[allow(unsafe_code)]
    pub unsafe fn migratable(mut self) -> Self {
        self.migratable = true;
        self
    }

    /// Build a fiber running a plain closure. It does not run until spawned.
    pub fn build<F, T>(self, body: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce(&FiberContext) -> T + Send + 'static,
        T: Send + 'static,
    {
        let slot: Slot<T> = Arc::default();
        let body = PlainBody {
            body,
            slot: Arc::clone(&slot),
        };
        let fiber = self.into_fiber(Box::new(body))?;
        Ok(JoinHandle { fiber, slot })
    }

    /// Build a fiber whose closure returns a future to drive to completion
    pub fn build_async<F, Fut>(self, body: F) -> Result<JoinHandle<Fut::Output>>
    where
        F: FnOnce(&FiberContext) -> Fut + Send + 'static,
        Fut: Future + 'static,
        Fut::Output: Send + 'static,
    {
        let slot: Slot<Fut::Output> = Arc::default();
        let body = FutureBody {
            body,
            slot: Arc::clone(&slot),
            _future: PhantomData,
        };
        let fiber = self.into_fiber(Box::new(body))?;
        Ok(JoinHandle { fiber, slot })
    }

    fn into_fiber(self, body: Box<dyn Body>) -> Result<Fiber> {
        Fiber::new(
            self.name,
            self.priority,
            self.stack_size,
            self.migratable,
            move |record| {
                Box::new(move || {
                    let cx = FiberContext::new(record);
                    body.start(&cx);
                })
            },
        )
    }
}

/// Owned handle to a fiber and the value its body will produce
pub struct JoinHandle<T> {
    fiber: Fiber,
    slot: Slot<T>,
}

impl<T> JoinHandle<T> {
    /// The fiber behind this handle
    pub fn fiber(&self) -> &Fiber {
        &self.fiber
    }

    /// ID of the fiber behind this handle
    pub fn id(&self) -> FiberId {
        self.fiber.id()
    }

    /// Whether the body has returned or panicked
    pub fn is_finished(&self) -> bool {
        self.fiber.is_terminated()
    }

    /// Wait for the fiber and take its value.
    ///
    /// Works both from the scheduler's own thread (the scheduler is driven
    /// until the fiber ends) and from inside another fiber (which blocks).
    pub fn join(self, scheduler: &Scheduler) -> Result<T> {
        if !self.is_finished() {
            scheduler.join(&self.fiber)?;
        }
        self.outcome()
    }

    /// Wait for the fiber from inside another fiber's body
    pub fn join_in(self, cx: &FiberContext) -> Result<T> {
        if !self.is_finished() {
            cx.join(&self.fiber)?;
        }
        self.outcome()
    }

    /// Take the outcome if the fiber is finished, otherwise give the handle back
    pub fn try_join(self) -> std::result::Result<Result<T>, Self> {
        if self.is_finished() {
            Ok(self.outcome())
        } else {
            Err(self)
        }
    }

    pub(crate) fn take_value(&self) -> Option<T> {
        self.slot.lock().take()
    }

    fn outcome(self) -> Result<T> {
        match self.take_value() {
            Some(value) => Ok(value),
            None => Err(Error::FiberPanicked {
                fiber: self.fiber.to_string(),
                message: self
                    .fiber
                    .failure()
                    .unwrap_or_else(|| "no value was produced".to_string()),
            }),
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle").field("fiber", &self.fiber).finish()
    }
}

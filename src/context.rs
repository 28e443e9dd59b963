//! Stackful execution contexts backing each fiber
//!
//! Every fiber owns one `corosensei` coroutine with its own stack. The
//! scheduler drives it through [`ExecutionContext::resume`]; the fiber parks
//! itself through the [`Suspender`] it shares with the context.
//!
//! Note: This module uses unsafe code to keep the coroutine's yielder
//! reachable from scheduler calls made deep inside the fiber body, and to
//! let a suspended context change threads during migration.

#![allow(unsafe_code)] // Required for yielder hand-off and cross-thread migration

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::error::{violation, Error, Result};
use crate::fiber::FiberId;

/// Smallest stack a fiber may be given
pub const MIN_STACK_SIZE: usize = 16 * 1024;

thread_local! {
    /// Fiber whose stack is executing on this OS thread right now
    static EXECUTING: Cell<Option<FiberId>> = const { Cell::new(None) };
}

/// Result of a fiber body: `Err` carries the panic payload
pub(crate) type Outcome = std::thread::Result<()>;

/// Type-erased fiber entry point
pub(crate) type Entry = Box<dyn FnOnce() + Send + 'static>;

/// How a call to [`ExecutionContext::resume`] came back
pub(crate) enum Activation {
    /// The fiber parked itself and can be resumed again
    Suspended,
    /// The fiber body returned or panicked
    Finished(Outcome),
}

/// Parking capability shared between a fiber record and its coroutine
pub(crate) struct Suspender {
    id: FiberId,
    yielder: AtomicPtr<Yielder<(), ()>>,
    unwinding: AtomicBool,
}

impl Suspender {
    pub(crate) fn new(id: FiberId) -> Self {
        Self {
            id,
            yielder: AtomicPtr::new(ptr::null_mut()),
            unwinding: AtomicBool::new(false),
        }
    }

    /// Whether this fiber's stack is the one executing on the calling thread
    // Not inlined: after migration the thread-local must be looked up afresh
    #[inline(never)]
    pub(crate) fn is_executing(&self) -> bool {
        EXECUTING.with(Cell::get) == Some(self.id)
    }

    /// Park the fiber and return control to whoever resumed it.
    ///
    /// Returns once the fiber is resumed again, possibly on another thread.
    pub(crate) fn suspend(&self) -> Result<()> {
        if !self.is_executing() {
            return violation(format!(
                "{} tried to suspend while another stack was executing",
                self.id
            ));
        }
        let yielder = self.yielder.load(Ordering::Acquire);
        if yielder.is_null() {
            return violation(format!("{} has no live coroutine to suspend", self.id));
        }
        // SAFETY: the pointer is published by the coroutine when it starts and
        // cleared before it returns, so it is live while the body runs. We only
        // get here when this fiber's stack is the one executing, which is the
        // only place the yielder may be used from.
        unsafe { (*yielder).suspend(()) };
        Ok(())
    }
}

/// One coroutine plus its stack
pub(crate) struct ExecutionContext {
    coroutine: Coroutine<(), (), Outcome, DefaultStack>,
    suspender: Arc<Suspender>,
}

// SAFETY: a context is only reached through its fiber's mutex, so one thread
// resumes it at a time. The entry closure is `Send`. Once started, the stack
// may hold values that are not, so the fiber record pins it to the thread of
// its first resume and leaks it rather than unwind elsewhere. Only fibers
// built through the `unsafe` `Builder::migratable` escape the pin; that
// caller vouches for everything the body keeps across a suspension.
unsafe impl Send for ExecutionContext {}

impl ExecutionContext {
    /// Allocate a stack and wrap `entry` in a coroutine that has not started yet
    pub(crate) fn new(stack_size: usize, suspender: Arc<Suspender>, entry: Entry) -> Result<Self> {
        let stack = DefaultStack::new(stack_size.max(MIN_STACK_SIZE)).map_err(|e| {
            Error::StackAllocation {
                reason: e.to_string(),
            }
        })?;

        let shared = Arc::clone(&suspender);
        let coroutine = Coroutine::with_stack(stack, move |yielder: &Yielder<(), ()>, _: ()| {
            shared
                .yielder
                .store(yielder as *const Yielder<(), ()> as *mut _, Ordering::Release);
            let outcome = panic::catch_unwind(AssertUnwindSafe(entry));
            shared.yielder.store(ptr::null_mut(), Ordering::Release);
            match outcome {
                // Forced unwind of a dropped context must reach corosensei
                Err(payload) if shared.unwinding.load(Ordering::Acquire) => {
                    panic::resume_unwind(payload)
                }
                outcome => outcome,
            }
        });

        Ok(Self {
            coroutine,
            suspender,
        })
    }

    /// Run the fiber until it suspends or finishes
    pub(crate) fn resume(&mut self) -> Activation {
        let previous = EXECUTING.with(|cell| cell.replace(Some(self.suspender.id)));
        let result = self.coroutine.resume(());
        EXECUTING.with(|cell| cell.set(previous));

        match result {
            CoroutineResult::Yield(()) => Activation::Suspended,
            CoroutineResult::Return(outcome) => Activation::Finished(outcome),
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.coroutine.done()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.suspender.unwinding.store(true, Ordering::Release);
    }
}

/// Render a panic payload as text
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

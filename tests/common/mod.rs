//! Common test harness for rust-fibers tests
//!
//! Provides a scheduler-per-test runner, an event recorder shared between
//! fibers, and a minimal blocking primitive built on `wait`/`notify`.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rust_fibers::prelude::*;

/// Run a test body against a fresh scheduler, then check nothing leaked
///
/// The scheduler is driven until idle after the body returns; every fiber
/// must have finished by then.
pub fn run_test<F>(test_fn: F)
where
    F: FnOnce(&Scheduler),
{
    let scheduler = Scheduler::with_defaults();
    test_fn(&scheduler);

    scheduler.run_until_idle().unwrap();
    assert!(scheduler.active().is_none());
    assert_eq!(scheduler.ready_len(), 0);
    assert_eq!(scheduler.tracked_len(), 0);
    assert_eq!(scheduler.sleeping_len(), 0);
}

/// Ordered log of events, shared by clones
#[derive(Clone, Default)]
pub struct Recorder<T> {
    events: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone> Recorder<T> {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, event: T) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<T> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }
}

struct GateState {
    open: bool,
    waiters: VecDeque<Fiber>,
}

/// One-shot gate: fibers block until it is opened, then all pass
///
/// Built the way a real primitive uses the scheduler: the gate's own lock is
/// handed to `wait`, and opening notifies every waiter in arrival order.
pub struct Gate {
    state: Mutex<GateState>,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                open: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Block the calling fiber until the gate opens
    pub fn pass(&self, cx: &FiberContext) -> Result<()> {
        let mut state = self.state.lock();
        if state.open {
            return Ok(());
        }
        state.waiters.push_back(cx.fiber());
        cx.wait(state)
    }

    /// Open the gate and wake every blocked fiber
    pub fn open(&self, scheduler: &Scheduler) -> Result<()> {
        let waiters = {
            let mut state = self.state.lock();
            state.open = true;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            scheduler.notify(&waiter)?;
        }
        Ok(())
    }

    /// Whether the gate's lock is currently held
    pub fn is_locked(&self) -> bool {
        self.state.try_lock().is_none()
    }

    /// Fibers blocked at the gate, in arrival order
    pub fn waiters(&self) -> Vec<Fiber> {
        self.state.lock().waiters.iter().cloned().collect()
    }
}

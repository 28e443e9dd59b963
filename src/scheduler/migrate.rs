//! Cross-thread migration of ready fibers
//!
//! A [`Migrator`] is the only part of a scheduler that may be used from
//! other threads. It shares the scheduler's ready queue and moves one ready
//! fiber at a time in or out, for coarse load balancing between schedulers.
//!
//! Only fibers that have not started yet, or that were built with
//! [`Builder::migratable`](crate::routine::Builder::migratable), can change
//! threads. Every other fiber stays on the thread it first ran on.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::ThreadId;

use super::core::SchedulerStats;
use super::queue::ReadyQueue;
use crate::error::{ensure, Result};
use crate::fiber::Fiber;

/// Thread-safe handle to one scheduler's ready queue
#[derive(Clone)]
pub struct Migrator {
    name: Arc<str>,
    owner: ThreadId,
    ready: Arc<ReadyQueue>,
    stats: Arc<SchedulerStats>,
}

impl Migrator {
    pub(crate) fn new(
        name: Arc<str>,
        owner: ThreadId,
        ready: Arc<ReadyQueue>,
        stats: Arc<SchedulerStats>,
    ) -> Self {
        Self {
            name,
            owner,
            ready,
            stats,
        }
    }

    /// Hand a ready fiber to this scheduler; it runs after everything queued
    pub fn migrate_to(&self, fiber: Fiber) -> Result<()> {
        ensure(fiber.is_ready(), || {
            format!(
                "{} can only migrate while ready, not {:?}",
                fiber,
                fiber.state()
            )
        })?;
        ensure(fiber.may_run_on(self.owner), || {
            format!("{} is pinned to another thread than {}", fiber, self.name)
        })?;

        log::debug!("{}: {} migrated in", self.name, fiber);
        self.ready.push_back(fiber);
        self.stats.migrated_in.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Take the most recently queued ready fiber, if it is free to move
    pub fn migrate_from(&self) -> Option<Fiber> {
        let fiber = self.ready.pop_back_movable()?;

        log::debug!("{}: {} migrated out", self.name, fiber);
        self.stats.migrated_out.fetch_add(1, Ordering::Relaxed);
        Some(fiber)
    }

    /// Number of fibers queued to run on the owning scheduler
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Move up to `max` fibers from `self` to `other`, newest first.
    ///
    /// Returns how many moved.
    pub fn transfer(&self, other: &Migrator, max: usize) -> Result<usize> {
        let mut moved = 0;
        while moved < max {
            let Some(fiber) = self.migrate_from() else {
                break;
            };
            other.migrate_to(fiber)?;
            moved += 1;
        }
        Ok(moved)
    }
}

impl fmt::Debug for Migrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migrator")
            .field("scheduler", &self.name)
            .field("ready", &self.ready.len())
            .finish()
    }
}

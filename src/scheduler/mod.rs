//! Cooperative scheduler for RustFibers
//!
//! This module provides the per-thread scheduler, its fiber containers and
//! the thread-safe migration handle used to move ready fibers between
//! schedulers.

pub mod core;
pub mod migrate;
mod queue;

pub use self::core::{Scheduler, SchedulerConfig, SchedulerStats};
pub use migrate::Migrator;

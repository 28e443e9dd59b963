//! # RustFibers
//!
//! Cooperative, single-threaded fibers: stackful execution contexts that
//! share one OS thread and hand control to each other at explicit points.
//!
//! ## Features
//!
//! - **Fibers**: stackful coroutines with their own stacks, built from plain
//!   closures or from closures returning a future
//! - **Scheduler**: one per thread, with spawn, step-wise `run`, yield,
//!   blocking wait, sleep and join
//! - **Migration**: hand a ready fiber from one thread's scheduler to another
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rust_fibers::prelude::*;
//!
//! let scheduler = Scheduler::with_defaults();
//!
//! // Runs until its first yield before `go` returns
//! let handle = scheduler
//!     .go(|cx| {
//!         let mut total = 0;
//!         for i in 0..5 {
//!             total += i;
//!             cx.yield_now()?;
//!         }
//!         Ok::<_, Error>(total)
//!     })
//!     .unwrap();
//!
//! let total = handle.join(&scheduler).unwrap().unwrap();
//! assert_eq!(total, 10);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod context;
pub mod error;
pub mod fiber;
pub mod routine;
pub mod scheduler;

pub use context::MIN_STACK_SIZE;

/// Convenient re-exports for common functionality
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::fiber::{Fiber, FiberId, FiberState};
    pub use crate::routine::{yield_now, Builder, FiberContext, JoinHandle, DEFAULT_STACK_SIZE};
    pub use crate::scheduler::{Migrator, Scheduler, SchedulerConfig, SchedulerStats};
}

// Re-export the prelude at crate root for convenience
pub use prelude::*;

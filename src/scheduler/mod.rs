//! Periodic job scheduler.
//!
//! This module provides:
//! - **Schedule**: daily-at-UTC or fixed-interval timing, with a pure `next_run`.
//! - **Job**: a named handler plus its run bookkeeping.
//! - **Scheduler**: a polling tick loop that launches due jobs concurrently
//!   with a per-run timeout and drains them on `stop`.
//!
//! # Example
//!
//! ```ignore
//! use signal_courier::scheduler::{Job, Schedule, Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::new(SchedulerConfig::default());
//! scheduler
//!     .register(Job::new("digest", "morning digest", Schedule::daily(8, 0)?, |_cancel| async {
//!         Ok(())
//!     }))
//!     .await;
//! scheduler.start().await;
//! // ...
//! scheduler.stop().await;
//! ```

mod job;
mod manager;
mod schedule;

pub use job::{Job, JobHandler, JobStatus};
pub use manager::{Scheduler, SchedulerConfig};
pub use schedule::Schedule;

//! Priority delivery queue.
//!
//! Producers push JSON-encoded [`QueuedMessage`]s onto one of three
//! backlogs (`high`, `normal`, `low`). Any number of [`DeliveryWorker`]s, in
//! any number of processes, pop from the shared backlogs, wait for a token
//! from the global bucket, respect a per-recipient throttle, and hand the
//! message to a chat sender.

mod bucket;
mod message;
mod producer;
mod worker;

pub use bucket::{BucketSpec, TokenBucket};
pub use message::{Priority, QueuedMessage};
pub use producer::{BacklogDepth, Producer};
pub use worker::{DeliveryOutcome, DeliveryWorker, WorkerConfig, WorkerStats};

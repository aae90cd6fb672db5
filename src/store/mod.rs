//! Shared store seam.
//!
//! Everything workers coordinate through lives behind [`SharedStore`]: the
//! three priority backlogs, the global token bucket and the per-recipient
//! throttle markers. [`RedisStore`] shares them across processes;
//! [`MemoryStore`] keeps them in-process for tests and single-node runs.

mod keys;
mod memory;
mod redis_backend;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::queue::{BacklogDepth, BucketSpec, Priority};

pub use keys::KeySpace;
pub use memory::MemoryStore;
pub use redis_backend::RedisStore;

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Append a payload to the tail of a backlog.
    async fn push_back(&self, priority: Priority, payload: String) -> Result<()>;

    /// Insert a payload at the head of a backlog.
    async fn push_front(&self, priority: Priority, payload: String) -> Result<()>;

    /// Pop the head of the first non-empty backlog in priority order,
    /// waiting up to `timeout`. `None` means every backlog stayed empty.
    async fn pop_first(&self, timeout: Duration) -> Result<Option<(Priority, String)>>;

    /// Atomically refill the global bucket and withdraw one token.
    async fn take_token(&self, spec: &BucketSpec) -> Result<bool>;

    /// Set the recipient's throttle marker if absent. `false` means a send to
    /// this recipient happened within the last `ttl`.
    async fn try_mark_recipient(&self, recipient: &str, ttl: Duration) -> Result<bool>;

    /// Length of one backlog.
    async fn len(&self, priority: Priority) -> Result<usize>;

    /// Lengths of all three backlogs.
    async fn depth(&self) -> Result<BacklogDepth> {
        Ok(BacklogDepth {
            high: self.len(Priority::High).await?,
            normal: self.len(Priority::Normal).await?,
            low: self.len(Priority::Low).await?,
        })
    }
}

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::{CourierError, Result};
use crate::queue::{BucketSpec, Priority, TokenBucket};
use crate::store::SharedStore;

#[derive(Debug, Default)]
struct MemoryState {
    lists: HashMap<Priority, VecDeque<String>>,
    bucket: Option<TokenBucket>,
    markers: HashMap<String, Instant>,
}

/// In-process store with the same semantics as [`RedisStore`](super::RedisStore).
///
/// Clocks are tokio's, so paused-time tests control refill and marker expiry.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    pushed: Notify,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail as if the store were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CourierError::Store("memory store offline".to_string()));
        }
        Ok(())
    }

    /// Snapshot of one backlog, head first.
    pub async fn items(&self, priority: Priority) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .lists
            .get(&priority)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn push_back(&self, priority: Priority, payload: String) -> Result<()> {
        self.ensure_online()?;
        self.state.lock().await.lists.entry(priority).or_default().push_back(payload);
        self.pushed.notify_one();
        Ok(())
    }

    async fn push_front(&self, priority: Priority, payload: String) -> Result<()> {
        self.ensure_online()?;
        self.state.lock().await.lists.entry(priority).or_default().push_front(payload);
        self.pushed.notify_one();
        Ok(())
    }

    async fn pop_first(&self, timeout: Duration) -> Result<Option<(Priority, String)>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_online()?;
            {
                let mut state = self.state.lock().await;
                for priority in Priority::ALL {
                    if let Some(payload) = state.lists.get_mut(&priority).and_then(VecDeque::pop_front) {
                        return Ok(Some((priority, payload)));
                    }
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn take_token(&self, spec: &BucketSpec) -> Result<bool> {
        self.ensure_online()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let bucket = state.bucket.get_or_insert_with(|| TokenBucket::full(spec, now));
        Ok(bucket.try_take(spec, now))
    }

    async fn try_mark_recipient(&self, recipient: &str, ttl: Duration) -> Result<bool> {
        self.ensure_online()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.markers.retain(|_, expires| *expires > now);
        if state.markers.contains_key(recipient) {
            return Ok(false);
        }
        state.markers.insert(recipient.to_string(), now + ttl);
        Ok(true)
    }

    async fn len(&self, priority: Priority) -> Result<usize> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        Ok(state.lists.get(&priority).map(VecDeque::len).unwrap_or(0))
    }
}

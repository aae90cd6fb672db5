//! Delivery worker.
//!
//! Each pop goes through:
//! 1. Staleness check against `max_age` (measured from first enqueue)
//! 2. A poll loop on the shared token bucket
//! 3. The per-recipient throttle marker; a busy recipient is deferred
//!
//! A message still inside a provider retry delay (`retry_not_before`) is
//! deferred before step 2.
//! 4. The chat sender, whose rate limits requeue at the head of `high`

use std::ops::AddAssign;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::chat::{ChatSender, OutgoingMessage, SendError};
use crate::queue::{BucketSpec, Priority, QueuedMessage};
use crate::store::SharedStore;

/// Worker tuning. Defaults suit the Telegram Bot API.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Messages older than this are dropped unsent.
    pub max_age: Duration,
    /// Provider rate limits tolerated before a message is dropped.
    pub max_attempts: u32,
    /// Requeue delay when the provider gives none.
    pub default_retry_after: Duration,
    /// Sleep between token bucket attempts.
    pub token_poll_interval: Duration,
    /// Blocking pop timeout; also bounds how long `stop` takes to be noticed.
    pub pop_timeout: Duration,
    /// One send per recipient per this interval.
    pub recipient_interval: Duration,
    /// Delay before a throttled message is pushed back.
    pub recipient_deferral: Duration,
    /// Pause after a store error while popping.
    pub error_backoff: Duration,
    pub bucket: BucketSpec,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(300),
            max_attempts: 3,
            default_retry_after: Duration::from_secs(5),
            token_poll_interval: Duration::from_millis(33),
            pop_timeout: Duration::from_secs(1),
            recipient_interval: Duration::from_secs(1),
            recipient_deferral: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            bucket: BucketSpec::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_bucket(mut self, bucket: BucketSpec) -> Self {
        self.bucket = bucket;
        self
    }

    pub fn with_pop_timeout(mut self, pop_timeout: Duration) -> Self {
        self.pop_timeout = pop_timeout;
        self
    }
}

/// Which branch a message took through `DeliveryWorker::process`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    /// Too old to be worth sending.
    DroppedStale { age: Duration },
    /// Recipient was sent to too recently, or a provider retry delay is still
    /// running; pushed back after `delay`.
    Deferred { delay: Duration },
    /// Provider rate limited; pushed to the head of `high` after `delay`.
    Requeued { delay: Duration, attempt: u32 },
    /// Provider rate limited `attempts` times in a row.
    DroppedMaxAttempts { attempts: u32 },
    /// Provider refused the message.
    DroppedPermanent { reason: String },
    /// Store or chat API unreachable.
    DroppedTransport { reason: String },
    /// Shutdown arrived while waiting for a token; returned to its backlog head.
    Returned,
}

/// Point-in-time copy of a worker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub sent: u64,
    pub dropped_stale: u64,
    pub deferred: u64,
    pub requeued: u64,
    pub dropped_max_attempts: u64,
    pub dropped_permanent: u64,
    pub dropped_transport: u64,
    pub dropped_undecodable: u64,
    pub returned: u64,
}

impl WorkerStats {
    /// Messages that left the pipeline for good.
    pub fn finished(&self) -> u64 {
        self.sent
            + self.dropped_stale
            + self.dropped_max_attempts
            + self.dropped_permanent
            + self.dropped_transport
            + self.dropped_undecodable
    }
}

impl AddAssign for WorkerStats {
    fn add_assign(&mut self, other: Self) {
        self.sent += other.sent;
        self.dropped_stale += other.dropped_stale;
        self.deferred += other.deferred;
        self.requeued += other.requeued;
        self.dropped_max_attempts += other.dropped_max_attempts;
        self.dropped_permanent += other.dropped_permanent;
        self.dropped_transport += other.dropped_transport;
        self.dropped_undecodable += other.dropped_undecodable;
        self.returned += other.returned;
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    dropped_stale: AtomicU64,
    deferred: AtomicU64,
    requeued: AtomicU64,
    dropped_max_attempts: AtomicU64,
    dropped_permanent: AtomicU64,
    dropped_transport: AtomicU64,
    dropped_undecodable: AtomicU64,
    returned: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Sent => &self.sent,
            DeliveryOutcome::DroppedStale { .. } => &self.dropped_stale,
            DeliveryOutcome::Deferred { .. } => &self.deferred,
            DeliveryOutcome::Requeued { .. } => &self.requeued,
            DeliveryOutcome::DroppedMaxAttempts { .. } => &self.dropped_max_attempts,
            DeliveryOutcome::DroppedPermanent { .. } => &self.dropped_permanent,
            DeliveryOutcome::DroppedTransport { .. } => &self.dropped_transport,
            DeliveryOutcome::Returned => &self.returned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            sent: self.sent.load(Ordering::Relaxed),
            dropped_stale: self.dropped_stale.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dropped_max_attempts: self.dropped_max_attempts.load(Ordering::Relaxed),
            dropped_permanent: self.dropped_permanent.load(Ordering::Relaxed),
            dropped_transport: self.dropped_transport.load(Ordering::Relaxed),
            dropped_undecodable: self.dropped_undecodable.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
        }
    }
}

/// Where a delayed push lands.
#[derive(Debug, Clone, Copy)]
enum Placement {
    Head(Priority),
    Tail(Priority),
}

/// Pops messages from the shared backlogs and delivers them.
///
/// Safe to run many instances, in many processes, against one store.
pub struct DeliveryWorker {
    name: String,
    store: Arc<dyn SharedStore>,
    sender: Arc<dyn ChatSender>,
    config: WorkerConfig,
    shutdown: CancellationToken,
    delayed: TaskTracker,
    counters: Counters,
}

impl DeliveryWorker {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn SharedStore>,
        sender: Arc<dyn ChatSender>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            sender,
            config,
            shutdown: CancellationToken::new(),
            delayed: TaskTracker::new(),
            counters: Counters::default(),
        }
    }

    /// Share a shutdown token, e.g. one per process for all workers.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask `run` to return. Pending delayed pushes are flushed immediately.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// Pop and process until stopped, then wait for delayed pushes.
    pub async fn run(&self) {
        tracing::info!(worker = %self.name, "Delivery worker started");

        while !self.shutdown.is_cancelled() {
            match self.store.pop_first(self.config.pop_timeout).await {
                Ok(Some((priority, payload))) => {
                    if self.shutdown.is_cancelled() {
                        // Popped after stop: leave it for another worker.
                        if let Err(e) = self.store.push_front(priority, payload).await {
                            tracing::error!(worker = %self.name, error = %e, "Failed to return message on shutdown");
                        }
                        break;
                    }
                    self.process_payload(priority, &payload).await;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(worker = %self.name, error = %e, "Pop failed, backing off");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        self.delayed.close();
        self.delayed.wait().await;
        tracing::info!(worker = %self.name, stats = ?self.stats(), "Delivery worker stopped");
    }

    /// Decode a popped payload and process it. Undecodable payloads are dropped.
    pub async fn process_payload(&self, priority: Priority, payload: &str) -> Option<DeliveryOutcome> {
        match QueuedMessage::from_json(payload) {
            Ok(message) => Some(self.process(priority, message).await),
            Err(e) => {
                self.counters.dropped_undecodable.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    worker = %self.name,
                    priority = %priority,
                    error = %e,
                    "Dropping undecodable payload"
                );
                None
            }
        }
    }

    /// Run one message through the delivery pipeline.
    ///
    /// `popped_from` is the backlog the message came out of.
    pub async fn process(&self, popped_from: Priority, message: QueuedMessage) -> DeliveryOutcome {
        let outcome = self.deliver(popped_from, message).await;
        self.counters.record(&outcome);
        outcome
    }

    async fn deliver(&self, popped_from: Priority, mut message: QueuedMessage) -> DeliveryOutcome {
        let now = Utc::now();
        if message.is_stale_at(now, self.config.max_age) {
            let age = message.age_at(now).to_std().unwrap_or_default();
            tracing::warn!(
                worker = %self.name,
                message_id = %message.id,
                chat_id = %message.chat_id,
                age_secs = age.as_secs(),
                "Dropping stale message"
            );
            return DeliveryOutcome::DroppedStale { age };
        }

        let pending_retry = message
            .retry_not_before
            .and_then(|at| (at - now).to_std().ok())
            .filter(|wait| !wait.is_zero());
        if let Some(delay) = pending_retry {
            tracing::debug!(
                worker = %self.name,
                message_id = %message.id,
                chat_id = %message.chat_id,
                wait_ms = delay.as_millis() as u64,
                "Provider retry delay pending, deferring"
            );
            self.push_later(Placement::Head(popped_from), message, delay);
            return DeliveryOutcome::Deferred { delay };
        }

        match self.wait_for_token().await {
            Ok(true) => {}
            Ok(false) => {
                // Shutting down: hand the message back untouched.
                if let Err(reason) = self.push_now(Placement::Head(popped_from), &message).await {
                    return DeliveryOutcome::DroppedTransport { reason };
                }
                return DeliveryOutcome::Returned;
            }
            Err(reason) => {
                tracing::error!(worker = %self.name, message_id = %message.id, error = %reason, "Token bucket unavailable");
                return DeliveryOutcome::DroppedTransport { reason };
            }
        }

        match self
            .store
            .try_mark_recipient(&message.chat_id, self.config.recipient_interval)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                let delay = self.config.recipient_deferral;
                tracing::debug!(
                    worker = %self.name,
                    message_id = %message.id,
                    chat_id = %message.chat_id,
                    "Recipient throttled, deferring"
                );
                self.push_later(Placement::Tail(message.priority), message, delay);
                return DeliveryOutcome::Deferred { delay };
            }
            Err(e) => {
                tracing::error!(worker = %self.name, message_id = %message.id, error = %e, "Throttle check failed");
                return DeliveryOutcome::DroppedTransport { reason: e.to_string() };
            }
        }

        let outgoing = OutgoingMessage::from(&message);
        match self.sender.send(&outgoing).await {
            Ok(()) => {
                tracing::info!(
                    worker = %self.name,
                    message_id = %message.id,
                    chat_id = %message.chat_id,
                    attempt = message.attempt_count + 1,
                    "Message delivered"
                );
                DeliveryOutcome::Sent
            }
            Err(SendError::RateLimited { retry_after }) => {
                message.attempt_count += 1;
                let attempt = message.attempt_count;
                if attempt >= self.config.max_attempts {
                    tracing::error!(
                        worker = %self.name,
                        message_id = %message.id,
                        chat_id = %message.chat_id,
                        attempts = attempt,
                        "Dropping message after repeated rate limits"
                    );
                    return DeliveryOutcome::DroppedMaxAttempts { attempts: attempt };
                }

                let delay = retry_after.unwrap_or(self.config.default_retry_after);
                message.retry_not_before = Some(Utc::now() + TimeDelta::from_std(delay).unwrap_or(TimeDelta::zero()));
                tracing::warn!(
                    worker = %self.name,
                    message_id = %message.id,
                    chat_id = %message.chat_id,
                    attempt,
                    retry_after_secs = delay.as_secs(),
                    "Rate limited by provider, requeueing"
                );
                self.push_later(Placement::Head(Priority::High), message, delay);
                DeliveryOutcome::Requeued { delay, attempt }
            }
            Err(SendError::Rejected { status, description }) => {
                tracing::error!(
                    worker = %self.name,
                    message_id = %message.id,
                    chat_id = %message.chat_id,
                    status,
                    description = %description,
                    "Provider rejected message"
                );
                DeliveryOutcome::DroppedPermanent {
                    reason: format!("{}: {}", status, description),
                }
            }
            Err(SendError::Transport(reason)) => {
                tracing::error!(
                    worker = %self.name,
                    message_id = %message.id,
                    chat_id = %message.chat_id,
                    error = %reason,
                    "Chat API unreachable"
                );
                DeliveryOutcome::DroppedTransport { reason }
            }
        }
    }

    /// Poll the bucket until a token is granted. `Ok(false)` on shutdown.
    async fn wait_for_token(&self) -> Result<bool, String> {
        loop {
            match self.store.take_token(&self.config.bucket).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => return Err(e.to_string()),
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(false),
                _ = tokio::time::sleep(self.config.token_poll_interval) => {}
            }
        }
    }

    async fn push_now(&self, placement: Placement, message: &QueuedMessage) -> Result<(), String> {
        push(self.store.as_ref(), placement, message).await
    }

    /// Push after `delay` on a detached task.
    ///
    /// Shutdown cuts the delay short; the message then keeps its
    /// `retry_not_before` so whichever worker pops it next still waits.
    fn push_later(&self, placement: Placement, mut message: QueuedMessage, delay: Duration) {
        let store = self.store.clone();
        let shutdown = self.shutdown.clone();
        let worker = self.name.clone();
        self.delayed.spawn(async move {
            let waited = tokio::select! {
                _ = shutdown.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            };
            if waited {
                message.retry_not_before = None;
            }
            if let Err(e) = push(store.as_ref(), placement, &message).await {
                tracing::error!(
                    worker = %worker,
                    message_id = %message.id,
                    chat_id = %message.chat_id,
                    error = %e,
                    "Delayed requeue failed, message lost"
                );
            }
        });
    }
}

async fn push(store: &dyn SharedStore, placement: Placement, message: &QueuedMessage) -> Result<(), String> {
    let payload = message.to_json().map_err(|e| e.to_string())?;
    let result = match placement {
        Placement::Head(priority) => store.push_front(priority, payload).await,
        Placement::Tail(priority) => store.push_back(priority, payload).await,
    };
    result.map_err(|e| e.to_string())
}

//! Scheduled job definitions.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::scheduler::schedule::Schedule;

/// A unit of periodic work.
///
/// The token is cancelled when the run exceeds the scheduler's per-run
/// timeout. Handlers must tolerate overlapping with a timed-out predecessor
/// that spawned work of its own.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, cancel: CancellationToken) -> eyre::Result<()>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    async fn run(&self, cancel: CancellationToken) -> eyre::Result<()> {
        (self)(cancel).await
    }
}

/// A registered job and its run bookkeeping.
pub struct Job {
    pub name: String,
    pub description: String,
    pub schedule: Schedule,
    pub(crate) handler: Arc<dyn JobHandler>,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub running: bool,
}

impl Job {
    /// Create a job. `next_run_at` is set by `Scheduler::register`.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schedule: Schedule,
        handler: impl JobHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schedule,
            handler: Arc::new(handler),
            next_run_at: DateTime::<Utc>::MAX_UTC,
            last_run_at: None,
            last_error: None,
            run_count: 0,
            running: false,
        }
    }

    /// Whether the job should be launched at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.running && now >= self.next_run_at
    }

    /// Record a finished run and reschedule from `finished_at`.
    pub(crate) fn complete(&mut self, finished_at: DateTime<Utc>, outcome: std::result::Result<(), String>) {
        self.running = false;
        self.last_run_at = Some(finished_at);
        self.last_error = outcome.err();
        self.run_count += 1;
        self.next_run_at = self.schedule.next_run(finished_at);
    }

    /// Copy of the externally visible state.
    pub fn status(&self) -> JobStatus {
        JobStatus {
            name: self.name.clone(),
            description: self.description.clone(),
            schedule: self.schedule,
            next_run_at: self.next_run_at,
            last_run_at: self.last_run_at,
            last_error: self.last_error.clone(),
            run_count: self.run_count,
            running: self.running,
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .field("next_run_at", &self.next_run_at)
            .field("run_count", &self.run_count)
            .field("running", &self.running)
            .finish()
    }
}

/// Point-in-time snapshot of a job, returned by `Scheduler::jobs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub name: String,
    pub description: String,
    pub schedule: Schedule,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub running: bool,
}

//! Scheduler tick loop.
//!
//! The Scheduler runs a polling loop that:
//! 1. Wakes on a fixed cadence (plus once immediately on start)
//! 2. Finds every job whose `next_run_at` has passed
//! 3. Spawns each due job as its own task with a per-run timeout
//! 4. Records the outcome and reschedules from the completion time

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::scheduler::job::{Job, JobHandler, JobStatus};

/// Configuration for the Scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the tick loop looks for due jobs.
    pub tick_interval: Duration,
    /// Upper bound on a single job run.
    pub job_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            job_timeout: Duration::from_secs(300),
        }
    }
}

impl SchedulerConfig {
    /// Set the tick cadence.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the per-run timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }
}

/// Runs registered jobs on their schedules.
///
/// Jobs are registered before `start`. `start` must be called once; a second
/// call spawns a second tick loop.
pub struct Scheduler {
    config: SchedulerConfig,
    jobs: Arc<RwLock<Vec<Job>>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    tick_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Scheduler {
    /// Create a new Scheduler.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            jobs: Arc::new(RwLock::new(Vec::new())),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            tick_loop: Mutex::new(None),
        }
    }

    /// Add a job and compute its first run time.
    pub async fn register(&self, mut job: Job) {
        job.next_run_at = job.schedule.next_run(Utc::now());
        tracing::info!(
            job = %job.name,
            schedule = %job.schedule,
            next_run_at = %job.next_run_at,
            "Job registered"
        );
        self.jobs.write().await.push(job);
    }

    /// Start the background tick loop. Returns immediately.
    pub async fn start(&self) {
        let jobs = self.jobs.clone();
        let tracker = self.tracker.clone();
        let shutdown = self.shutdown.clone();
        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        Self::launch_due(&jobs, &tracker, config.job_timeout).await;
                    }
                }
            }
            tracing::debug!("Scheduler tick loop exited");
        });

        *self.tick_loop.lock().await = Some(handle);
        tracing::info!(
            tick_interval_ms = self.config.tick_interval.as_millis() as u64,
            "Scheduler started"
        );
    }

    /// Stop the tick loop and wait for in-flight runs to finish.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        if let Some(handle) = self.tick_loop.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = ?e, "Scheduler tick loop panicked");
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Scheduler stopped");
    }

    /// Snapshot of every job's status.
    pub async fn jobs(&self) -> Vec<JobStatus> {
        self.jobs.read().await.iter().map(Job::status).collect()
    }

    /// Perform one scheduling tick now. Returns how many runs were launched.
    pub async fn tick(&self) -> usize {
        Self::launch_due(&self.jobs, &self.tracker, self.config.job_timeout).await
    }

    async fn launch_due(jobs: &Arc<RwLock<Vec<Job>>>, tracker: &TaskTracker, timeout: Duration) -> usize {
        let now = Utc::now();
        let due: Vec<(usize, String, Arc<dyn JobHandler>)> = {
            let mut guard = jobs.write().await;
            guard
                .iter_mut()
                .enumerate()
                .filter(|(_, job)| job.is_due(now))
                .map(|(index, job)| {
                    job.running = true;
                    (index, job.name.clone(), job.handler.clone())
                })
                .collect()
        };

        let launched = due.len();
        for (index, name, handler) in due {
            let jobs = jobs.clone();
            tracker.spawn(Self::execute(jobs, index, name, handler, timeout));
        }
        launched
    }

    async fn execute(
        jobs: Arc<RwLock<Vec<Job>>>,
        index: usize,
        name: String,
        handler: Arc<dyn JobHandler>,
        timeout: Duration,
    ) {
        tracing::debug!(job = %name, "Job run starting");
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mut run = tokio::spawn(async move { handler.run(token).await });

        let outcome = tokio::select! {
            joined = &mut run => match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(format!("{:#}", e)),
                Err(e) => Err(format!("job panicked: {}", e)),
            },
            _ = tokio::time::sleep(timeout) => {
                cancel.cancel();
                run.abort();
                Err(format!("timed out after {}ms", timeout.as_millis()))
            }
        };

        match &outcome {
            Ok(()) => tracing::info!(job = %name, "Job run succeeded"),
            Err(error) => tracing::error!(job = %name, error = %error, "Job run failed"),
        }

        let finished = Utc::now();
        let mut guard = jobs.write().await;
        if let Some(job) = guard.get_mut(index) {
            job.complete(finished, outcome);
            tracing::debug!(job = %name, next_run_at = %job.next_run_at, "Job rescheduled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::schedule::Schedule;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_tick_interval(Duration::from_millis(10))
            .with_job_timeout(Duration::from_secs(5))
    }

    fn counting_job(name: &str, period: Duration, counter: Arc<AtomicUsize>) -> Job {
        Job::new(name, "counts runs", Schedule::every(period).unwrap(), move |_cancel: CancellationToken| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), eyre::Report>(())
            }
        })
    }

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(30));
        assert_eq!(config.job_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_scheduler_config_builder() {
        let config = SchedulerConfig::default()
            .with_tick_interval(Duration::from_secs(1))
            .with_job_timeout(Duration::from_secs(2));
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.job_timeout, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_register_sets_next_run() {
        let scheduler = Scheduler::new(fast_config());
        let before = Utc::now();
        scheduler
            .register(counting_job("a", Duration::from_secs(60), Arc::new(AtomicUsize::new(0))))
            .await;

        let jobs = scheduler.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].next_run_at > before);
        assert_eq!(jobs[0].run_count, 0);
        assert!(jobs[0].last_run_at.is_none());
    }

    #[tokio::test]
    async fn test_tick_skips_jobs_not_yet_due() {
        let scheduler = Scheduler::new(fast_config());
        scheduler
            .register(counting_job("later", Duration::from_secs(3600), Arc::new(AtomicUsize::new(0))))
            .await;
        assert_eq!(scheduler.tick().await, 0);
    }

    #[tokio::test]
    async fn test_tick_runs_due_job_and_reschedules() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(fast_config());
        scheduler
            .register(counting_job("soon", Duration::from_millis(5), counter.clone()))
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.tick().await, 1);
        scheduler.stop().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let jobs = scheduler.jobs().await;
        assert_eq!(jobs[0].run_count, 1);
        assert!(jobs[0].last_error.is_none());
        let last = jobs[0].last_run_at.unwrap();
        assert_eq!(jobs[0].next_run_at, last + chrono::TimeDelta::milliseconds(5));
    }

    #[tokio::test]
    async fn test_start_runs_jobs_repeatedly_until_stop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(fast_config());
        scheduler
            .register(counting_job("repeat", Duration::from_millis(15), counter.clone()))
            .await;

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.stop().await;

        let runs = counter.load(Ordering::SeqCst);
        assert!(runs >= 2, "expected repeated runs, got {}", runs);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), runs);
    }

    #[tokio::test]
    async fn test_failing_job_is_recorded_and_rescheduled() {
        let scheduler = Scheduler::new(fast_config());
        let job = Job::new(
            "broken",
            "always fails",
            Schedule::every(Duration::from_millis(5)).unwrap(),
            |_cancel: CancellationToken| async { Err::<(), _>(eyre::eyre!("price feed unavailable")) },
        );
        scheduler.register(job).await;

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop().await;

        let jobs = scheduler.jobs().await;
        assert!(jobs[0].run_count >= 2);
        assert!(jobs[0].last_error.as_deref().unwrap().contains("price feed unavailable"));
    }

    #[tokio::test]
    async fn test_timed_out_job_records_error() {
        let scheduler = Scheduler::new(
            SchedulerConfig::default()
                .with_tick_interval(Duration::from_millis(10))
                .with_job_timeout(Duration::from_millis(30)),
        );
        let job = Job::new(
            "slow",
            "",
            Schedule::every(Duration::from_secs(3600)).unwrap(),
            |_cancel: CancellationToken| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<(), eyre::Report>(())
            },
        );
        scheduler.register(job).await;
        {
            let mut jobs = scheduler.jobs.write().await;
            jobs[0].next_run_at = Utc::now();
        }

        assert_eq!(scheduler.tick().await, 1);
        scheduler.stop().await;

        let jobs = scheduler.jobs().await;
        assert_eq!(jobs[0].run_count, 1);
        assert!(jobs[0].last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_wedge_scheduler() {
        let scheduler = Scheduler::new(fast_config());
        let job = Job::new(
            "panics",
            "",
            Schedule::every(Duration::from_millis(5)).unwrap(),
            |_cancel: CancellationToken| async {
                if true {
                    panic!("bad state");
                }
                Ok::<(), eyre::Report>(())
            },
        );
        scheduler.register(job).await;

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop().await;

        let jobs = scheduler.jobs().await;
        assert!(jobs[0].run_count >= 2);
        assert!(jobs[0].last_error.as_deref().unwrap().contains("panicked"));
        assert!(!jobs[0].running);
    }

    #[tokio::test]
    async fn test_in_flight_job_is_not_launched_twice() {
        let started = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(fast_config());
        let counter = started.clone();
        let job = Job::new(
            "long",
            "",
            Schedule::every(Duration::from_millis(1)).unwrap(),
            move |_cancel: CancellationToken| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok::<(), eyre::Report>(())
                }
            },
        );
        scheduler.register(job).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(scheduler.jobs().await[0].running);

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_runs() {
        let finished = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(fast_config());
        let flag = finished.clone();
        let job = Job::new(
            "drain",
            "",
            Schedule::every(Duration::from_millis(1)).unwrap(),
            move |_cancel: CancellationToken| {
                let flag = flag.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    flag.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), eyre::Report>(())
                }
            },
        );
        scheduler.register(job).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.stop().await;

        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.jobs().await[0].run_count, 1);
    }

    #[tokio::test]
    async fn test_slow_job_does_not_block_other_jobs() {
        let fast_runs = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(fast_config());
        let slow = Job::new(
            "slow",
            "",
            Schedule::every(Duration::from_millis(1)).unwrap(),
            |_cancel: CancellationToken| async {
                tokio::time::sleep(Duration::from_millis(400)).await;
                Ok::<(), eyre::Report>(())
            },
        );
        scheduler.register(slow).await;
        scheduler
            .register(counting_job("fast", Duration::from_millis(10), fast_runs.clone()))
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(fast_runs.load(Ordering::SeqCst) >= 2);

        scheduler.stop().await;
    }
}

//! Job executor with retry and backoff logic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::store::JobStore;
use super::types::{Job, JobKind, JobResult, JobStatus};

/// Runs one kind of job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &Job) -> JobResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&Job) -> JobResult + Send + Sync,
{
    async fn run(&self, job: &Job) -> JobResult {
        (self.0)(job)
    }
}

#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How often to poll for new jobs when the queue is empty
    pub poll_interval: Duration,
    /// Maximum concurrent jobs
    pub max_concurrent: usize,
    /// Name for logging
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_concurrent: 4,
            name: "job-executor".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

fn lock_stats(stats: &Mutex<ExecutorStats>) -> MutexGuard<'_, ExecutorStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Stops claiming new jobs and waits for the running ones to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            error!(error = %err, "job executor task panicked");
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        lock_stats(&self.stats).clone()
    }
}

/// Outcome of one execution, as seen by the executor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    Succeeded,
    Retrying,
    DeadLettered,
}

/// Background job executor.
///
/// Polls a job store for ready jobs, runs them with registered handlers, and
/// handles retries and dead-lettering.
pub struct JobExecutor<S: JobStore> {
    store: S,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl<S: JobStore + 'static> JobExecutor<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
        }
    }

    /// Registers a handler for a kind name, a `prefix.*` pattern, or `*`.
    pub fn register_handler(&mut self, pattern: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(pattern.into(), handler);
    }

    pub fn register_fn<F>(&mut self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&Job) -> JobResult + Send + Sync + 'static,
    {
        self.register_handler(pattern, Arc::new(FnHandler(handler)));
    }

    fn handler_for(&self, kind: &JobKind) -> Option<&Arc<dyn JobHandler>> {
        let type_name = kind.type_name();
        if let Some(h) = self.handlers.get(type_name) {
            return Some(h);
        }

        // "booking.*" matches "booking.activate"
        let by_prefix = self.handlers.iter().find_map(|(pattern, handler)| {
            let prefix = pattern.strip_suffix(".*")?;
            type_name
                .strip_prefix(prefix)
                .filter(|rest| rest.starts_with('.'))
                .map(|_| handler)
        });
        by_prefix.or_else(|| self.handlers.get("*"))
    }

    /// Spawns the polling loop on the current tokio runtime.
    pub fn spawn(self, config: JobExecutorConfig) -> JobExecutorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let join = tokio::spawn(executor_loop(
            Arc::new(self),
            config,
            shutdown_rx,
            stats.clone(),
        ));

        JobExecutorHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }

    /// Runs a claimed job and persists the outcome.
    pub async fn execute_one(&self, job: &mut Job) -> Result<Execution, String> {
        let result = match self.handler_for(&job.kind) {
            Some(handler) => handler.run(job).await,
            None => {
                warn!(job_id = %job.id, kind = job.kind.type_name(), "no handler for job");
                JobResult::Fatal(format!("no handler for job kind {}", job.kind.type_name()))
            }
        };

        match result {
            JobResult::Success => {
                job.mark_completed();
                self.store.update(job).await.map_err(|e| e.to_string())?;
                debug!(job_id = %job.id, "job completed");
                Ok(Execution::Succeeded)
            }
            JobResult::Failure(error) => {
                job.mark_failed(error.clone());
                if matches!(job.status, JobStatus::DeadLettered { .. }) {
                    warn!(job_id = %job.id, error = %error, attempts = job.attempt, "job dead-lettered");
                    self.store
                        .dead_letter(job.clone(), error)
                        .await
                        .map_err(|e| e.to_string())?;
                    Ok(Execution::DeadLettered)
                } else {
                    debug!(job_id = %job.id, error = %error, attempt = job.attempt, "job will be retried");
                    self.store.update(job).await.map_err(|e| e.to_string())?;
                    Ok(Execution::Retrying)
                }
            }
            JobResult::Fatal(error) => {
                job.status = JobStatus::DeadLettered {
                    error: error.clone(),
                    attempts: job.attempt,
                };
                job.last_error = Some(error.clone());
                warn!(job_id = %job.id, error = %error, "job failed permanently");
                self.store
                    .dead_letter(job.clone(), error)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(Execution::DeadLettered)
            }
        }
    }
}

async fn executor_loop<S: JobStore + 'static>(
    executor: Arc<JobExecutor<S>>,
    config: JobExecutorConfig,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    info!(executor = %config.name, "job executor started");
    let started = Instant::now();
    let slots = config.max_concurrent.max(1);
    let permits = Arc::new(Semaphore::new(slots));

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        lock_stats(&stats).uptime_secs = started.elapsed().as_secs();

        let permit = tokio::select! {
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown_rx.changed() => break,
        };

        match executor.store.claim_next().await {
            Ok(Some(mut job)) => {
                debug!(executor = %config.name, job_id = %job.id, kind = job.kind.type_name(), "claimed job");
                lock_stats(&stats).current_running += 1;

                let executor = executor.clone();
                let stats = stats.clone();
                tokio::spawn(async move {
                    let outcome = executor.execute_one(&mut job).await;
                    let mut s = lock_stats(&stats);
                    s.current_running = s.current_running.saturating_sub(1);
                    s.jobs_processed += 1;
                    match outcome {
                        Ok(Execution::Succeeded) => s.jobs_succeeded += 1,
                        Ok(Execution::Retrying) => s.jobs_failed += 1,
                        Ok(Execution::DeadLettered) => {
                            s.jobs_failed += 1;
                            s.jobs_dead_lettered += 1;
                        }
                        Err(err) => {
                            s.jobs_failed += 1;
                            error!(job_id = %job.id, error = %err, "failed to persist job outcome");
                        }
                    }
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                idle(&mut shutdown_rx, config.poll_interval).await;
            }
            Err(err) => {
                drop(permit);
                error!(executor = %config.name, error = %err, "failed to claim job");
                idle(&mut shutdown_rx, config.poll_interval).await;
            }
        }
    }

    // wait for in-flight jobs
    let _ = permits.acquire_many(slots as u32).await;
    info!(executor = %config.name, "job executor stopped");
}

async fn idle(shutdown_rx: &mut watch::Receiver<bool>, interval: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(interval) => {}
        _ = shutdown_rx.changed() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::RetryPolicy;

    fn job(task: &str) -> Job {
        Job::new(JobKind::booking(task), serde_json::json!({}))
    }

    #[tokio::test]
    async fn successful_job_completes() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone());
        executor.register_fn("booking.activate", |_| JobResult::Success);

        let id = store.enqueue(job("booking.activate")).await.unwrap();
        let mut claimed = store.claim_next().await.unwrap().unwrap();

        assert_eq!(executor.execute_one(&mut claimed).await, Ok(Execution::Succeeded));
        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn failing_job_retries_then_dead_letters() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone());
        executor.register_fn("booking.send_sms", |_| JobResult::Failure("sms gateway down".into()));

        let queued = job("booking.send_sms").with_retry_policy(RetryPolicy::fixed(2, Duration::ZERO));
        store.enqueue(queued).await.unwrap();

        let mut claimed = store.claim_next().await.unwrap().unwrap();
        assert_eq!(executor.execute_one(&mut claimed).await, Ok(Execution::Retrying));

        let mut claimed = store.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.attempt, 2);
        assert_eq!(executor.execute_one(&mut claimed).await, Ok(Execution::DeadLettered));

        let dead = store.list_dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "sms gateway down");
    }

    #[tokio::test]
    async fn fatal_result_skips_retries() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone());
        executor.register_fn("*", |_| JobResult::Fatal("malformed payload".into()));

        store.enqueue(job("booking.create_log")).await.unwrap();
        let mut claimed = store.claim_next().await.unwrap().unwrap();

        assert_eq!(executor.execute_one(&mut claimed).await, Ok(Execution::DeadLettered));
        assert_eq!(store.list_dead_letters(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn routes_exact_then_prefix_then_wildcard() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone());
        executor.register_fn("booking.*", |_| JobResult::Failure("prefix".into()));
        executor.register_fn("booking.activate", |_| JobResult::Success);
        executor.register_fn("*", |_| JobResult::Fatal("wildcard".into()));

        let kind = |name: &str| JobKind::booking(name);
        let run = |name: &str| {
            let handler = executor.handler_for(&kind(name)).unwrap().clone();
            let job = job(name);
            async move { handler.run(&job).await }
        };

        assert_eq!(run("booking.activate").await, JobResult::Success);
        assert_eq!(run("booking.deactivate").await, JobResult::Failure("prefix".into()));
        assert_eq!(run("bookings_other").await, JobResult::Fatal("wildcard".into()));
    }

    #[tokio::test]
    async fn missing_handler_dead_letters() {
        let store = InMemoryJobStore::arc();
        let executor = JobExecutor::new(store.clone());

        store.enqueue(job("booking.regression_alert")).await.unwrap();
        let mut claimed = store.claim_next().await.unwrap().unwrap();

        assert_eq!(executor.execute_one(&mut claimed).await, Ok(Execution::DeadLettered));
    }

    #[tokio::test]
    async fn spawned_executor_drains_queue_and_stops() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone());
        executor.register_fn("booking.*", |_| JobResult::Success);

        for _ in 0..5 {
            store.enqueue(job("booking.send_email")).await.unwrap();
        }

        let handle = executor.spawn(
            JobExecutorConfig::default()
                .with_name("test-executor")
                .with_poll_interval(Duration::from_millis(5)),
        );

        for _ in 0..200 {
            if handle.stats().jobs_succeeded == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(store.stats().await.unwrap().completed, 5);
        assert_eq!(handle.stats().jobs_succeeded, 5);
        handle.shutdown().await;
    }
}

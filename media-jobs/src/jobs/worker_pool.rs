//! Worker pool implementation for job execution.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::executor::BlockingExecutor;
use super::job::{AttemptOutcome, Job, JobResult, WorkArgs};
use crate::error::JobError;
use crate::{Error, Result};

/// Configuration for a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers pulling from the queue.
    pub worker_count: usize,
    /// Maximum number of queued jobs before `submit` applies backpressure.
    pub queue_capacity: usize,
    /// Maximum number of work items executing on blocking threads.
    pub executor_threads: usize,
    /// Poll interval in milliseconds for result and drain waits.
    pub poll_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            queue_capacity: 100,
            executor_threads: 4,
            poll_interval_ms: 100,
        }
    }
}

/// Lifecycle state of a job the pool has accepted but not yet settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Active,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub queued: usize,
    pub active: usize,
    pub results: usize,
    pub running: bool,
}

/// State shared between the pool handle and its workers.
struct PoolShared {
    results: DashMap<String, JobResult>,
    tracked: DashMap<String, JobState>,
    /// Jobs accepted by `submit` and not yet acknowledged by a worker.
    outstanding: AtomicUsize,
    result_notify: Notify,
    drain_notify: Notify,
    executor: BlockingExecutor,
}

impl PoolShared {
    fn settle(&self, result: JobResult) {
        let job_id = result.job_id.clone();
        // Insert before untracking so waiters never observe neither.
        self.results.insert(job_id.clone(), result);
        self.tracked.remove(&job_id);
        self.result_notify.notify_waiters();
        self.acknowledge();
    }

    fn abandon(&self, job_id: &str) {
        self.tracked.remove(job_id);
        self.result_notify.notify_waiters();
        self.acknowledge();
    }

    fn acknowledge(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drain_notify.notify_waiters();
        }
    }
}

/// A bounded pool of workers executing [`Job`]s with retry and timeout.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    shared: Arc<PoolShared>,
    sender: mpsc::Sender<Job>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    running: AtomicBool,
    cancellation_token: parking_lot::Mutex<CancellationToken>,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool with default configuration.
    pub fn new() -> Self {
        Self::with_config(WorkerPoolConfig::default())
    }

    /// Create a new worker pool with custom configuration.
    pub fn with_config(config: WorkerPoolConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let shared = PoolShared {
            results: DashMap::new(),
            tracked: DashMap::new(),
            outstanding: AtomicUsize::new(0),
            result_notify: Notify::new(),
            drain_notify: Notify::new(),
            executor: BlockingExecutor::new(config.executor_threads),
        };
        let cancellation_token = CancellationToken::new();
        cancellation_token.cancel();

        Self {
            config,
            shared: Arc::new(shared),
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            running: AtomicBool::new(false),
            cancellation_token: parking_lot::Mutex::new(cancellation_token),
            tasks: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Check if the pool is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the worker pool. Calling this on a running pool is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Worker pool already running");
            return;
        }

        let token = CancellationToken::new();
        *self.cancellation_token.lock() = token.clone();

        let mut join_set = JoinSet::new();
        for worker_id in 0..self.config.worker_count.max(1) {
            join_set.spawn(worker_loop(
                worker_id,
                self.shared.clone(),
                self.receiver.clone(),
                token.clone(),
            ));
        }
        *self.tasks.lock() = Some(join_set);

        info!(
            workers = self.config.worker_count.max(1),
            executor_threads = self.shared.executor.max_threads(),
            queue_capacity = self.config.queue_capacity,
            "Worker pool started"
        );
    }

    /// Stop the worker pool.
    ///
    /// In-flight attempts are abandoned without a stored result and their
    /// work is signalled through [`Work::execute_with_cancel`](super::Work::execute_with_cancel).
    /// Blocking work already handed to the executor is not awaited.
    ///
    /// The executor itself is kept: its blocking threads belong to the tokio
    /// runtime, and its permits return as abandoned work finishes, so a later
    /// [`start`](Self::start) reuses it.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Stopping worker pool");
        self.cancellation_token.lock().cancel();

        // Take the join set out of the mutex before awaiting
        let join_set = self.tasks.lock().take();
        if let Some(mut join_set) = join_set {
            while let Some(joined) = join_set.join_next().await {
                if let Err(e) = joined {
                    if !e.is_cancelled() {
                        warn!(error = %e, "Worker terminated abnormally");
                    }
                }
            }
        }

        self.shared.result_notify.notify_waiters();
        self.shared.drain_notify.notify_waiters();

        let busy = self.shared.executor.busy();
        if busy > 0 {
            debug!(busy, "Releasing executor with work still running");
        }
        info!("Worker pool stopped");
    }

    /// Enqueue a job, waiting for queue space if the queue is full.
    pub async fn submit(&self, job: Job) -> Result<String> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        let token = self.cancellation_token.lock().clone();

        let permit = tokio::select! {
            permit = self.sender.reserve() => permit.map_err(|_| Error::NotRunning)?,
            _ = token.cancelled() => return Err(Error::NotRunning),
        };

        let job_id = job.id.clone();
        self.shared.tracked.insert(job_id.clone(), JobState::Queued);
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        permit.send(job);

        debug!(job_id = %job_id, "Job submitted");
        Ok(job_id)
    }

    /// Submit jobs one after another, preserving their order.
    pub async fn submit_many(&self, jobs: impl IntoIterator<Item = Job>) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for job in jobs {
            ids.push(self.submit(job).await?);
        }
        Ok(ids)
    }

    /// Get a stored result without waiting.
    pub fn try_result(&self, job_id: &str) -> Option<JobResult> {
        self.shared.results.get(job_id).map(|r| r.value().clone())
    }

    /// Get the result of a job.
    ///
    /// With `wait`, blocks until the result is stored or the job stops being
    /// tracked (unknown, abandoned, or the pool stopped).
    pub async fn result(&self, job_id: &str, wait: bool) -> Option<JobResult> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            let notified = self.shared.result_notify.notified();

            if let Some(result) = self.try_result(job_id) {
                return Some(result);
            }
            if !wait {
                return None;
            }
            if !self.shared.tracked.contains_key(job_id) || !self.is_running() {
                return self.try_result(job_id);
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Collect results for several jobs. Jobs without a result are omitted.
    pub async fn results_for(&self, job_ids: &[String], wait: bool) -> HashMap<String, JobResult> {
        let mut results = HashMap::with_capacity(job_ids.len());
        for job_id in job_ids {
            if let Some(result) = self.result(job_id, wait).await {
                results.insert(job_id.clone(), result);
            }
        }
        results
    }

    /// Wait until every submitted job has been taken off the queue and settled.
    ///
    /// Returns early if the pool is stopped.
    pub async fn await_drain(&self) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            let notified = self.shared.drain_notify.notified();

            if self.shared.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            if !self.is_running() {
                warn!(
                    outstanding = self.shared.outstanding.load(Ordering::SeqCst),
                    "Worker pool stopped before the queue drained"
                );
                return;
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Remove results that finished at least `max_age` ago.
    ///
    /// Jobs that are still queued or active are never touched.
    pub fn evict_older_results(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::TimeDelta::MAX);
        let now = Utc::now();
        let before = self.shared.results.len();

        self.shared.results.retain(|job_id, result| {
            if self.shared.tracked.contains_key(job_id) {
                return true;
            }
            match result.finished_at {
                Some(finished_at) => now - finished_at < max_age,
                None => true,
            }
        });

        let removed = before.saturating_sub(self.shared.results.len());
        if removed > 0 {
            debug!(removed, "Evicted old job results");
        }
        removed
    }

    /// Get pool statistics.
    pub fn stats(&self) -> PoolStats {
        let (mut queued, mut active) = (0, 0);
        for entry in self.shared.tracked.iter() {
            match entry.value() {
                JobState::Queued => queued += 1,
                JobState::Active => active += 1,
            }
        }
        PoolStats {
            queued,
            active,
            results: self.shared.results.len(),
            running: self.is_running(),
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

async fn worker_loop(
    worker_id: usize,
    shared: Arc<PoolShared>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    cancellation_token: CancellationToken,
) {
    debug!(worker_id, "Worker started");

    loop {
        let job = tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => break,
            job = next_job(&receiver) => match job {
                Some(job) => job,
                None => break,
            },
        };

        let job_id = job.id.clone();
        shared.tracked.insert(job_id.clone(), JobState::Active);
        debug!(worker_id, job_id = %job_id, "Processing job");

        let result = tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => None,
            result = run_job(&shared.executor, &job) => Some(result),
        };

        match result {
            Some(result) => {
                if result.success {
                    info!(
                        job_id = %job_id,
                        attempts = result.attempts_used,
                        "Job completed"
                    );
                } else {
                    warn!(
                        job_id = %job_id,
                        attempts = result.attempts_used,
                        error = ?result.error,
                        "Job failed"
                    );
                }
                shared.settle(result);
            }
            None => {
                warn!(worker_id, job_id = %job_id, "Job abandoned by shutdown");
                shared.abandon(&job_id);
                break;
            }
        }
    }

    debug!(worker_id, "Worker shutting down");
}

async fn next_job(receiver: &Mutex<mpsc::Receiver<Job>>) -> Option<Job> {
    receiver.lock().await.recv().await
}

/// Run one attempt under the job's timeout.
async fn run_attempt(
    executor: &BlockingExecutor,
    job: &Job,
    args: &Arc<WorkArgs>,
) -> AttemptOutcome {
    match tokio::time::timeout(job.timeout, executor.run(job.work.clone(), args.clone())).await {
        Ok(Ok(value)) => AttemptOutcome::Succeeded(value),
        Ok(Err(e)) => AttemptOutcome::Failed(e),
        Err(_) => AttemptOutcome::TimedOut,
    }
}

/// Drive a job through its attempts and produce the final result.
pub(crate) async fn run_job(executor: &BlockingExecutor, job: &Job) -> JobResult {
    let mut result = JobResult::started(&job.id);
    let args = Arc::new(job.args.clone());
    let budget = job.attempt_budget();

    for attempt in 1..=budget {
        result.attempts_used = attempt;

        match run_attempt(executor, job, &args).await {
            AttemptOutcome::Succeeded(value) => {
                result.success = true;
                result.value = Some(value);
                result.error = None;
                break;
            }
            AttemptOutcome::TimedOut => {
                warn!(job_id = %job.id, attempt, budget, "Job attempt timed out");
                result.error = Some(JobError::timeout(job.timeout));
            }
            AttemptOutcome::Failed(e) => {
                warn!(job_id = %job.id, attempt, budget, error = %e, "Job attempt failed");
                result.error = Some(JobError::Work(e));
            }
        }

        if attempt < budget {
            tokio::time::sleep(job.retry_delay).await;
        }
    }

    result.finished_at = Some(Utc::now());
    result
}

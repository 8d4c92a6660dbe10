//! Job and job result records, plus the work contract executed by the pool.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{JobError, WorkError};

/// Default per-attempt timeout (30 minutes).
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(1800);
/// Default number of attempts per job.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default delay between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Positional and named arguments handed to a [`Work`] implementation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl WorkArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs.extend(kwargs);
        self
    }
}

/// A blocking unit of work.
///
/// Implementations always run on the blocking executor, never on an async
/// worker task, so they are free to do synchronous IO or CPU-heavy work.
pub trait Work: Send + Sync + 'static {
    fn execute(&self, args: &WorkArgs) -> Result<Value, WorkError>;

    /// Run with a token that is cancelled once the attempt is abandoned,
    /// either by its timeout or by pool shutdown.
    ///
    /// Work that owns external resources (child processes) overrides this to
    /// release them; the returned value of a cancelled attempt is discarded.
    fn execute_with_cancel(
        &self,
        args: &WorkArgs,
        cancel: &CancellationToken,
    ) -> Result<Value, WorkError> {
        let _ = cancel;
        self.execute(args)
    }
}

impl<F> Work for F
where
    F: Fn(&WorkArgs) -> Result<Value, WorkError> + Send + Sync + 'static,
{
    fn execute(&self, args: &WorkArgs) -> Result<Value, WorkError> {
        self(args)
    }
}

/// A unit of submitted work with its retry and timeout policy.
#[derive(Clone)]
pub struct Job {
    pub id: String,
    pub work: Arc<dyn Work>,
    pub args: WorkArgs,
    /// Ceiling for a single attempt.
    pub timeout: Duration,
    /// Total number of attempts, not retries after the first try.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Job {
    pub fn new(id: impl Into<String>, work: Arc<dyn Work>, args: WorkArgs) -> Self {
        Self {
            id: id.into(),
            work,
            args,
            timeout: DEFAULT_JOB_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Number of attempts the worker will make; never less than one.
    pub fn attempt_budget(&self) -> u32 {
        self.max_retries.max(1)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("args", &self.args)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

/// Outcome of a single attempt, consumed by the retry loop.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Succeeded(Value),
    TimedOut,
    Failed(WorkError),
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }
}

/// Recorded outcome of a job after its final attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub success: bool,
    pub value: Option<Value>,
    pub error: Option<JobError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts_used: u32,
}

impl JobResult {
    pub(crate) fn started(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            success: false,
            value: None,
            error: None,
            started_at: Some(Utc::now()),
            finished_at: None,
            attempts_used: 0,
        }
    }

    /// Wall-clock time between start and finish, if both are known.
    pub fn execution_time(&self) -> Option<Duration> {
        let (started, finished) = (self.started_at?, self.finished_at?);
        (finished - started).to_std().ok()
    }
}

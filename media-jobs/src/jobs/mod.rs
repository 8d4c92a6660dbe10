//! Job execution: job records, the blocking executor and the worker pool.

mod executor;
mod job;
mod worker_pool;

pub use executor::BlockingExecutor;
pub use job::{
    AttemptOutcome, DEFAULT_JOB_TIMEOUT, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY, Job, JobResult,
    Work, WorkArgs,
};
pub use worker_pool::{JobState, PoolStats, WorkerPool, WorkerPoolConfig};

//! Download and batch coordination on top of the worker pool.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::models::{
    BatchCounts, BatchRecord, BatchSnapshot, BatchState, DownloadRecord, DownloadSnapshot,
    DownloadStatus, Options,
};
use super::work::{DownloadJobWork, DownloadWork};
use crate::jobs::{Job, WorkerPool};
use crate::{Error, Result};

/// Configuration for the batch coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Per-attempt timeout for download jobs.
    pub download_timeout_secs: u64,
    /// Attempts per download.
    pub max_retries: u32,
    /// Delay between attempts.
    pub retry_delay_secs: u64,
    /// Interval of the background cleanup task.
    pub cleanup_interval_secs: u64,
    /// Settled downloads older than this are removed by the cleanup task.
    pub completed_max_age_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            download_timeout_secs: 3600, // 1 hour
            max_retries: 3,
            retry_delay_secs: 10,
            cleanup_interval_secs: 600,
            completed_max_age_secs: 3600,
        }
    }
}

/// Tracks downloads and batches, delegating execution to a [`WorkerPool`].
pub struct BatchCoordinator {
    pool: Arc<WorkerPool>,
    config: CoordinatorConfig,
    downloads: DashMap<String, DownloadRecord>,
    batches: DashMap<String, BatchRecord>,
}

impl BatchCoordinator {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self::with_config(pool, CoordinatorConfig::default())
    }

    pub fn with_config(pool: Arc<WorkerPool>, config: CoordinatorConfig) -> Self {
        Self {
            pool,
            config,
            downloads: DashMap::new(),
            batches: DashMap::new(),
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Submit a download, optionally as a member of `batch_id`.
    ///
    /// The batch is created on first reference.
    pub async fn submit_download(
        &self,
        url: &str,
        work: Arc<dyn DownloadWork>,
        options: Options,
        batch_id: Option<&str>,
    ) -> Result<String> {
        let download_id = Uuid::new_v4().to_string();

        self.downloads.insert(
            download_id.clone(),
            DownloadRecord::new(
                &download_id,
                url,
                options.clone(),
                batch_id.map(str::to_string),
            ),
        );
        if let Some(batch_id) = batch_id {
            self.batches
                .entry(batch_id.to_string())
                .or_insert_with(|| BatchRecord::new(batch_id))
                .push(&download_id);
        }

        let job = Job::new(
            &download_id,
            Arc::new(DownloadJobWork(work)),
            DownloadJobWork::args(url, options),
        )
        .with_timeout(Duration::from_secs(self.config.download_timeout_secs))
        .with_max_retries(self.config.max_retries)
        .with_retry_delay(Duration::from_secs(self.config.retry_delay_secs));

        if let Err(e) = self.pool.submit(job).await {
            self.forget(&download_id, batch_id);
            return Err(e);
        }

        info!(download_id = %download_id, url, batch_id = ?batch_id, "Download submitted");
        Ok(download_id)
    }

    /// Submit every URL as a member of a new batch.
    ///
    /// If any submission fails, the members registered so far and the batch
    /// itself are forgotten before the error is returned. Jobs already queued
    /// still run; their results age out of the pool like any other.
    pub async fn submit_batch<I, S>(
        &self,
        urls: I,
        work: Arc<dyn DownloadWork>,
        options: Options,
    ) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let batch_id = Uuid::new_v4().to_string();
        self.batches
            .insert(batch_id.clone(), BatchRecord::new(&batch_id));

        let mut submitted = Vec::new();
        for url in urls {
            let result = self
                .submit_download(url.as_ref(), work.clone(), options.clone(), Some(&batch_id))
                .await;
            match result {
                Ok(download_id) => submitted.push(download_id),
                Err(e) => {
                    for download_id in &submitted {
                        self.forget(download_id, Some(&batch_id));
                    }
                    self.batches.remove(&batch_id);
                    warn!(
                        batch_id = %batch_id,
                        discarded = submitted.len(),
                        error = %e,
                        "Batch submission failed"
                    );
                    return Err(e);
                }
            }
        }

        info!(batch_id = %batch_id, downloads = submitted.len(), "Batch submitted");
        Ok(batch_id)
    }

    /// Current status of a download.
    ///
    /// A pending record pulls its job result once available and keeps the
    /// settled status from then on.
    pub fn download_status(&self, download_id: &str) -> DownloadSnapshot {
        let Some(mut record) = self.downloads.get_mut(download_id) else {
            return DownloadSnapshot::not_found(download_id);
        };

        if record.status == DownloadStatus::Pending {
            if let Some(result) = self.pool.try_result(download_id) {
                if record.apply_result(&result) {
                    debug!(
                        download_id,
                        status = %record.status,
                        "Download settled"
                    );
                }
            }
        }

        record.snapshot()
    }

    /// Aggregated status of a batch.
    pub fn batch_status(&self, batch_id: &str) -> Result<BatchSnapshot> {
        let member_ids = self
            .batches
            .get(batch_id)
            .map(|batch| batch.download_ids.clone())
            .ok_or_else(|| Error::not_found("batch", batch_id))?;

        let members: Vec<DownloadSnapshot> = member_ids
            .iter()
            .map(|id| self.download_status(id))
            .filter(|snapshot| snapshot.status != DownloadStatus::NotFound)
            .collect();
        let counts = BatchCounts::tally(&members);

        let mut batch = self
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| Error::not_found("batch", batch_id))?;

        if counts.pending == 0 && batch.state == BatchState::Pending {
            batch.mark_completed();
            info!(
                batch_id,
                completed = counts.completed,
                failed = counts.failed,
                "Batch finished"
            );
        }

        Ok(BatchSnapshot {
            id: batch.id.clone(),
            status: batch.state,
            counts,
            progress_percent: counts.progress_percent(),
            duration_secs: batch.duration_secs(Utc::now()),
            members,
        })
    }

    /// Remove settled downloads that finished at least `max_age` ago.
    ///
    /// Emptied batches are deleted, as are batches that never had members
    /// once they are `max_age` old. The pool drops its old results too.
    /// Returns the number of downloads removed.
    pub fn clear_completed(&self, max_age: Duration) -> usize {
        // Settle pending records first so none is stranded once the pool
        // evicts its result.
        let pending: Vec<String> = self
            .downloads
            .iter()
            .filter(|r| r.status == DownloadStatus::Pending)
            .map(|r| r.id.clone())
            .collect();
        for id in &pending {
            self.download_status(id);
        }

        let max_age_delta = chrono::Duration::from_std(max_age).unwrap_or(chrono::TimeDelta::MAX);
        let now = Utc::now();
        let expired: Vec<(String, Option<String>)> = self
            .downloads
            .iter()
            .filter(|r| {
                r.status.is_terminal()
                    && r.finished_at
                        .is_some_and(|finished_at| now - finished_at >= max_age_delta)
            })
            .map(|r| (r.id.clone(), r.batch_id.clone()))
            .collect();

        for (download_id, batch_id) in &expired {
            self.forget(download_id, batch_id.as_deref());
        }

        let mut empty_batches = 0;
        self.batches.retain(|_, batch| {
            let stale = batch.download_ids.is_empty()
                && now - batch.finished_at.unwrap_or(batch.started_at) >= max_age_delta;
            if stale {
                empty_batches += 1;
            }
            !stale
        });
        if empty_batches > 0 {
            debug!(batches = empty_batches, "Removed empty batches");
        }

        let evicted = self.pool.evict_older_results(max_age);
        if !expired.is_empty() {
            info!(
                downloads = expired.len(),
                job_results = evicted,
                "Cleared completed downloads"
            );
        }
        expired.len()
    }

    /// Drop a download record and detach it from its batch.
    fn forget(&self, download_id: &str, batch_id: Option<&str>) {
        self.downloads.remove(download_id);

        let Some(batch_id) = batch_id else {
            return;
        };
        let emptied = match self.batches.get_mut(batch_id) {
            Some(mut batch) => {
                batch.download_ids.retain(|id| id != download_id);
                batch.download_ids.is_empty()
            }
            None => false,
        };
        if emptied
            && self
                .batches
                .remove_if(batch_id, |_, batch| batch.download_ids.is_empty())
                .is_some()
        {
            debug!(batch_id, "Removed empty batch");
        }
    }

    pub fn download_count(&self) -> usize {
        self.downloads.len()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    /// Spawn the periodic cleanup of settled downloads.
    pub fn spawn_cleanup(self: &Arc<Self>, cancel_token: CancellationToken) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let interval = Duration::from_secs(coordinator.config.cleanup_interval_secs.max(1));
        let max_age = Duration::from_secs(coordinator.config.completed_max_age_secs);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Download cleanup task shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        coordinator.clear_completed(max_age);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkError;
    use crate::jobs::WorkerPoolConfig;
    use std::path::PathBuf;

    fn coordinator() -> BatchCoordinator {
        let pool = Arc::new(WorkerPool::with_config(WorkerPoolConfig {
            worker_count: 2,
            queue_capacity: 16,
            executor_threads: 2,
            poll_interval_ms: 10,
        }));
        pool.start();
        BatchCoordinator::with_config(
            pool,
            CoordinatorConfig {
                download_timeout_secs: 5,
                max_retries: 2,
                retry_delay_secs: 0,
                ..CoordinatorConfig::default()
            },
        )
    }

    fn ok_work() -> Arc<dyn DownloadWork> {
        Arc::new(|url: &str, _: &Options| -> std::result::Result<PathBuf, WorkError> {
            Ok(PathBuf::from(format!("/downloads/{}", url.trim_start_matches("https://"))))
        })
    }

    fn failing_work() -> Arc<dyn DownloadWork> {
        Arc::new(|_: &str, _: &Options| -> std::result::Result<PathBuf, WorkError> {
            Err(WorkError::new("Video unavailable"))
        })
    }

    #[tokio::test]
    async fn test_unknown_download_is_not_found() {
        let coordinator = coordinator();
        let snapshot = coordinator.download_status("missing");
        assert_eq!(snapshot.status, DownloadStatus::NotFound);
        assert!(snapshot.url.is_none());
    }

    #[tokio::test]
    async fn test_unknown_batch_is_error() {
        let coordinator = coordinator();
        let err = coordinator.batch_status("missing").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_download_completes() {
        let coordinator = coordinator();
        let id = coordinator
            .submit_download("https://a/clip", ok_work(), Options::new(), None)
            .await
            .unwrap();

        coordinator.pool().await_drain().await;

        let snapshot = coordinator.download_status(&id);
        assert_eq!(snapshot.status, DownloadStatus::Completed);
        assert_eq!(snapshot.result_path, Some(PathBuf::from("/downloads/a/clip")));
        assert!(snapshot.started_at.is_some() && snapshot.finished_at.is_some());
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn test_failed_download_reports_error_string() {
        let coordinator = coordinator();
        let id = coordinator
            .submit_download("https://a", failing_work(), Options::new(), None)
            .await
            .unwrap();

        coordinator.pool().await_drain().await;

        let snapshot = coordinator.download_status(&id);
        assert_eq!(snapshot.status, DownloadStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("Video unavailable"));
    }

    #[tokio::test]
    async fn test_submit_rejected_when_pool_stopped() {
        let coordinator = coordinator();
        coordinator.pool().stop().await;

        let err = coordinator
            .submit_download("https://a", ok_work(), Options::new(), Some("b1"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NotRunning));
        assert_eq!(coordinator.download_count(), 0);
        assert_eq!(coordinator.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_named_batch_created_on_first_reference() {
        let coordinator = coordinator();
        for url in ["https://a", "https://b"] {
            coordinator
                .submit_download(url, ok_work(), Options::new(), Some("channel-42"))
                .await
                .unwrap();
        }

        coordinator.pool().await_drain().await;

        let status = coordinator.batch_status("channel-42").unwrap();
        assert_eq!(status.counts.total, 2);
        assert_eq!(status.counts.completed, 2);
        assert_eq!(status.status, BatchState::Completed);
        assert_eq!(status.progress_percent, 100.0);
    }

    #[tokio::test]
    async fn test_mixed_batch_counts() {
        let coordinator = coordinator();
        let batch = "mixed";
        coordinator
            .submit_download("https://ok", ok_work(), Options::new(), Some(batch))
            .await
            .unwrap();
        coordinator
            .submit_download("https://bad", failing_work(), Options::new(), Some(batch))
            .await
            .unwrap();

        coordinator.pool().await_drain().await;

        let status = coordinator.batch_status(batch).unwrap();
        assert_eq!(status.counts.completed, 1);
        assert_eq!(status.counts.failed, 1);
        assert_eq!(status.counts.pending, 0);
        assert_eq!(status.status, BatchState::Completed);
        assert!(status.duration_secs >= 0.0);
    }

    #[tokio::test]
    async fn test_clear_completed_keeps_recent() {
        let coordinator = coordinator();
        let batch_id = coordinator
            .submit_batch(["https://a"], ok_work(), Options::new())
            .await
            .unwrap();
        coordinator.pool().await_drain().await;

        assert_eq!(coordinator.clear_completed(Duration::from_secs(3600)), 0);
        assert_eq!(coordinator.download_count(), 1);
        assert!(coordinator.batch_status(&batch_id).is_ok());
    }

    #[tokio::test]
    async fn test_clear_completed_removes_empty_batches() {
        let coordinator = coordinator();
        let batch_id = coordinator
            .submit_batch(Vec::<String>::new(), ok_work(), Options::new())
            .await
            .unwrap();
        assert_eq!(
            coordinator.batch_status(&batch_id).unwrap().status,
            BatchState::Completed
        );

        assert_eq!(coordinator.clear_completed(Duration::from_secs(3600)), 0);
        assert_eq!(coordinator.batch_count(), 1);

        assert_eq!(coordinator.clear_completed(Duration::ZERO), 0);
        assert_eq!(coordinator.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_batch_submission_discards_partial_batch() {
        let pool = Arc::new(WorkerPool::with_config(WorkerPoolConfig {
            worker_count: 1,
            queue_capacity: 1,
            executor_threads: 1,
            poll_interval_ms: 10,
        }));
        pool.start();
        let coordinator = BatchCoordinator::with_config(pool, CoordinatorConfig::default());
        let slow: Arc<dyn DownloadWork> =
            Arc::new(|url: &str, _: &Options| -> std::result::Result<PathBuf, WorkError> {
                std::thread::sleep(Duration::from_millis(300));
                Ok(PathBuf::from(url))
            });

        let (submitted, ()) = tokio::join!(
            coordinator.submit_batch(["a", "b", "c", "d"], slow, Options::new()),
            async {
                // "a" running, "b" queued, "c" waiting for queue space.
                while coordinator.pool().stats().active == 0 || coordinator.download_count() < 3 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                coordinator.pool().stop().await;
            }
        );

        assert!(matches!(submitted, Err(Error::NotRunning)));
        assert_eq!(coordinator.download_count(), 0);
        assert_eq!(coordinator.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_clear_completed_settles_unobserved_downloads() {
        let coordinator = coordinator();
        let id = coordinator
            .submit_download("https://a", ok_work(), Options::new(), None)
            .await
            .unwrap();
        coordinator.pool().await_drain().await;

        // Never queried; the sweep must still pick it up.
        assert_eq!(coordinator.clear_completed(Duration::ZERO), 1);
        assert_eq!(
            coordinator.download_status(&id).status,
            DownloadStatus::NotFound
        );
        assert!(coordinator.pool().try_result(&id).is_none());
    }
}

//! Service container for dependency injection.
//!
//! The ServiceContainer builds the worker pool, coordinator, caches and
//! resource monitor from one [`AppConfig`] and manages their lifecycle.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::DownloadCaches;
use crate::config::AppConfig;
use crate::downloads::{BatchCoordinator, DownloadStatus};
use crate::jobs::WorkerPool;
use crate::monitor::ResourceMonitor;
use crate::Result;
use crate::utils::fs;

/// Service container holding all application services.
pub struct ServiceContainer {
    /// Application configuration.
    pub config: AppConfig,
    /// Job worker pool.
    pub pool: Arc<WorkerPool>,
    /// Download and batch coordinator.
    pub coordinator: Arc<BatchCoordinator>,
    /// Result caches.
    pub caches: DownloadCaches,
    /// Memory monitor.
    pub monitor: Arc<ResourceMonitor>,
    /// Cancellation token for graceful shutdown.
    cancellation_token: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceContainer {
    /// Create a new service container from configuration.
    pub fn new(config: AppConfig) -> Self {
        info!("Initializing service container");

        let pool = Arc::new(WorkerPool::with_config(config.pool.clone()));
        let coordinator = Arc::new(BatchCoordinator::with_config(
            pool.clone(),
            config.coordinator.clone(),
        ));
        let caches = DownloadCaches::new(config.caches.clone());
        let monitor = Arc::new(ResourceMonitor::new(
            config.monitor.clone(),
            caches.evictables(),
        ));

        Self::from_parts(config, pool, coordinator, caches, monitor)
    }

    /// Assemble a container from prebuilt services.
    pub fn from_parts(
        config: AppConfig,
        pool: Arc<WorkerPool>,
        coordinator: Arc<BatchCoordinator>,
        caches: DownloadCaches,
        monitor: Arc<ResourceMonitor>,
    ) -> Self {
        Self {
            config,
            pool,
            coordinator,
            caches,
            monitor,
            cancellation_token: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        }
    }

    /// Start workers and background tasks.
    pub async fn start(&self) -> Result<()> {
        fs::ensure_dir_all(&self.config.monitor.temp_dir).await?;

        self.pool.start();

        let token = self.cancellation_token.clone();
        let mut background = self.caches.spawn_sweepers(&token);
        background.push(self.monitor.spawn(token.clone()));
        background.push(self.coordinator.spawn_cleanup(token));
        self.background.lock().extend(background);

        info!("Services started");
        Ok(())
    }

    /// Cancel background tasks and stop the pool.
    pub async fn shutdown(&self) {
        info!("Shutting down services");
        self.cancellation_token.cancel();

        let handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                debug!(error = %e, "Background task ended abnormally");
            }
        }

        self.pool.stop().await;
        info!("Services stopped");
    }

    /// Cancellation token shared by background tasks.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// A previously downloaded file for `url`, if it is still on disk.
    pub fn cached_download(&self, url: &str) -> Option<PathBuf> {
        let path = self.caches.paths.get(url)?;
        if path.exists() {
            Some(path)
        } else {
            self.caches.paths.remove(url);
            None
        }
    }

    /// Remember the files produced by a batch's completed downloads.
    ///
    /// Returns the number of entries cached.
    pub fn remember_batch(&self, batch_id: &str) -> Result<usize> {
        let status = self.coordinator.batch_status(batch_id)?;
        let mut remembered = 0;

        for member in status.members {
            if member.status != DownloadStatus::Completed {
                continue;
            }
            let (Some(url), Some(path)) = (member.url, member.result_path) else {
                continue;
            };
            self.caches.urls.set(
                url.clone(),
                serde_json::json!({
                    "download_id": member.id,
                    "path": path.to_string_lossy(),
                }),
            );
            self.caches.paths.set(url, path);
            remembered += 1;
        }

        debug!(batch_id, remembered, "Cached completed downloads");
        Ok(remembered)
    }
}

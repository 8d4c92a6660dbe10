//! Process memory monitoring and reclamation.
//!
//! The monitor samples the resident memory of this process and, when it
//! crosses the configured ceiling, deletes temp files and trims the caches.
//! Stale temp files are purged on every pass regardless of memory pressure.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::cache::EvictableCache;
use crate::utils::fs;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Configuration for the resource monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Memory ceiling in megabytes.
    pub memory_limit_mb: f64,
    /// Interval between background passes.
    pub check_interval_secs: u64,
    /// Fraction of the ceiling at which a pass attempts reclamation.
    pub warn_ratio: f64,
    /// Directory holding temporary download artifacts.
    pub temp_dir: PathBuf,
    /// Temp files older than this are purged on every pass.
    pub temp_max_age_secs: u64,
    /// Number of oldest entries evicted from each cache on reclamation.
    pub evict_per_cache: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: 1024.0,
            check_interval_secs: 300,
            warn_ratio: 0.8,
            temp_dir: std::env::temp_dir().join("media-jobs"),
            temp_max_age_secs: 86400,
            evict_per_cache: 10,
        }
    }
}

/// A memory sample. `Unknown` is never treated as zero usage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "mb", rename_all = "lowercase")]
pub enum MemoryReading {
    Known(f64),
    Unknown,
}

impl MemoryReading {
    pub fn megabytes(&self) -> Option<f64> {
        match self {
            Self::Known(mb) => Some(*mb),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for MemoryReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(mb) => write!(f, "{mb:.1} MB"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Source of resident memory samples.
pub trait MemorySampler: Send + Sync {
    /// Resident set size of this process in bytes, if the platform reports it.
    fn resident_bytes(&self) -> Option<u64>;
}

/// Sampler backed by `sysinfo`.
pub struct SysinfoSampler {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .inspect_err(|e| warn!(error = %e, "Current process id unavailable"))
            .ok();
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SysinfoSampler {
    fn resident_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system.process(pid).map(|process| process.memory())
    }
}

/// Summary of one monitor pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorPass {
    pub reading: MemoryReading,
    pub reclaimed: bool,
    pub stale_files_removed: usize,
}

/// Keeps process memory under the configured ceiling.
pub struct ResourceMonitor {
    config: MonitorConfig,
    sampler: Arc<dyn MemorySampler>,
    caches: Vec<Arc<dyn EvictableCache>>,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig, caches: Vec<Arc<dyn EvictableCache>>) -> Self {
        Self::with_sampler(config, caches, Arc::new(SysinfoSampler::new()))
    }

    pub fn with_sampler(
        config: MonitorConfig,
        caches: Vec<Arc<dyn EvictableCache>>,
        sampler: Arc<dyn MemorySampler>,
    ) -> Self {
        Self {
            config,
            sampler,
            caches,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Sample current resident memory.
    pub fn sample(&self) -> MemoryReading {
        match self.sampler.resident_bytes() {
            Some(bytes) => MemoryReading::Known(bytes as f64 / BYTES_PER_MB),
            None => MemoryReading::Unknown,
        }
    }

    /// Current resident memory in megabytes, if known.
    pub fn usage_mb(&self) -> Option<f64> {
        self.sample().megabytes()
    }

    /// Free resources if memory is above the ceiling.
    ///
    /// Returns `true` when reclamation ran. An unknown reading never
    /// triggers reclamation. A temp directory that cannot be cleared is
    /// logged and the caches are still trimmed.
    pub async fn reclaim(&self) -> bool {
        let usage_mb = match self.sample() {
            MemoryReading::Known(mb) => mb,
            MemoryReading::Unknown => {
                warn!("Memory usage unavailable, skipping reclamation");
                return false;
            }
        };

        if usage_mb <= self.config.memory_limit_mb {
            return false;
        }

        let temp_files = match fs::remove_files_in(&self.config.temp_dir, None).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Failed to clear temp directory");
                0
            }
        };

        let mut evicted = 0;
        for cache in &self.caches {
            let removed = cache.evict_oldest_entries(self.config.evict_per_cache);
            debug!(cache = cache.cache_name(), removed, "Trimmed cache");
            evicted += removed;
        }

        info!(
            usage_mb,
            limit_mb = self.config.memory_limit_mb,
            temp_files,
            evicted,
            "Reclaimed resources"
        );
        true
    }

    /// Run a single monitoring pass.
    ///
    /// The stale temp purge runs on every pass, whatever the memory reading.
    pub async fn check_once(&self) -> Result<MonitorPass> {
        let reading = self.sample();
        let threshold = self.config.memory_limit_mb * self.config.warn_ratio;

        let reclaimed = match reading {
            MemoryReading::Known(mb) if mb > threshold => {
                warn!(
                    usage_mb = mb,
                    limit_mb = self.config.memory_limit_mb,
                    "High memory usage"
                );
                self.reclaim().await
            }
            MemoryReading::Known(_) => false,
            MemoryReading::Unknown => {
                debug!("Memory usage unavailable");
                false
            }
        };

        let stale_files_removed = fs::remove_files_in(
            &self.config.temp_dir,
            Some(Duration::from_secs(self.config.temp_max_age_secs)),
        )
        .await?;
        if stale_files_removed > 0 {
            info!(count = stale_files_removed, "Purged stale temp files");
        }

        Ok(MonitorPass {
            reading,
            reclaimed,
            stale_files_removed,
        })
    }

    /// Spawn the background monitoring loop.
    pub fn spawn(self: &Arc<Self>, cancel_token: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let interval = Duration::from_secs(monitor.config.check_interval_secs.max(1));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Resource monitor shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = monitor.check_once().await {
                            warn!(error = %e, "Resource monitor pass failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;

    struct FixedSampler(Option<u64>);

    impl MemorySampler for FixedSampler {
        fn resident_bytes(&self) -> Option<u64> {
            self.0
        }
    }

    fn mb(value: u64) -> Option<u64> {
        Some(value * 1024 * 1024)
    }

    fn filled_cache(count: usize) -> Arc<Cache<String, usize>> {
        let cache = Arc::new(Cache::new("test", Duration::from_secs(60), 100));
        for i in 0..count {
            cache.set(format!("k{i}"), i);
        }
        cache
    }

    fn monitor(
        temp_dir: PathBuf,
        sample: Option<u64>,
        cache: &Arc<Cache<String, usize>>,
    ) -> ResourceMonitor {
        let config = MonitorConfig {
            memory_limit_mb: 100.0,
            temp_dir,
            ..MonitorConfig::default()
        };
        ResourceMonitor::with_sampler(
            config,
            vec![cache.clone() as Arc<dyn EvictableCache>],
            Arc::new(FixedSampler(sample)),
        )
    }

    #[test]
    fn test_monitor_config_default() {
        let config = MonitorConfig::default();
        assert_eq!(config.check_interval_secs, 300);
        assert_eq!(config.warn_ratio, 0.8);
        assert_eq!(config.temp_max_age_secs, 86400);
        assert_eq!(config.evict_per_cache, 10);
    }

    #[test]
    fn test_unknown_is_not_zero() {
        let cache = filled_cache(0);
        let monitor = monitor(std::env::temp_dir(), None, &cache);
        assert_eq!(monitor.sample(), MemoryReading::Unknown);
        assert_eq!(monitor.usage_mb(), None);

        let monitor = self::monitor(std::env::temp_dir(), mb(0), &cache);
        assert_eq!(monitor.usage_mb(), Some(0.0));
    }

    #[test]
    fn test_sysinfo_sampler_reports_this_process() {
        let bytes = SysinfoSampler::new().resident_bytes();
        assert!(bytes.is_some_and(|b| b > 0));
    }

    #[tokio::test]
    async fn test_reclaim_below_limit_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.part"), b"a").unwrap();
        let cache = filled_cache(20);
        let monitor = monitor(dir.path().to_path_buf(), mb(50), &cache);

        assert!(!monitor.reclaim().await);
        assert_eq!(cache.len(), 20);
        assert!(dir.path().join("a.part").exists());
    }

    #[tokio::test]
    async fn test_reclaim_above_limit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.part"), b"a").unwrap();
        let cache = filled_cache(20);
        let monitor = monitor(dir.path().to_path_buf(), mb(150), &cache);

        assert!(monitor.reclaim().await);
        assert_eq!(cache.len(), 10);
        assert!(!dir.path().join("a.part").exists());
    }

    #[tokio::test]
    async fn test_reclaim_skipped_when_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let cache = filled_cache(20);
        let monitor = monitor(dir.path().to_path_buf(), None, &cache);

        assert!(!monitor.reclaim().await);
        assert_eq!(cache.len(), 20);
    }

    #[tokio::test]
    async fn test_reclaim_trims_caches_when_temp_dir_is_unusable() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("temp-file");
        std::fs::write(&not_a_dir, b"x").unwrap();
        let cache = filled_cache(20);
        let monitor = monitor(not_a_dir.clone(), mb(500), &cache);

        assert!(monitor.reclaim().await);
        assert_eq!(cache.len(), 10);
        assert!(not_a_dir.exists());
    }

    #[tokio::test]
    async fn test_check_once_trims_caches_before_failing_stale_purge() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("temp-file");
        std::fs::write(&not_a_dir, b"x").unwrap();
        let cache = filled_cache(20);
        let monitor = monitor(not_a_dir, mb(500), &cache);

        assert!(monitor.check_once().await.is_err());
        assert_eq!(cache.len(), 10);
    }

    #[tokio::test]
    async fn test_check_once_warn_band_without_reclaim() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fresh.part"), b"a").unwrap();
        let cache = filled_cache(20);
        // Above 80% of the ceiling but below the ceiling itself.
        let monitor = monitor(dir.path().to_path_buf(), mb(90), &cache);

        let pass = monitor.check_once().await.unwrap();
        assert_eq!(pass.reading, MemoryReading::Known(90.0));
        assert!(!pass.reclaimed);
        assert_eq!(pass.stale_files_removed, 0);
        assert_eq!(cache.len(), 20);
        assert!(dir.path().join("fresh.part").exists());
    }

    #[tokio::test]
    async fn test_check_once_purges_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.part"), b"a").unwrap();
        let cache = filled_cache(0);
        let config = MonitorConfig {
            memory_limit_mb: 100.0,
            temp_dir: dir.path().to_path_buf(),
            temp_max_age_secs: 0,
            ..MonitorConfig::default()
        };
        let monitor = ResourceMonitor::with_sampler(
            config,
            vec![cache as Arc<dyn EvictableCache>],
            Arc::new(FixedSampler(mb(10))),
        );

        let pass = monitor.check_once().await.unwrap();
        assert!(!pass.reclaimed);
        assert_eq!(pass.stale_files_removed, 1);
    }
}

//! Application configuration.
//!
//! Every section has sensible defaults; `MEDIA_JOBS_*` environment variables
//! (optionally from a `.env` file) override individual values.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cache::DownloadCachesConfig;
use crate::downloads::{CommandWork, CoordinatorConfig};
use crate::jobs::WorkerPoolConfig;
use crate::logging::LoggingConfig;
use crate::monitor::MonitorConfig;
use crate::{Error, Result};

/// Prefix shared by all environment variables.
pub const ENV_PREFIX: &str = "MEDIA_JOBS_";

/// External downloader used by the command-line binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloaderConfig {
    pub program: String,
    pub args: Vec<String>,
    pub output_dir: PathBuf,
}

impl DownloaderConfig {
    pub fn command_work(&self) -> CommandWork {
        CommandWork::new(&self.program, &self.output_dir).with_args(self.args.iter().cloned())
    }
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            program: "yt-dlp".to_string(),
            args: vec![
                "--no-progress".to_string(),
                "--print".to_string(),
                "after_move:filepath".to_string(),
            ],
            output_dir: PathBuf::from("downloads"),
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub pool: WorkerPoolConfig,
    pub coordinator: CoordinatorConfig,
    pub caches: DownloadCachesConfig,
    pub monitor: MonitorConfig,
    pub logging: LoggingConfig,
    pub downloader: DownloaderConfig,
}

impl AppConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvSource { lookup };
        let mut config = Self::default();

        env.apply("WORKERS", &mut config.pool.worker_count)?;
        env.apply("QUEUE_CAPACITY", &mut config.pool.queue_capacity)?;
        env.apply("EXECUTOR_THREADS", &mut config.pool.executor_threads)?;

        env.apply(
            "DOWNLOAD_TIMEOUT_SECS",
            &mut config.coordinator.download_timeout_secs,
        )?;
        env.apply("MAX_RETRIES", &mut config.coordinator.max_retries)?;
        env.apply("RETRY_DELAY_SECS", &mut config.coordinator.retry_delay_secs)?;
        env.apply(
            "CLEANUP_INTERVAL_SECS",
            &mut config.coordinator.cleanup_interval_secs,
        )?;
        env.apply(
            "COMPLETED_MAX_AGE_SECS",
            &mut config.coordinator.completed_max_age_secs,
        )?;

        env.apply("URL_CACHE_TTL_SECS", &mut config.caches.urls.max_age_secs)?;
        env.apply("URL_CACHE_SIZE", &mut config.caches.urls.max_size)?;
        env.apply("PATH_CACHE_TTL_SECS", &mut config.caches.paths.max_age_secs)?;
        env.apply("PATH_CACHE_SIZE", &mut config.caches.paths.max_size)?;
        env.apply(
            "OPTIONS_CACHE_TTL_SECS",
            &mut config.caches.options.max_age_secs,
        )?;
        env.apply("OPTIONS_CACHE_SIZE", &mut config.caches.options.max_size)?;

        env.apply("MEMORY_LIMIT_MB", &mut config.monitor.memory_limit_mb)?;
        env.apply(
            "MONITOR_INTERVAL_SECS",
            &mut config.monitor.check_interval_secs,
        )?;
        env.apply("TEMP_DIR", &mut config.monitor.temp_dir)?;
        env.apply("TEMP_MAX_AGE_SECS", &mut config.monitor.temp_max_age_secs)?;

        env.apply("LOG_FILTER", &mut config.logging.filter)?;
        if let Some(dir) = env.get("LOG_DIR") {
            config.logging.log_dir = Some(PathBuf::from(dir));
        }
        env.apply("LOG_RETENTION_DAYS", &mut config.logging.retention_days)?;

        env.apply("DOWNLOADER", &mut config.downloader.program)?;
        if let Some(args) = env.get("DOWNLOADER_ARGS") {
            config.downloader.args = args.split_whitespace().map(str::to_string).collect();
        }
        env.apply("OUTPUT_DIR", &mut config.downloader.output_dir)?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.pool.worker_count == 0 {
            return Err(Error::config("worker count must be at least 1"));
        }
        if self.pool.queue_capacity == 0 {
            return Err(Error::config("queue capacity must be at least 1"));
        }
        if self.pool.executor_threads == 0 {
            return Err(Error::config("executor threads must be at least 1"));
        }
        if self.monitor.memory_limit_mb <= 0.0 {
            return Err(Error::config("memory limit must be positive"));
        }
        if !(0.0..=1.0).contains(&self.monitor.warn_ratio) {
            return Err(Error::config("memory warn ratio must be within 0..=1"));
        }
        Ok(())
    }
}

struct EnvSource<F> {
    lookup: F,
}

impl<F> EnvSource<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty())
    }

    /// Overwrite `target` when the variable is set.
    fn apply<T>(&self, name: &str, target: &mut T) -> Result<()>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.get(name) {
            *target = raw.trim().parse().map_err(|e| {
                Error::config(format!("invalid value for {ENV_PREFIX}{name} ({raw:?}): {e}"))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.pool.worker_count, 3);
        assert_eq!(config.coordinator.max_retries, 3);
        assert_eq!(config.caches.urls.max_size, 1000);
        assert_eq!(config.monitor.check_interval_secs, 300);
        assert_eq!(config.downloader.program, "yt-dlp");
        assert!(config.logging.log_dir.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("MEDIA_JOBS_WORKERS", "8"),
            ("MEDIA_JOBS_MEMORY_LIMIT_MB", "512.5"),
            ("MEDIA_JOBS_TEMP_DIR", "/var/tmp/jobs"),
            ("MEDIA_JOBS_LOG_DIR", "/var/log/jobs"),
            ("MEDIA_JOBS_DOWNLOADER_ARGS", "-q  --print filename"),
        ])
        .unwrap();

        assert_eq!(config.pool.worker_count, 8);
        assert_eq!(config.monitor.memory_limit_mb, 512.5);
        assert_eq!(config.monitor.temp_dir, PathBuf::from("/var/tmp/jobs"));
        assert_eq!(config.logging.log_dir, Some(PathBuf::from("/var/log/jobs")));
        assert_eq!(config.downloader.args, vec!["-q", "--print", "filename"]);
    }

    #[test]
    fn test_invalid_number() {
        let err = load(&[("MEDIA_JOBS_WORKERS", "many")]).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("MEDIA_JOBS_WORKERS"));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = load(&[("MEDIA_JOBS_WORKERS", "0")]).unwrap_err();
        assert!(err.to_string().contains("worker count"));
    }

    #[test]
    fn test_blank_value_ignored() {
        let config = load(&[("MEDIA_JOBS_WORKERS", "  ")]).unwrap();
        assert_eq!(config.pool.worker_count, 3);
    }
}

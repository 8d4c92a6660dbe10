//! Download and batch records, and the status shapes reported to callers.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::jobs::JobResult;

/// Named options passed through to the download work.
pub type Options = Map<String, Value>;

/// Status of a single download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Completed,
    Failed,
    NotFound,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::NotFound => write!(f, "not_found"),
        }
    }
}

/// Status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    Completed,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// The coordinator's record of a submitted download.
#[derive(Debug, Clone)]
pub struct DownloadRecord {
    pub id: String,
    pub url: String,
    pub status: DownloadStatus,
    pub options: Options,
    pub batch_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl DownloadRecord {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        options: Options,
        batch_id: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            status: DownloadStatus::Pending,
            options,
            batch_id,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result_path: None,
            error: None,
        }
    }

    /// Record the job's outcome. Only a pending record transitions.
    pub fn apply_result(&mut self, result: &JobResult) -> bool {
        if self.status != DownloadStatus::Pending {
            return false;
        }

        self.started_at = result.started_at;
        self.finished_at = result.finished_at.or_else(|| Some(Utc::now()));

        if result.success {
            self.status = DownloadStatus::Completed;
            self.result_path = result.value.as_ref().map(value_to_path);
        } else {
            self.status = DownloadStatus::Failed;
            self.error = Some(
                result
                    .error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "Unknown error".to_string()),
            );
        }
        true
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        DownloadSnapshot {
            id: self.id.clone(),
            url: Some(self.url.clone()),
            status: self.status,
            result_path: self.result_path.clone(),
            error: self.error.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

fn value_to_path(value: &Value) -> PathBuf {
    match value {
        Value::String(s) => PathBuf::from(s),
        other => PathBuf::from(other.to_string()),
    }
}

/// Point-in-time view of a download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub id: String,
    pub url: Option<String>,
    pub status: DownloadStatus,
    pub result_path: Option<PathBuf>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DownloadSnapshot {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: None,
            status: DownloadStatus::NotFound,
            result_path: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// A named group of downloads.
#[derive(Debug, Clone)]
pub struct BatchRecord {
    pub id: String,
    pub download_ids: Vec<String>,
    pub state: BatchState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            download_ids: Vec::new(),
            state: BatchState::Pending,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Add a member. A completed batch reopens.
    pub fn push(&mut self, download_id: impl Into<String>) {
        self.download_ids.push(download_id.into());
        if self.state == BatchState::Completed {
            self.state = BatchState::Pending;
            self.finished_at = None;
        }
    }

    pub fn mark_completed(&mut self) {
        self.state = BatchState::Completed;
        self.finished_at = Some(Utc::now());
    }

    /// Elapsed seconds: to completion when finished, otherwise to `now`.
    pub fn duration_secs(&self, now: DateTime<Utc>) -> f64 {
        let end = self.finished_at.unwrap_or(now);
        (end - self.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Per-status tallies for a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

impl BatchCounts {
    pub fn tally<'a>(members: impl IntoIterator<Item = &'a DownloadSnapshot>) -> Self {
        let mut counts = Self::default();
        for member in members {
            match member.status {
                DownloadStatus::Pending => counts.pending += 1,
                DownloadStatus::Completed => counts.completed += 1,
                DownloadStatus::Failed => counts.failed += 1,
                DownloadStatus::NotFound => continue,
            }
            counts.total += 1;
        }
        counts
    }

    /// Settled share of the batch in percent, rounded to one decimal.
    pub fn progress_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let raw = (self.completed + self.failed) as f64 / self.total as f64 * 100.0;
        (raw * 10.0).round() / 10.0
    }
}

/// Point-in-time view of a batch and its members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub id: String,
    pub status: BatchState,
    pub counts: BatchCounts,
    pub progress_percent: f64,
    pub duration_secs: f64,
    pub members: Vec<DownloadSnapshot>,
}

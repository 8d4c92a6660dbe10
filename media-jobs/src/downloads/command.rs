//! Download work backed by an external downloader program.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use serde_json::Value;
use tokio::process::Command;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::models::Options;
use super::work::DownloadWork;
use crate::error::WorkError;

/// Number of stderr lines kept in the error of a failed run.
const STDERR_TAIL_LINES: usize = 5;

/// Runs `program [base_args] [--option value...] <url>` inside the output
/// directory and takes the last non-empty stdout line as the produced file.
///
/// The child is killed as soon as its attempt is abandoned, so a timed-out
/// or shut-down download never keeps writing into the output directory.
#[derive(Debug, Clone)]
pub struct CommandWork {
    program: String,
    base_args: Vec<String>,
    output_dir: PathBuf,
}

impl CommandWork {
    pub fn new(program: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            output_dir: output_dir.into(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

impl CommandWork {
    /// Run the downloader to completion, killing it if `cancel` fires first.
    async fn run(
        &self,
        url: &str,
        options: &Options,
        cancel: &CancellationToken,
    ) -> Result<Output, WorkError> {
        let option_args = option_args(options);
        debug!(program = %self.program, url, options = ?option_args, "Running downloader");

        let mut command = Command::new(&self.program);
        command
            .args(&self.base_args)
            .args(&option_args)
            .arg(url)
            .current_dir(&self.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| WorkError::new(format!("Failed to spawn {}: {e}", self.program)))?;

        tokio::select! {
            output = child.wait_with_output() => output.map_err(|e| {
                WorkError::new(format!("Failed to wait for {}: {e}", self.program))
            }),
            // Dropping the wait future drops the child, which kills it.
            _ = cancel.cancelled() => {
                warn!(program = %self.program, url, "Downloader abandoned, killing process");
                Err(WorkError::new(format!("{} was cancelled", self.program)))
            }
        }
    }
}

impl DownloadWork for CommandWork {
    fn download(&self, url: &str, options: &Options) -> Result<PathBuf, WorkError> {
        self.download_with_cancel(url, options, &CancellationToken::new())
    }

    fn download_with_cancel(
        &self,
        url: &str,
        options: &Options,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, WorkError> {
        std::fs::create_dir_all(&self.output_dir).map_err(|e| {
            WorkError::new(format!(
                "Failed to create {}: {e}",
                self.output_dir.display()
            ))
        })?;

        let output = block_on(self.run(url, options, cancel))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
            let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
            return Err(WorkError::new(format!(
                "{} exited with {}: {}",
                self.program, output.status, tail
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let produced = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .ok_or_else(|| WorkError::new(format!("{} reported no output file", self.program)))?;

        let path = PathBuf::from(produced);
        let path = if path.is_relative() {
            self.output_dir.join(path)
        } else {
            path
        };

        info!(url, path = %path.display(), "Downloader finished");
        Ok(path)
    }
}

/// Drive `future` from a blocking thread.
///
/// Executor threads belong to the runtime and reuse its process driver;
/// callers outside any runtime get a private current-thread one.
fn block_on<F: Future>(future: F) -> Result<F::Output, WorkError> {
    match Handle::try_current() {
        Ok(handle) => Ok(handle.block_on(future)),
        Err(_) => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| WorkError::new(format!("Failed to start runtime: {e}")))?;
            Ok(runtime.block_on(future))
        }
    }
}

/// Turn options into command-line flags.
///
/// `true` becomes a bare flag, `false` and `null` are dropped, strings are
/// passed verbatim and anything else as JSON.
fn option_args(options: &Options) -> Vec<String> {
    let mut args = Vec::with_capacity(options.len() * 2);
    for (key, value) in options {
        let flag = format!("--{key}");
        match value {
            Value::Bool(true) => args.push(flag),
            Value::Bool(false) | Value::Null => {}
            Value::String(s) => {
                args.push(flag);
                args.push(s.clone());
            }
            other => {
                args.push(flag);
                args.push(other.to_string());
            }
        }
    }
    args
}

//! Download work contract and its adapter onto the generic job work.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::models::Options;
use crate::error::WorkError;
use crate::jobs::{Work, WorkArgs};

/// Downloads one URL and returns the produced file.
///
/// Runs on the blocking executor.
pub trait DownloadWork: Send + Sync + 'static {
    fn download(&self, url: &str, options: &Options) -> Result<PathBuf, WorkError>;

    /// Download with a token that fires when the attempt is abandoned.
    fn download_with_cancel(
        &self,
        url: &str,
        options: &Options,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, WorkError> {
        let _ = cancel;
        self.download(url, options)
    }
}

impl<F> DownloadWork for F
where
    F: Fn(&str, &Options) -> Result<PathBuf, WorkError> + Send + Sync + 'static,
{
    fn download(&self, url: &str, options: &Options) -> Result<PathBuf, WorkError> {
        self(url, options)
    }
}

/// Adapts a [`DownloadWork`] to job arguments: the URL is the first
/// positional argument and the options are the named arguments.
pub(crate) struct DownloadJobWork(pub(crate) Arc<dyn DownloadWork>);

impl DownloadJobWork {
    pub(crate) fn args(url: &str, options: Options) -> WorkArgs {
        WorkArgs::new().arg(url).with_kwargs(options)
    }
}

impl Work for DownloadJobWork {
    fn execute(&self, args: &WorkArgs) -> Result<Value, WorkError> {
        self.execute_with_cancel(args, &CancellationToken::new())
    }

    fn execute_with_cancel(
        &self,
        args: &WorkArgs,
        cancel: &CancellationToken,
    ) -> Result<Value, WorkError> {
        let url = args
            .args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| WorkError::new("Missing download URL"))?;

        let path = self.0.download_with_cancel(url, &args.kwargs, cancel)?;
        Ok(Value::String(path.to_string_lossy().into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_passes_url_and_options() {
        let work = |url: &str, options: &Options| -> Result<PathBuf, WorkError> {
            let format = options.get("format").and_then(Value::as_str).unwrap_or("mp4");
            Ok(PathBuf::from(format!("/downloads/{}.{format}", url.len())))
        };
        let adapter = DownloadJobWork(Arc::new(work));

        let mut options = Options::new();
        options.insert("format".to_string(), Value::from("mp3"));
        let value = adapter
            .execute(&DownloadJobWork::args("https://x", options))
            .unwrap();

        assert_eq!(value, Value::from("/downloads/9.mp3"));
    }

    #[test]
    fn test_adapter_requires_url() {
        let work = |_: &str, _: &Options| -> Result<PathBuf, WorkError> { Ok(PathBuf::new()) };
        let adapter = DownloadJobWork(Arc::new(work));

        let err = adapter.execute(&WorkArgs::new()).unwrap_err();
        assert_eq!(err.message, "Missing download URL");
    }
}

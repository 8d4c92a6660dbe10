use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use media_jobs::config::AppConfig;
use media_jobs::downloads::{BatchSnapshot, BatchState, DownloadWork, Options};
use media_jobs::logging;
use media_jobs::services::ServiceContainer;

/// Interval between batch status polls while waiting for completion.
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URLs to download as one batch. Without URLs, each line read from
    /// stdin is submitted as a batch of whitespace-separated URLs.
    urls: Vec<String>,

    /// Downloader program to run for each URL
    #[arg(long)]
    downloader: Option<String>,

    /// Directory downloads are written to
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Number of concurrent workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Downloader option as key=value, passed as `--key value` (repeatable)
    #[arg(short = 'o', long = "opt", value_parser = parse_option)]
    options: Vec<(String, Value)>,

    /// Print batch status as JSON
    #[arg(long)]
    json: bool,
}

fn parse_option(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    let value = match value {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        other => Value::String(other.to_string()),
    };
    Ok((key.trim().to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::from_env().context("Failed to load configuration")?;
    if let Some(downloader) = args.downloader {
        config.downloader.program = downloader;
    }
    if let Some(output_dir) = args.output_dir {
        config.downloader.output_dir = output_dir;
    }
    if let Some(workers) = args.workers {
        config.pool.worker_count = workers;
    }
    config.validate()?;

    let logging = logging::init_logging(&config.logging)?;

    let work: Arc<dyn DownloadWork> = Arc::new(config.downloader.command_work());
    let options: Options = args.options.into_iter().collect();

    let services = ServiceContainer::new(config);
    services.start().await?;
    let _retention = logging.start_retention_cleanup(services.cancellation_token());

    let outcome = tokio::select! {
        result = run(&services, work, options, args.urls, args.json) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, abandoning unfinished downloads");
            Ok(())
        }
    };

    services.shutdown().await;
    outcome
}

async fn run(
    services: &ServiceContainer,
    work: Arc<dyn DownloadWork>,
    options: Options,
    urls: Vec<String>,
    json: bool,
) -> anyhow::Result<()> {
    if !urls.is_empty() {
        return download_batch(services, work, options, urls, json).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let urls: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        if urls.is_empty() {
            continue;
        }
        download_batch(services, work.clone(), options.clone(), urls, json).await?;
    }
    Ok(())
}

async fn download_batch(
    services: &ServiceContainer,
    work: Arc<dyn DownloadWork>,
    options: Options,
    urls: Vec<String>,
    json: bool,
) -> anyhow::Result<()> {
    let mut pending = Vec::with_capacity(urls.len());
    for url in urls {
        match services.cached_download(&url) {
            Some(path) => println!("{url} -> {} (cached)", path.display()),
            None => pending.push(url),
        }
    }
    if pending.is_empty() {
        return Ok(());
    }

    let batch_id = services
        .coordinator
        .submit_batch(&pending, work, options)
        .await
        .context("Failed to submit batch")?;
    info!(batch_id = %batch_id, downloads = pending.len(), "Waiting for batch");

    let status = loop {
        let status = services.coordinator.batch_status(&batch_id)?;
        if status.status == BatchState::Completed {
            break status;
        }
        tokio::time::sleep(STATUS_POLL_INTERVAL).await;
    };

    services.remember_batch(&batch_id)?;
    print_status(&status, json)?;
    Ok(())
}

fn print_status(status: &BatchSnapshot, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(status)?);
        return Ok(());
    }

    for member in &status.members {
        let url = member.url.as_deref().unwrap_or("?");
        match (&member.result_path, &member.error) {
            (Some(path), _) => println!("{url} -> {}", path.display()),
            (None, Some(error)) => println!("{url} failed: {error}"),
            (None, None) => println!("{url} {}", member.status),
        }
    }
    println!(
        "batch {}: {} completed, {} failed of {} in {:.1}s",
        status.id,
        status.counts.completed,
        status.counts.failed,
        status.counts.total,
        status.duration_secs
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_option() {
        assert_eq!(
            parse_option("format=mp4").unwrap(),
            ("format".to_string(), Value::from("mp4"))
        );
        assert_eq!(
            parse_option("no-playlist=true").unwrap(),
            ("no-playlist".to_string(), Value::Bool(true))
        );
        assert!(parse_option("format").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "media-jobs",
            "https://a",
            "https://b",
            "-o",
            "format=mp3",
            "--workers",
            "2",
            "--json",
        ])
        .unwrap();
        assert_eq!(args.urls.len(), 2);
        assert_eq!(args.workers, Some(2));
        assert_eq!(args.options.len(), 1);
        assert!(args.json);
    }
}

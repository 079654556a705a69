use anyhow::{bail, Context, Result};
use clap::Parser;
use downloader::cli::{normalize_legacy_args, ProgressScale};
use downloader::{DownloadConfig, DownloadError, Downloader, RetryPolicy};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Downloads one URL, printing progress as one bare number per line on stdout.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL to download
    #[arg(index = 1, required_unless_present = "url_flag", conflicts_with = "url_flag")]
    url: Option<String>,

    /// URL to download (also accepted as `-url`)
    #[arg(long = "url", id = "url_flag", value_name = "URL")]
    url_flag: Option<String>,

    /// Destination file (defaults to the last URL path segment inside --dir)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Directory to save the file in
    #[arg(short = 'd', long = "dir", default_value = ".")]
    dir: PathBuf,

    /// Maximum number of parallel segments (defaults to logical CPUs, 4..=8)
    #[arg(short = 'c', long)]
    concurrency: Option<usize>,

    /// Retries per segment after the first attempt
    #[arg(long, default_value_t = 5)]
    retries: u32,

    /// Initial retry backoff in milliseconds, doubled on every attempt
    #[arg(long = "retry-delay-ms", default_value_t = 250)]
    retry_delay_ms: u64,

    /// Times a segment that used up its retries may be handed to a new worker
    #[arg(long = "reassign", default_value_t = 1)]
    reassign: u32,

    /// Connect timeout in seconds
    #[arg(long = "connect-timeout", default_value_t = 10)]
    connect_timeout: u64,

    /// Seconds without receiving data before an attempt is abandoned
    #[arg(long = "read-timeout", default_value_t = 30)]
    read_timeout: u64,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long)]
    rate_limit: Option<u32>,

    /// Scale of the progress numbers written to stdout
    #[arg(long, value_enum, default_value = "fraction")]
    scale: ProgressScale,

    /// Progress emission interval in milliseconds
    #[arg(long = "interval-ms", default_value_t = 100)]
    interval_ms: u64,

    /// Expected SHA-256 of the file; the download fails on mismatch
    #[arg(long)]
    sha256: Option<String>,

    /// Ignore and overwrite any resume state from an earlier run
    #[arg(long = "no-resume")]
    no_resume: bool,

    /// More diagnostics on stderr (repeat for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only report errors on stderr
    #[arg(short = 'q', long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Args {
    fn url(&self) -> Result<String> {
        match self.url.as_ref().or(self.url_flag.as_ref()) {
            Some(url) => Ok(url.trim().to_string()),
            None => bail!("no URL given"),
        }
    }

    fn log_level(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "error",
            (false, 0) => "info",
            (false, 1) => "debug",
            _ => "trace",
        }
    }

    fn into_config(self) -> Result<DownloadConfig> {
        let defaults = DownloadConfig::default();
        let rate_limit = match self.rate_limit {
            Some(limit) => Some(NonZeroU32::new(limit).context("--rate-limit must be positive")?),
            None => None,
        };

        Ok(DownloadConfig {
            output: self.output,
            output_dir: self.dir,
            concurrency: self.concurrency.unwrap_or(defaults.concurrency).max(1),
            retry: RetryPolicy {
                max_retries: self.retries,
                base_delay: Duration::from_millis(self.retry_delay_ms),
                ..RetryPolicy::default()
            },
            reassign_limit: self.reassign,
            connect_timeout: Duration::from_secs(self.connect_timeout),
            read_timeout: Duration::from_secs(self.read_timeout.max(1)),
            progress_interval: Duration::from_millis(self.interval_ms.max(1)),
            scale: self.scale,
            rate_limit,
            expected_sha256: self.sha256,
            resume: !self.no_resume,
            ..defaults
        })
    }
}

async fn shutdown_signal() -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    #[cfg(unix)]
    {
        let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            _ = &mut ctrl_c => {},
            _ = term.recv() => {},
        }
        return Ok(());
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.context("failed to listen for Ctrl-C")?;
        Ok(())
    }
}

async fn run(args: Args) -> Result<()> {
    let url = args.url()?;
    let config = args.into_config()?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => {
                tracing::warn!("interrupted, stopping download");
                on_signal.cancel();
            }
            Err(e) => tracing::warn!("{:#}", e),
        }
    });

    let downloader = Downloader::new(config, cancel);
    downloader
        .run(&url, Box::new(std::io::stdout()))
        .await
        .with_context(|| format!("Failed to download {}", url))?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse_from(normalize_legacy_args(std::env::args_os()));

    // stdout carries progress numbers only; every diagnostic goes to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_level())))
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            if matches!(e.downcast_ref::<DownloadError>(), Some(DownloadError::Cancelled)) {
                ExitCode::from(130)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

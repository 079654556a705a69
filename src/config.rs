use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::ProgressScale;

pub const USER_AGENT: &str = concat!("downloader/", env!("CARGO_PKG_VERSION"));

/// Default worker count: one per logical CPU, kept within 4..=8.
pub fn default_concurrency() -> usize {
    num_cpus::get().clamp(4, 8)
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first one before a segment is given up.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomised in either direction.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        let jitter = secs * self.jitter * (rand::random::<f64>() - 0.5) * 2.0;
        Duration::from_secs_f64((secs + jitter).max(0.0)).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Explicit destination file; overrides `output_dir` + name derived from the URL.
    pub output: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// How many times a segment that exhausted its retries may be re-queued.
    pub reassign_limit: u32,
    pub connect_timeout: Duration,
    /// Longest wait for the next body chunk before the attempt counts as timed out.
    pub read_timeout: Duration,
    pub progress_interval: Duration,
    pub checkpoint_interval: Duration,
    pub scale: ProgressScale,
    pub rate_limit: Option<NonZeroU32>,
    pub expected_sha256: Option<String>,
    pub resume: bool,
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            output: None,
            output_dir: PathBuf::from("."),
            concurrency: default_concurrency(),
            retry: RetryPolicy::default(),
            reassign_limit: 1,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            progress_interval: Duration::from_millis(100),
            checkpoint_interval: Duration::from_secs(1),
            scale: ProgressScale::Fraction,
            rate_limit: None,
            expected_sha256: None,
            resume: true,
            user_agent: USER_AGENT.to_string(),
        }
    }
}

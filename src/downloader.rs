use indicatif::HumanBytes;
use reqwest::Client;
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{self, OpenOptions};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::DownloadConfig;
use crate::error::{DownloadError, DownloadResult, FetchError};
use crate::fetcher::{Fetcher, RateLimit};
use crate::hashing::calculate_hash;
use crate::planner;
use crate::progress::ProgressAggregator;
use crate::state::DownloadState;
use crate::task::{DownloadTask, Segment, SegmentState};
use crate::utils::{get_filename_from_url, part_paths, sanitize_filename};

#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub destination: PathBuf,
    pub bytes: u64,
    pub resumed_bytes: u64,
    pub segments: usize,
    pub elapsed: Duration,
}

pub struct Downloader {
    client: Client,
    config: DownloadConfig,
    rate_limit: Option<RateLimit>,
    cancel: CancellationToken,
}

impl Downloader {
    pub fn new(config: DownloadConfig, cancel: CancellationToken) -> Self {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        let rate_limit = config.rate_limit.map(RateLimit::per_second);

        Self {
            client,
            config,
            rate_limit,
            cancel,
        }
    }

    fn fetcher(&self, url: &str, cancel: CancellationToken) -> Fetcher {
        Fetcher::new(self.client.clone(), url, cancel)
            .with_retry(self.config.retry.clone())
            .with_read_timeout(self.config.read_timeout)
            .with_rate_limit(self.rate_limit.clone())
    }

    pub fn destination_for(&self, url: &Url) -> PathBuf {
        match &self.config.output {
            Some(path) => path.clone(),
            None => self
                .config
                .output_dir
                .join(sanitize_filename(&get_filename_from_url(url))),
        }
    }

    /// Downloads `url`, writing progress lines to `progress_out`.
    ///
    /// The complete value is written only after the file has been renamed into
    /// place, so it is the last line on stdout exactly when this returns `Ok`.
    pub async fn run(&self, url: &str, progress_out: Box<dyn Write + Send>) -> DownloadResult<DownloadReport> {
        let started = Instant::now();
        let parsed = Url::parse(url).map_err(|source| DownloadError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        let destination = self.destination_for(&parsed);
        let (part_path, state_path) = part_paths(&destination);

        let info = self
            .fetcher(url, self.cancel.clone())
            .probe()
            .await
            .map_err(|source| match source {
                FetchError::Cancelled => DownloadError::Cancelled,
                source => DownloadError::Probe {
                    url: url.to_string(),
                    source,
                },
            })?;

        match info.size {
            Some(size) => info!(
                "{} is {} ({}range requests)",
                url,
                HumanBytes(size),
                if info.accepts_ranges { "" } else { "no " }
            ),
            None => info!("{} has unknown size, using a single stream", url),
        }

        let task = DownloadTask {
            url: url.to_string(),
            destination,
            total_size: info.size,
            accepts_ranges: info.accepts_ranges,
            etag: info.etag,
            last_modified: info.last_modified,
        };

        let segments = self.prepare(&task, &part_path, &state_path).await?;
        let resumed_bytes: u64 = segments.iter().map(Segment::written).sum();
        let segment_count = segments.len();
        let counters: Vec<_> = segments.iter().map(Segment::counter).collect();

        let aggregator = ProgressAggregator::new(counters.clone(), task.total_size, self.config.scale, progress_out);
        let stop_progress = CancellationToken::new();
        let progress = aggregator.spawn(self.config.progress_interval, stop_progress.clone());

        let outcome = self.transfer(&task, segments, &part_path, &state_path).await;

        stop_progress.cancel();
        let mut aggregator = progress
            .await
            .map_err(|e| DownloadError::Worker(e.to_string()))?;
        outcome?;

        self.finalize(&task, &part_path, &state_path).await?;
        aggregator.finish().map_err(DownloadError::Output)?;

        let bytes: u64 = counters.iter().map(|c| c.load(Ordering::Acquire)).sum();
        let elapsed = started.elapsed();
        let transferred = bytes - resumed_bytes;
        info!(
            "saved {} to {:?} in {:.1}s ({}/s)",
            HumanBytes(bytes),
            task.destination,
            elapsed.as_secs_f64(),
            HumanBytes((transferred as f64 / elapsed.as_secs_f64().max(0.001)) as u64)
        );

        Ok(DownloadReport {
            destination: task.destination,
            bytes,
            resumed_bytes,
            segments: segment_count,
            elapsed,
        })
    }

    /// Restores segments from a matching resume record, or plans fresh ones and
    /// sizes the part file so workers can write at any offset.
    async fn prepare(&self, task: &DownloadTask, part_path: &Path, state_path: &Path) -> DownloadResult<Vec<Segment>> {
        if let Some(parent) = part_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| DownloadError::filesystem(format!("failed to create {:?}", parent), e))?;
            }
        }

        if self.config.resume && task.is_resumable() {
            if let Some(state) = DownloadState::load(state_path).await {
                let part_len = fs::metadata(part_path).await.ok().map(|m| m.len());
                if state.matches(task) && part_len == task.total_size {
                    info!("resuming with {} already on disk", HumanBytes(state.downloaded()));
                    return Ok(state.into_segments());
                }
                debug!("discarding stale resume state {:?}", state_path);
            }
        }
        remove_if_exists(state_path).await?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(part_path)
            .await
            .map_err(|e| DownloadError::filesystem(format!("failed to create {:?}", part_path), e))?;
        if let Some(size) = task.total_size {
            file.set_len(size)
                .await
                .map_err(|e| DownloadError::filesystem(format!("failed to allocate {:?}", part_path), e))?;
        }

        let segments = planner::plan(task.total_size, task.accepts_ranges, self.config.concurrency);
        debug!("planned {} segment(s)", segments.len());
        Ok(segments)
    }

    /// Runs every unfinished segment through a bounded worker pool.
    async fn transfer(
        &self,
        task: &DownloadTask,
        segments: Vec<Segment>,
        part_path: &Path,
        state_path: &Path,
    ) -> DownloadResult<()> {
        let abort = self.cancel.child_token();
        let fetcher = Arc::new(self.fetcher(&task.url, abort.clone()).with_ranges(task.accepts_ranges));
        let counters: Vec<_> = segments.iter().map(Segment::counter).collect();
        let mut ledger = DownloadState::capture(task, &segments);

        let mut queue: VecDeque<Segment> = segments
            .into_iter()
            .filter(|s| s.state != SegmentState::Complete)
            .collect();
        let mut reassigned: HashMap<usize, u32> = HashMap::new();
        let mut failure: Option<DownloadError> = None;
        let mut cancelled = false;
        let mut in_flight = JoinSet::new();

        let mut checkpoint = tokio::time::interval(self.config.checkpoint_interval);
        checkpoint.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        checkpoint.tick().await;

        loop {
            while failure.is_none() && in_flight.len() < self.config.concurrency.max(1) {
                let Some(mut segment) = queue.pop_front() else {
                    break;
                };
                let fetcher = fetcher.clone();
                let part_path = part_path.to_path_buf();
                in_flight.spawn(async move {
                    let result = fetcher.fetch(&mut segment, &part_path).await;
                    (segment, result)
                });
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                joined = in_flight.join_next() => {
                    let Some(joined) = joined else { continue };
                    let (mut segment, result) = match joined {
                        Ok(done) => done,
                        Err(e) => {
                            error!("download worker crashed: {}", e);
                            if failure.is_none() {
                                failure = Some(DownloadError::Worker(e.to_string()));
                                abort.cancel();
                            }
                            continue;
                        }
                    };

                    match result {
                        Ok(()) => debug!("segment {} complete", segment.index),
                        Err(FetchError::Cancelled) => cancelled = true,
                        Err(e) if failure.is_none() && e.is_reassignable() => {
                            let count = reassigned.entry(segment.index).or_insert(0);
                            if *count < self.config.reassign_limit {
                                *count += 1;
                                warn!("segment {} failed ({}), reassigning", segment.index, e);
                                segment.state = SegmentState::Pending;
                                queue.push_back(segment);
                            } else {
                                error!("segment {} failed: {}", segment.index, e);
                                failure = Some(DownloadError::Segment { index: segment.index, source: e });
                                abort.cancel();
                            }
                        }
                        Err(e) => {
                            error!("segment {} failed: {}", segment.index, e);
                            if failure.is_none() {
                                failure = Some(DownloadError::Segment { index: segment.index, source: e });
                                abort.cancel();
                            }
                        }
                    }
                }
                _ = checkpoint.tick() => {
                    if let Some(ledger) = ledger.as_mut() {
                        ledger.refresh(&counters);
                        if let Err(e) = ledger.save(state_path).await {
                            warn!("failed to save resume state: {}", e);
                        }
                    }
                }
            }
        }

        if failure.is_none() && !cancelled && !self.cancel.is_cancelled() {
            return Ok(());
        }

        if let Some(ledger) = ledger.as_mut() {
            ledger.refresh(&counters);
            if let Err(e) = ledger.save(state_path).await {
                warn!("failed to save resume state: {}", e);
            }
        }
        Err(failure.unwrap_or(DownloadError::Cancelled))
    }

    async fn finalize(&self, task: &DownloadTask, part_path: &Path, state_path: &Path) -> DownloadResult<()> {
        if let Some(expected) = &self.config.expected_sha256 {
            let actual = calculate_hash(part_path)
                .await
                .map_err(|e| DownloadError::filesystem(format!("failed to hash {:?}", part_path), e))?;
            if !expected.eq_ignore_ascii_case(&actual) {
                // A corrupt file is not worth resuming.
                for path in [part_path, state_path] {
                    if let Err(e) = remove_if_exists(path).await {
                        warn!("{}", e);
                    }
                }
                return Err(DownloadError::Checksum {
                    expected: expected.clone(),
                    actual,
                });
            }
            info!("verified sha256 {}", actual);
        }

        fs::rename(part_path, &task.destination)
            .await
            .map_err(|e| DownloadError::filesystem(format!("failed to move {:?} into place", part_path), e))?;
        remove_if_exists(state_path).await
    }
}

async fn remove_if_exists(path: &Path) -> DownloadResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DownloadError::filesystem(format!("failed to remove {:?}", path), e)),
    }
}

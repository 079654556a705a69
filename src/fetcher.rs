use futures::StreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use std::future::Future;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::FetchError;
use crate::task::{Segment, SegmentState};
use crate::utils::{content_range_total, header_text};

/// Byte budget shared by every worker of one download.
#[derive(Clone)]
pub struct RateLimit {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    burst: NonZeroU32,
}

impl RateLimit {
    pub fn per_second(bytes: NonZeroU32) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(bytes))),
            burst: bytes,
        }
    }

    /// Waits until `len` bytes may pass. Chunks bigger than the bucket are
    /// admitted in bucket-sized pieces.
    async fn acquire(&self, len: usize) {
        let mut left = len as u64;
        while left > 0 {
            let step = left.min(self.burst.get() as u64) as u32;
            if let Some(n) = NonZeroU32::new(step) {
                if self.limiter.until_n_ready(n).await.is_err() {
                    return;
                }
            }
            left -= step as u64;
        }
    }
}

/// What the probe learned about the remote resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub size: Option<u64>,
    pub accepts_ranges: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Issues requests for one URL: the metadata probe and per-segment ranged GETs,
/// each wrapped in bounded exponential backoff.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    url: String,
    accepts_ranges: bool,
    retry: RetryPolicy,
    read_timeout: Duration,
    rate_limit: Option<RateLimit>,
    cancel: CancellationToken,
}

impl Fetcher {
    pub fn new(client: Client, url: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            client,
            url: url.into(),
            accepts_ranges: false,
            retry: RetryPolicy::default(),
            read_timeout: Duration::from_secs(30),
            rate_limit: None,
            cancel,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: Option<RateLimit>) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_ranges(mut self, accepts_ranges: bool) -> Self {
        self.accepts_ranges = accepts_ranges;
        self
    }

    /// Asks for the first byte to learn the size and whether ranges work.
    pub async fn probe(&self) -> Result<ResourceInfo, FetchError> {
        self.with_retries("probe", || self.probe_once()).await
    }

    async fn probe_once(&self) -> Result<ResourceInfo, FetchError> {
        let request = self.client.get(&self.url).header(header::RANGE, "bytes=0-0");
        let response = self.send(request).await?;
        let status = response.status();
        debug!(
            "probe answered {} (accept-ranges: {:?}, content-range: {:?})",
            status,
            response.headers().get(header::ACCEPT_RANGES),
            response.headers().get(header::CONTENT_RANGE)
        );

        let etag = header_text(response.headers(), header::ETAG);
        let last_modified = header_text(response.headers(), header::LAST_MODIFIED);

        match status {
            StatusCode::PARTIAL_CONTENT => {
                let size = content_range_total(response.headers());
                Ok(ResourceInfo {
                    size,
                    accepts_ranges: size.is_some(),
                    etag,
                    last_modified,
                })
            }
            // An empty resource cannot satisfy even the first byte.
            StatusCode::RANGE_NOT_SATISFIABLE if content_range_total(response.headers()) == Some(0) => {
                Ok(ResourceInfo {
                    size: Some(0),
                    accepts_ranges: true,
                    etag,
                    last_modified,
                })
            }
            s if s.is_success() => Ok(ResourceInfo {
                size: response.content_length(),
                accepts_ranges: false,
                etag,
                last_modified,
            }),
            s => Err(FetchError::from_status(s)),
        }
    }

    /// Streams the rest of `segment` into `part_path` at the segment's offset.
    ///
    /// The segment is `InFlight` while this runs and ends `Complete`, `Failed`
    /// or `Cancelled`. Its counter only ever grows, also across retries.
    pub async fn fetch(&self, segment: &mut Segment, part_path: &Path) -> Result<(), FetchError> {
        if segment.remaining() == Some(0) {
            segment.state = SegmentState::Complete;
            return Ok(());
        }

        segment.state = SegmentState::InFlight;
        let result = {
            let seg = &*segment;
            let label = format!("segment {}", seg.index);
            self.with_retries(&label, || self.fetch_attempt(seg, part_path))
                .await
        };
        segment.state = match &result {
            Ok(()) => SegmentState::Complete,
            Err(FetchError::Cancelled) => SegmentState::Cancelled,
            Err(_) => SegmentState::Failed,
        };
        result
    }

    async fn fetch_attempt(&self, segment: &Segment, part_path: &Path) -> Result<(), FetchError> {
        let ranged = self.accepts_ranges && segment.len.is_some();
        let offset = segment.next_offset();
        let expected = segment.remaining();
        let mut request = self.client.get(&self.url);
        // Without ranges a retry restarts the body; drop what is already on disk.
        let mut skip = 0;

        if ranged {
            match segment.end() {
                Some(end) if offset <= end => {
                    request = request.header(header::RANGE, format!("bytes={}-{}", offset, end));
                }
                _ => return Ok(()),
            }
        } else {
            skip = segment.written();
        }

        let response = self.send(request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::from_status(status));
        }

        if ranged && status != StatusCode::PARTIAL_CONTENT && offset > 0 {
            return Err(FetchError::RangeIgnored(offset));
        }
        let body_len = if ranged && status != StatusCode::PARTIAL_CONTENT {
            // Whole body for an offset-0 segment; only the head of it is ours.
            None
        } else if ranged {
            expected
        } else {
            segment.len
        };
        if let (Some(want), Some(got)) = (body_len, response.content_length()) {
            if want != got {
                return Err(FetchError::Integrity {
                    expected: want,
                    received: got,
                });
            }
        }

        let mut file = OpenOptions::new().write(true).open(part_path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let received = self.stream_body(response, segment, &mut file, skip).await;
        file.flush().await?;
        let received = received?;

        match (expected, segment.remaining()) {
            (Some(expected), Some(left)) if left > 0 => Err(FetchError::Integrity { expected, received }),
            _ => Ok(()),
        }
    }

    /// Copies body chunks into `file`, bumping the segment counter after each
    /// write. Returns the number of bytes written by this attempt.
    async fn stream_body(
        &self,
        response: Response,
        segment: &Segment,
        file: &mut tokio::fs::File,
        mut skip: u64,
    ) -> Result<u64, FetchError> {
        let mut stream = response.bytes_stream();
        let mut received = 0;

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                next = tokio::time::timeout(self.read_timeout, stream.next()) => next,
            };
            let chunk = match next {
                Err(_) => return Err(FetchError::Timeout(self.read_timeout)),
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };

            let mut data = &chunk[..];
            if skip > 0 {
                let n = skip.min(data.len() as u64) as usize;
                data = &data[n..];
                skip -= n as u64;
            }
            if let Some(left) = segment.remaining() {
                if data.len() as u64 > left {
                    data = &data[..left as usize];
                }
            }
            if data.is_empty() {
                if segment.remaining() == Some(0) {
                    break;
                }
                continue;
            }

            if let Some(rate_limit) = &self.rate_limit {
                rate_limit.acquire(data.len()).await;
            }
            file.write_all(data).await?;
            // tokio hands the write to a blocking thread; wait for it to land
            // before the counter (and so the resume record) covers these bytes.
            file.flush().await?;
            segment.record(data.len() as u64);
            received += data.len() as u64;

            if segment.remaining() == Some(0) {
                break;
            }
        }

        Ok(received)
    }

    /// Sends `request`, giving up when the status line and headers take
    /// longer than the read timeout.
    async fn send(&self, request: RequestBuilder) -> Result<Response, FetchError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(FetchError::Cancelled),
            response = tokio::time::timeout(self.read_timeout, request.send()) => match response {
                Ok(response) => Ok(response?),
                Err(_) => Err(FetchError::Timeout(self.read_timeout)),
            },
        }
    }

    async fn with_retries<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 0;
        let mut integrity_failures = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= self.retry.max_retries {
                return Err(err);
            }
            // A short or long body gets one more chance, not the full budget.
            if matches!(err, FetchError::Integrity { .. }) {
                if integrity_failures > 0 {
                    return Err(err);
                }
                integrity_failures += 1;
            }

            attempt += 1;
            let delay = self.retry.delay(attempt);
            warn!(
                "{} failed: {} (retry {}/{} in {:?})",
                label, err, attempt, self.retry.max_retries, delay
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn rate_limit_admits_oversized_chunks() {
        let limit = RateLimit::per_second(NonZeroU32::new(1024).unwrap());
        let started = Instant::now();
        // The first bucket is full, so 2 KiB needs roughly one extra second.
        limit.acquire(2048).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(800), "took {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn retries_stop_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let fetcher = Fetcher::new(Client::new(), "http://127.0.0.1:9/", cancel);
        let err = fetcher.probe().await.unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
    }
}

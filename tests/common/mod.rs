#![allow(dead_code)]

use sha2::{Digest, Sha256};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use downloader::{DownloadConfig, RetryPolicy};

/// Deterministic pseudo-random payload so misplaced ranges show up in digests.
pub fn fixture_bytes(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x9e37_79b9;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Serves `body`, honouring `Range: bytes=a-b` when `ranges` is set.
#[derive(Clone)]
pub struct RangeFixture {
    pub body: Arc<Vec<u8>>,
    pub ranges: bool,
    pub delay: Option<Duration>,
    pub etag: Option<String>,
}

impl RangeFixture {
    pub fn new(body: Vec<u8>, ranges: bool) -> Self {
        Self {
            body: Arc::new(body),
            ranges,
            delay: None,
            etag: None,
        }
    }

    pub fn with_etag(mut self, etag: &str) -> Self {
        self.etag = Some(etag.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn requested_range(&self, request: &Request) -> Option<(u64, Option<u64>)> {
        let value = request.headers.get("range")?.to_str().ok()?;
        let range = value.strip_prefix("bytes=")?;
        let (start, end) = range.split_once('-')?;
        let start = start.parse().ok()?;
        let end = if end.is_empty() { None } else { Some(end.parse().ok()?) };
        Some((start, end))
    }
}

impl Respond for RangeFixture {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len() as u64;
        let template = match (self.ranges, self.requested_range(request)) {
            (true, Some((start, end))) => {
                if start >= total {
                    ResponseTemplate::new(416).insert_header("content-range", format!("bytes */{}", total))
                } else {
                    let end = end.unwrap_or(total - 1).min(total - 1);
                    ResponseTemplate::new(206)
                        .insert_header("accept-ranges", "bytes")
                        .insert_header("content-range", format!("bytes {}-{}/{}", start, end, total))
                        .set_body_bytes(self.body[start as usize..=end as usize].to_vec())
                }
            }
            _ => ResponseTemplate::new(200).set_body_bytes(self.body.as_ref().clone()),
        };
        let template = match &self.etag {
            Some(etag) => template.insert_header("etag", etag.as_str()),
            None => template,
        };
        match self.delay {
            Some(delay) => template.set_delay(delay),
            None => template,
        }
    }
}

pub async fn serve(server: &MockServer, route: &str, fixture: RangeFixture) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(fixture)
        .mount(server)
        .await;
}

/// True for segment requests, false for the `bytes=0-0` probe.
pub fn is_segment_request(request: &Request) -> bool {
    request
        .headers
        .get("range")
        .and_then(|v| v.to_str().ok())
        .map_or(true, |v| v != "bytes=0-0")
}

pub fn test_config(dir: &std::path::Path, concurrency: usize) -> DownloadConfig {
    DownloadConfig {
        output_dir: dir.to_path_buf(),
        concurrency,
        retry: RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            ..RetryPolicy::default()
        },
        progress_interval: Duration::from_millis(5),
        checkpoint_interval: Duration::from_millis(20),
        read_timeout: Duration::from_secs(5),
        ..DownloadConfig::default()
    }
}

/// Collects progress lines written by the downloader.
#[derive(Clone, Default)]
pub struct ProgressSink(Arc<Mutex<Vec<u8>>>);

impl Write for ProgressSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ProgressSink {
    pub fn boxed(&self) -> Box<dyn Write + Send> {
        Box::new(self.clone())
    }

    pub fn values(&self) -> Vec<f64> {
        String::from_utf8(self.0.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(|line| line.parse::<f64>().unwrap_or_else(|_| panic!("not a number: {line:?}")))
            .collect()
    }
}

pub fn assert_monotonic(values: &[f64]) {
    assert!(
        values.windows(2).all(|w| w[0] <= w[1]),
        "progress regressed: {values:?}"
    );
}

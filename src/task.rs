use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What is being downloaded and where to. Fixed once the probe has answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub url: String,
    pub destination: PathBuf,
    pub total_size: Option<u64>,
    pub accepts_ranges: bool,
    /// Validators from the probe, compared before resuming onto existing bytes.
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl DownloadTask {
    /// Only sized, range-capable resources can be continued after a restart.
    pub fn is_resumable(&self) -> bool {
        self.accepts_ranges && self.total_size.is_some_and(|size| size > 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Pending,
    InFlight,
    Complete,
    Failed,
    Cancelled,
}

/// A contiguous byte range of the resource, owned by one worker at a time.
///
/// `len` is `None` only for the single open-ended segment of a resource whose
/// size the server did not disclose.
#[derive(Debug)]
pub struct Segment {
    pub index: usize,
    pub start: u64,
    pub len: Option<u64>,
    pub state: SegmentState,
    written: Arc<AtomicU64>,
}

impl Segment {
    pub fn new(index: usize, start: u64, len: Option<u64>) -> Self {
        let state = if len == Some(0) {
            SegmentState::Complete
        } else {
            SegmentState::Pending
        };
        Self {
            index,
            start,
            len,
            state,
            written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Rebuilds a segment with bytes already on disk from an earlier run.
    pub fn restored(index: usize, start: u64, len: u64, written: u64) -> Self {
        let mut segment = Self::new(index, start, Some(len));
        let written = written.min(len);
        segment.written.store(written, Ordering::Relaxed);
        if written == len {
            segment.state = SegmentState::Complete;
        }
        segment
    }

    /// Inclusive last byte, absent for empty or open-ended segments.
    pub fn end(&self) -> Option<u64> {
        match self.len {
            Some(len) if len > 0 => Some(self.start + len - 1),
            _ => None,
        }
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> Option<u64> {
        self.len.map(|len| len.saturating_sub(self.written()))
    }

    /// Absolute file offset the next byte of this segment goes to.
    pub fn next_offset(&self) -> u64 {
        self.start + self.written()
    }

    /// Counter shared with the progress aggregator.
    pub fn counter(&self) -> Arc<AtomicU64> {
        self.written.clone()
    }

    pub(crate) fn record(&self, bytes: u64) {
        self.written.fetch_add(bytes, Ordering::AcqRel);
    }
}

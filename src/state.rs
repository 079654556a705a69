use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;

use crate::task::{DownloadTask, Segment};

/// Resume record written next to the `.part` file while a download runs.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DownloadState {
    pub url: String,
    pub total_size: u64,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    pub parts: Vec<PartState>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PartState {
    pub index: usize,
    pub start_byte: u64,
    pub len: u64,
    pub written: u64,
}

impl DownloadState {
    /// Captures segment geometry and the current counters. Returns `None` for
    /// tasks that cannot be resumed.
    pub fn capture(task: &DownloadTask, segments: &[Segment]) -> Option<Self> {
        if !task.is_resumable() {
            return None;
        }
        let parts = segments
            .iter()
            .map(|s| {
                Some(PartState {
                    index: s.index,
                    start_byte: s.start,
                    len: s.len?,
                    written: s.written(),
                })
            })
            .collect::<Option<Vec<_>>>()?;
        Some(Self {
            url: task.url.clone(),
            total_size: task.total_size?,
            etag: task.etag.clone(),
            last_modified: task.last_modified.clone(),
            parts,
            updated_at: Utc::now(),
        })
    }

    /// Copies the live counters into the record. `counters` is indexed like `parts`.
    pub fn refresh(&mut self, counters: &[Arc<AtomicU64>]) {
        for (part, counter) in self.parts.iter_mut().zip(counters) {
            part.written = counter.load(Ordering::Acquire).min(part.len);
        }
        self.updated_at = Utc::now();
    }

    /// Reads a record, treating a missing or unreadable file as "nothing to resume".
    pub async fn load(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!("ignoring unreadable resume state {:?}: {}", path, e);
                None
            }
        }
    }

    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        let content = serde_json::to_string(self)?;
        fs::write(path, content).await
    }

    /// True when the record describes this exact resource (same URL, size and
    /// validators) and its parts still tile the whole file.
    pub fn matches(&self, task: &DownloadTask) -> bool {
        if !task.is_resumable() || self.url != task.url || Some(self.total_size) != task.total_size {
            return false;
        }
        if self.etag != task.etag || self.last_modified != task.last_modified {
            return false;
        }
        let mut next = 0;
        for (i, part) in self.parts.iter().enumerate() {
            if part.index != i || part.start_byte != next || part.len == 0 || part.written > part.len {
                return false;
            }
            next += part.len;
        }
        next == self.total_size
    }

    pub fn downloaded(&self) -> u64 {
        self.parts.iter().map(|p| p.written).sum()
    }

    pub fn into_segments(self) -> Vec<Segment> {
        self.parts
            .into_iter()
            .map(|p| Segment::restored(p.index, p.start_byte, p.len, p.written))
            .collect()
    }
}

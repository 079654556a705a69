//! Segmented HTTP downloader that reports progress as bare numbers on stdout.
//!
//! The resource is probed, split into byte ranges, fetched by a bounded pool of
//! workers straight into a pre-sized `.part` file, and moved into place once
//! every range has arrived. Diagnostics go through `tracing` to stderr.

pub mod cli;
pub mod config;
pub mod downloader;
pub mod error;
pub mod fetcher;
pub mod hashing;
pub mod planner;
pub mod progress;
pub mod state;
pub mod task;
pub mod utils;

pub use config::{DownloadConfig, RetryPolicy};
pub use downloader::{DownloadReport, Downloader};
pub use error::{DownloadError, FetchError};

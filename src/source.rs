//! Record sources.
//!
//! A [`RecordSource`] returns raw, unhashed items for a named collection with
//! independent caps for the `hot` and `new` listings. Hashing and
//! deduplication are the caller's job.
//!
//! [`JsonlSource`] reads exports laid out as:
//!
//! ```text
//! <root>/<collection>/hot.jsonl
//! <root>/<collection>/new.jsonl
//! ```
//!
//! with one [`RawRecord`] JSON object per line.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::SourceConfig;
use crate::models::{RawRecord, Stream};

/// Per-listing item caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLimits {
    pub hot: usize,
    pub new: usize,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self { hot: 10, new: 25 }
    }
}

impl StreamLimits {
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            hot: config.hot_limit,
            new: config.new_limit,
        }
    }

    pub fn limit(&self, stream: Stream) -> usize {
        match stream {
            Stream::Hot => self.hot,
            Stream::New => self.new,
        }
    }
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Fetch up to `limits` raw items per listing of `collection`.
    async fn fetch(&self, collection: &str, limits: &StreamLimits) -> Result<Vec<RawRecord>>;
}

pub struct JsonlSource {
    root: PathBuf,
}

impl JsonlSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(&config.root)
    }

    fn stream_path(&self, collection: &str, stream: Stream) -> PathBuf {
        self.root
            .join(collection)
            .join(format!("{}.jsonl", stream.as_str()))
    }
}

#[async_trait]
impl RecordSource for JsonlSource {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn fetch(&self, collection: &str, limits: &StreamLimits) -> Result<Vec<RawRecord>> {
        let mut out = Vec::new();
        for stream in [Stream::Hot, Stream::New] {
            let path = self.stream_path(collection, stream);
            let items = read_stream(&path, collection, stream, limits.limit(stream)).await?;
            debug!(
                collection,
                stream = stream.as_str(),
                items = items.len(),
                "read export"
            );
            out.extend(items);
        }
        Ok(out)
    }
}

async fn read_stream(
    path: &Path,
    collection: &str,
    stream: Stream,
    limit: usize,
) -> Result<Vec<RawRecord>> {
    if limit == 0 || !path.exists() {
        return Ok(Vec::new());
    }
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let mut items = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if items.len() >= limit {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RawRecord>(line) {
            Ok(mut raw) => {
                raw.stream = stream;
                if raw.subreddit.is_empty() {
                    raw.subreddit = collection.to_string();
                }
                items.push(raw);
            }
            Err(e) => warn!(
                path = %path.display(),
                line = lineno + 1,
                error = %e,
                "skipping malformed record"
            ),
        }
    }
    Ok(items)
}

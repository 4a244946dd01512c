//! Core data models used throughout the pipeline.
//!
//! These types represent the raw items a source yields, the hashed records
//! that flow through deduplication and enrichment, the annotations produced
//! by the analysis service, and the rows landed in the staging table.

use chrono::{DateTime, TimeZone, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::hash;

/// Which listing of a collection an item was fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Hot,
    New,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Hot => "hot",
            Stream::New => "new",
        }
    }
}

/// Raw item produced by a source before hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub author: Option<String>,
    /// Seconds since the Unix epoch. Exports may carry it as a float.
    #[serde(deserialize_with = "epoch_seconds")]
    pub created_utc: i64,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub permalink: String,
    #[serde(default)]
    pub subreddit: String,
    #[serde(default)]
    pub parent_id: String,
    #[serde(default)]
    pub is_submitter: bool,
    #[serde(default)]
    pub post_title: String,
    #[serde(default)]
    pub post_body: String,
    #[serde(default = "default_stream")]
    pub stream: Stream,
}

fn default_stream() -> Stream {
    Stream::New
}

/// Accept integer or fractional epoch seconds, truncating fractions.
fn epoch_seconds<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Epoch {
        Whole(i64),
        Fractional(f64),
    }

    match Epoch::deserialize(deserializer)? {
        Epoch::Whole(secs) => Ok(secs),
        Epoch::Fractional(secs) if secs.is_finite() => Ok(secs.trunc() as i64),
        Epoch::Fractional(secs) => Err(D::Error::custom(format!(
            "created_utc is not a finite number: {}",
            secs
        ))),
    }
}

/// A hashed comment, ready for deduplication and enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub content: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub score: i64,
    pub source_location: String,
    pub origin_collection: String,
    pub parent_id: String,
    pub is_submitter: bool,
    pub parent_title: String,
    pub parent_fingerprint: String,
    pub fingerprint: String,
}

impl Record {
    /// Hash a raw item. Missing authors become `"deleted"`.
    pub fn from_raw(raw: RawRecord) -> Self {
        let fingerprint = hash::fingerprint(&raw.content);
        let parent_fingerprint = hash::parent_fingerprint(&raw.post_title, &raw.post_body);
        let created_at = Utc
            .timestamp_opt(raw.created_utc, 0)
            .single()
            .unwrap_or_default();

        Self {
            id: raw.id,
            content: raw.content,
            author: raw.author.unwrap_or_else(|| "deleted".to_string()),
            created_at,
            score: raw.score,
            source_location: raw.permalink,
            origin_collection: raw.subreddit,
            parent_id: raw.parent_id,
            is_submitter: raw.is_submitter,
            parent_title: raw.post_title,
            parent_fingerprint,
            fingerprint,
        }
    }
}

/// Completion state of a record's analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionFlag {
    Pending,
    Done,
}

impl CompletionFlag {
    /// Single-character encoding stored in the `scanned` column.
    pub fn as_db(&self) -> &'static str {
        match self {
            CompletionFlag::Pending => "N",
            CompletionFlag::Done => "Y",
        }
    }

    pub fn from_db(value: &str) -> Self {
        if value == "Y" {
            CompletionFlag::Done
        } else {
            CompletionFlag::Pending
        }
    }
}

/// Structured analysis of one record, keyed by its fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub pain_points: Vec<String>,
    pub gain_points: Vec<String>,
    pub jobs_to_be_done: Vec<String>,
    pub themes: Vec<String>,
    pub relevance_score: f64,
    pub completion_flag: CompletionFlag,
    /// Verbatim response text when a lenient parse could not produce JSON.
    pub raw_text: Option<String>,
}

impl Annotation {
    /// Empty annotation carrying only a score, marked done.
    pub fn fallback(relevance_score: f64) -> Self {
        Self {
            pain_points: Vec::new(),
            gain_points: Vec::new(),
            jobs_to_be_done: Vec::new(),
            themes: Vec::new(),
            relevance_score,
            completion_flag: CompletionFlag::Done,
            raw_text: None,
        }
    }

    /// Annotation for a response that was accepted as plain text.
    pub fn degenerate(raw_text: String, relevance_score: f64) -> Self {
        Self {
            raw_text: Some(raw_text),
            ..Self::fallback(relevance_score)
        }
    }

    pub fn is_done(&self) -> bool {
        self.completion_flag == CompletionFlag::Done
    }
}

/// A record joined with its annotation, as landed in the staging table.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingRow {
    pub record: Record,
    pub annotation: Annotation,
    pub ideal_features: Option<String>,
}

impl StagingRow {
    pub fn new(record: Record, annotation: Annotation) -> Self {
        Self {
            record,
            annotation,
            ideal_features: None,
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.record.fingerprint
    }
}

/// Encode a list column as a JSON array string.
pub fn encode_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

/// Decode a list column. Legacy comma-joined text is split on `", "`.
pub fn decode_list(value: Option<&str>) -> Vec<String> {
    match value {
        None => Vec::new(),
        Some(s) if s.trim().is_empty() => Vec::new(),
        Some(s) => serde_json::from_str::<Vec<String>>(s)
            .unwrap_or_else(|_| s.split(", ").map(|part| part.to_string()).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(content: &str) -> RawRecord {
        RawRecord {
            id: "c1".to_string(),
            content: content.to_string(),
            author: None,
            created_utc: 1_700_000_000,
            score: 4,
            permalink: "https://reddit.com/r/journaling/c1".to_string(),
            subreddit: "journaling".to_string(),
            parent_id: "t3_p1".to_string(),
            is_submitter: false,
            post_title: "Title".to_string(),
            post_body: "Body".to_string(),
            stream: Stream::Hot,
        }
    }

    #[test]
    fn created_utc_accepts_float_seconds() {
        let whole: RawRecord =
            serde_json::from_str(r#"{"id":"a","content":"x","created_utc":1717000000}"#).unwrap();
        let fractional: RawRecord =
            serde_json::from_str(r#"{"id":"a","content":"x","created_utc":1717000000.75}"#)
                .unwrap();
        assert_eq!(whole.created_utc, 1_717_000_000);
        assert_eq!(fractional.created_utc, 1_717_000_000);
        assert!(serde_json::from_str::<RawRecord>(
            r#"{"id":"a","content":"x","created_utc":"soon"}"#
        )
        .is_err());
    }

    #[test]
    fn from_raw_hashes_content_and_parent() {
        let record = Record::from_raw(raw("hello"));
        assert_eq!(record.fingerprint, hash::fingerprint("hello"));
        assert_eq!(record.parent_fingerprint, hash::fingerprint("TitleBody"));
        assert_eq!(record.author, "deleted");
        assert_eq!(record.created_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn same_content_same_record_key() {
        let mut other = raw("hello");
        other.id = "c2".to_string();
        assert_eq!(
            Record::from_raw(raw("hello")).fingerprint,
            Record::from_raw(other).fingerprint
        );
    }

    #[test]
    fn raw_record_defaults() {
        let parsed: RawRecord =
            serde_json::from_str(r#"{"id":"x","content":"hi","created_utc":5}"#).unwrap();
        assert_eq!(parsed.stream, Stream::New);
        assert!(parsed.author.is_none());
        assert_eq!(parsed.score, 0);
    }

    #[test]
    fn completion_flag_db_encoding() {
        assert_eq!(CompletionFlag::Done.as_db(), "Y");
        assert_eq!(CompletionFlag::from_db("Y"), CompletionFlag::Done);
        assert_eq!(CompletionFlag::from_db("N"), CompletionFlag::Pending);
    }

    #[test]
    fn list_encoding() {
        let items = vec!["no time".to_string(), "lost, then found".to_string()];
        assert_eq!(decode_list(Some(&encode_list(&items))), items);
        assert_eq!(decode_list(Some("a, b")), vec!["a", "b"]);
        assert!(decode_list(Some("")).is_empty());
        assert!(decode_list(None).is_empty());
    }

    #[test]
    fn fallback_annotation_is_done_and_empty() {
        let a = Annotation::fallback(0.1);
        assert!(a.is_done());
        assert!(a.pain_points.is_empty() && a.themes.is_empty());
        assert_eq!(a.relevance_score, 0.1);
    }
}

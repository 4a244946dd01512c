//! Table layouts and row (de)serialization.
//!
//! The staging table has a fixed column set; the durable table starts as a
//! copy of it and only ever grows. The checkpoint table carries the same
//! record and annotation columns plus bookkeeping.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::query_builder::Separated;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite};

use crate::db::quote_ident;
use crate::models::{decode_list, encode_list, Annotation, CompletionFlag, Record, StagingRow};

/// Primary key column of every pipeline table.
pub const KEY_COLUMN: &str = "comment_hash";

/// Staging columns in declaration order with their SQLite types.
pub const STAGING_COLUMNS: &[(&str, &str)] = &[
    ("id", "TEXT"),
    ("content", "TEXT"),
    ("author", "TEXT"),
    ("created_utc", "INTEGER"),
    ("score", "INTEGER"),
    ("permalink", "TEXT"),
    ("subreddit", "TEXT"),
    ("parent_id", "TEXT"),
    ("is_submitter", "INTEGER"),
    ("post_title", "TEXT"),
    ("post_hash", "TEXT"),
    ("comment_hash", "TEXT"),
    ("scanned", "TEXT"),
    ("pain_points", "TEXT"),
    ("gain_points", "TEXT"),
    ("jobs_to_be_done", "TEXT"),
    ("themes", "TEXT"),
    ("relevance_score", "REAL"),
    ("ideal_features", "TEXT"),
];

/// Extra checkpoint-only columns.
pub const CHECKPOINT_EXTRA_COLUMNS: &[(&str, &str)] =
    &[("raw_response", "TEXT"), ("updated_at", "INTEGER")];

/// `CREATE TABLE IF NOT EXISTS` for the given column list keyed on
/// [`KEY_COLUMN`].
pub fn create_table_sql(table: &str, columns: &[(&str, &str)]) -> String {
    let cols: Vec<String> = columns
        .iter()
        .map(|(name, ty)| format!("{} {}", quote_ident(name), ty))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {},\n    PRIMARY KEY ({})\n)",
        quote_ident(table),
        cols.join(",\n    "),
        quote_ident(KEY_COLUMN)
    )
}

pub fn staging_column_list() -> String {
    STAGING_COLUMNS
        .iter()
        .map(|(name, _)| quote_ident(name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Push the values of one staging row, in [`STAGING_COLUMNS`] order.
pub fn push_staging_values(b: &mut Separated<'_, '_, Sqlite, &'static str>, row: &StagingRow) {
    let record = &row.record;
    let annotation = &row.annotation;
    b.push_bind(record.id.clone())
        .push_bind(record.content.clone())
        .push_bind(record.author.clone())
        .push_bind(record.created_at.timestamp())
        .push_bind(record.score)
        .push_bind(record.source_location.clone())
        .push_bind(record.origin_collection.clone())
        .push_bind(record.parent_id.clone())
        .push_bind(record.is_submitter)
        .push_bind(record.parent_title.clone())
        .push_bind(record.parent_fingerprint.clone())
        .push_bind(record.fingerprint.clone())
        .push_bind(annotation.completion_flag.as_db())
        .push_bind(encode_list(&annotation.pain_points))
        .push_bind(encode_list(&annotation.gain_points))
        .push_bind(encode_list(&annotation.jobs_to_be_done))
        .push_bind(encode_list(&annotation.themes))
        .push_bind(annotation.relevance_score)
        .push_bind(row.ideal_features.clone());
}

/// Decode the record columns of a staging, checkpoint or durable row.
pub fn record_from_row(row: &SqliteRow) -> Result<Record> {
    let created_utc: i64 = row.try_get("created_utc")?;
    Ok(Record {
        id: row.try_get("id")?,
        content: row.try_get("content")?,
        author: row.try_get("author")?,
        created_at: timestamp(created_utc),
        score: row.try_get("score")?,
        source_location: row.try_get("permalink")?,
        origin_collection: row.try_get("subreddit")?,
        parent_id: row.try_get("parent_id")?,
        is_submitter: row.try_get("is_submitter")?,
        parent_title: row.try_get("post_title")?,
        parent_fingerprint: row.try_get("post_hash")?,
        fingerprint: row.try_get(KEY_COLUMN)?,
    })
}

/// Decode the annotation columns. A row with no score yet reads as 0.0.
pub fn annotation_from_row(row: &SqliteRow) -> Result<Annotation> {
    let scanned: Option<String> = row.try_get("scanned")?;
    let pain: Option<String> = row.try_get("pain_points")?;
    let gain: Option<String> = row.try_get("gain_points")?;
    let jobs: Option<String> = row.try_get("jobs_to_be_done")?;
    let themes: Option<String> = row.try_get("themes")?;
    let score: Option<f64> = row.try_get("relevance_score")?;
    let raw_text: Option<String> = row.try_get("raw_response").unwrap_or(None);

    Ok(Annotation {
        pain_points: decode_list(pain.as_deref()),
        gain_points: decode_list(gain.as_deref()),
        jobs_to_be_done: decode_list(jobs.as_deref()),
        themes: decode_list(themes.as_deref()),
        relevance_score: score.unwrap_or(0.0),
        completion_flag: CompletionFlag::from_db(scanned.as_deref().unwrap_or("N")),
        raw_text,
    })
}

pub fn staging_row_from_row(row: &SqliteRow) -> Result<StagingRow> {
    Ok(StagingRow {
        record: record_from_row(row)?,
        annotation: annotation_from_row(row)?,
        ideal_features: row.try_get("ideal_features")?,
    })
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or_default()
}

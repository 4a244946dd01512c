//! Persistent enrichment progress.
//!
//! Every record the pipeline has ever accepted is registered here as
//! `scanned = 'N'`. When its analysis finishes (or falls back) the annotation
//! and `scanned = 'Y'` are written in one row-level `UPDATE`, so an
//! interrupted run loses at most the record that was in flight and a rerun
//! skips everything already done.
//!
//! Only one runner may own the table at a time. [`Checkpoint::acquire_lease`]
//! claims it through a single-row lease table.

use anyhow::{bail, Result};
use sqlx::SqlitePool;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::db::quote_ident;
use crate::migrate;
use crate::models::{encode_list, Annotation, CompletionFlag, Record, StagingRow};
use crate::schema::{self, staging_row_from_row};

const LEASE_NAME: &str = "enrichment";

/// Counts of registered and completed records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointCounts {
    pub total: i64,
    pub done: i64,
}

impl CheckpointCounts {
    pub fn pending(&self) -> i64 {
        self.total - self.done
    }
}

#[derive(Clone)]
pub struct Checkpoint {
    pool: SqlitePool,
    table: String,
}

impl Checkpoint {
    pub fn new(pool: SqlitePool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn ensure_table(&self) -> Result<()> {
        migrate::create_checkpoint_table(&self.pool, &self.table).await
    }

    /// Register records as pending. Already-known fingerprints are left
    /// untouched. Returns the number of newly registered records.
    pub async fn register(&self, records: &[Record]) -> Result<u64> {
        let sql = format!(
            r#"
            INSERT INTO {} (id, content, author, created_utc, score, permalink, subreddit,
                            parent_id, is_submitter, post_title, post_hash, comment_hash,
                            scanned, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'N', ?)
            ON CONFLICT(comment_hash) DO NOTHING
            "#,
            quote_ident(&self.table)
        );
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for record in records {
            let result = sqlx::query(&sql)
                .bind(&record.id)
                .bind(&record.content)
                .bind(&record.author)
                .bind(record.created_at.timestamp())
                .bind(record.score)
                .bind(&record.source_location)
                .bind(&record.origin_collection)
                .bind(&record.parent_id)
                .bind(record.is_submitter)
                .bind(&record.parent_title)
                .bind(&record.parent_fingerprint)
                .bind(&record.fingerprint)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;

        Ok(inserted)
    }

    /// Completion state of one record, or `None` if it was never registered.
    pub async fn status(&self, fingerprint: &str) -> Result<Option<CompletionFlag>> {
        let sql = format!(
            "SELECT scanned FROM {} WHERE comment_hash = ?",
            quote_ident(&self.table)
        );
        let scanned: Option<Option<String>> = sqlx::query_scalar(&sql)
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?;
        Ok(scanned.map(|s| CompletionFlag::from_db(s.as_deref().unwrap_or("N"))))
    }

    pub async fn done_fingerprints(&self) -> Result<HashSet<String>> {
        let sql = format!(
            "SELECT comment_hash FROM {} WHERE scanned = 'Y'",
            quote_ident(&self.table)
        );
        let done: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        Ok(done.into_iter().collect())
    }

    /// Records still waiting for analysis, in registration order.
    pub async fn pending(&self) -> Result<Vec<Record>> {
        let sql = format!(
            "SELECT * FROM {} WHERE scanned IS NULL OR scanned <> 'Y' ORDER BY rowid",
            quote_ident(&self.table)
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(schema::record_from_row).collect()
    }

    /// Persist one finished annotation and flip the record to done.
    pub async fn mark_done(&self, fingerprint: &str, annotation: &Annotation) -> Result<()> {
        let sql = format!(
            r#"
            UPDATE {} SET
                scanned = 'Y',
                pain_points = ?,
                gain_points = ?,
                jobs_to_be_done = ?,
                themes = ?,
                relevance_score = ?,
                raw_response = ?,
                updated_at = ?
            WHERE comment_hash = ?
            "#,
            quote_ident(&self.table)
        );
        let result = sqlx::query(&sql)
            .bind(encode_list(&annotation.pain_points))
            .bind(encode_list(&annotation.gain_points))
            .bind(encode_list(&annotation.jobs_to_be_done))
            .bind(encode_list(&annotation.themes))
            .bind(annotation.relevance_score)
            .bind(&annotation.raw_text)
            .bind(chrono::Utc::now().timestamp())
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            bail!("record {} is not registered in the checkpoint", fingerprint);
        }
        debug!(fingerprint, score = annotation.relevance_score, "checkpoint updated");
        Ok(())
    }

    /// Store the feature suggestion text for a record.
    pub async fn set_ideal_features(&self, fingerprint: &str, text: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET ideal_features = ?, updated_at = ? WHERE comment_hash = ?",
            quote_ident(&self.table)
        );
        sqlx::query(&sql)
            .bind(text)
            .bind(chrono::Utc::now().timestamp())
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Done rows with `relevance_score >= threshold`, in registration order.
    pub async fn relevant_rows(&self, threshold: f64) -> Result<Vec<StagingRow>> {
        let sql = format!(
            "SELECT * FROM {} WHERE scanned = 'Y' AND relevance_score >= ? ORDER BY rowid",
            quote_ident(&self.table)
        );
        let rows = sqlx::query(&sql)
            .bind(threshold)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(staging_row_from_row).collect()
    }

    /// Relevant rows that have no feature suggestion yet.
    pub async fn missing_features(&self, threshold: f64, limit: Option<usize>) -> Result<Vec<StagingRow>> {
        let mut rows: Vec<StagingRow> = self
            .relevant_rows(threshold)
            .await?
            .into_iter()
            .filter(|row| row.ideal_features.is_none())
            .collect();
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    pub async fn counts(&self) -> Result<CheckpointCounts> {
        let sql = format!(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN scanned = 'Y' THEN 1 ELSE 0 END), 0) FROM {}",
            quote_ident(&self.table)
        );
        let (total, done): (i64, i64) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(CheckpointCounts { total, done })
    }

    // ============ Lease ============

    /// Claim exclusive ownership of the checkpoint for `run_id`.
    pub async fn acquire_lease(&self, run_id: &str) -> Result<()> {
        let lease = quote_ident(&migrate::lease_table(&self.table));
        let sql = format!(
            "INSERT INTO {} (name, run_id, acquired_at) VALUES (?, ?, ?) ON CONFLICT(name) DO NOTHING",
            lease
        );
        let result = sqlx::query(&sql)
            .bind(LEASE_NAME)
            .bind(run_id)
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            let holder: Option<(String, i64)> = sqlx::query_as(&format!(
                "SELECT run_id, acquired_at FROM {} WHERE name = ?",
                lease
            ))
            .bind(LEASE_NAME)
            .fetch_optional(&self.pool)
            .await?;
            match holder {
                Some((holder, acquired_at)) => bail!(
                    "checkpoint '{}' is held by run {} (since {}); \
                     if that process is gone, rerun with --break-lease",
                    self.table,
                    holder,
                    acquired_at
                ),
                None => bail!("checkpoint '{}' lease could not be acquired", self.table),
            }
        }
        Ok(())
    }

    pub async fn release_lease(&self, run_id: &str) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE name = ? AND run_id = ?",
            quote_ident(&migrate::lease_table(&self.table))
        );
        sqlx::query(&sql)
            .bind(LEASE_NAME)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Release `run_id`'s lease after a leased run finished with `outcome`.
    ///
    /// A failed run keeps its own error; a release failure on top of it is
    /// only logged.
    pub async fn release_after<T>(&self, run_id: &str, outcome: Result<T>) -> Result<T> {
        let released = self.release_lease(run_id).await;
        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.context("Failed to release checkpoint lease")),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release)) => {
                warn!(
                    table = %self.table,
                    run_id,
                    error = %release,
                    "failed to release checkpoint lease after failed run"
                );
                Err(e)
            }
        }
    }

    /// Run id currently holding the lease, if any.
    pub async fn lease_holder(&self) -> Result<Option<String>> {
        let sql = format!(
            "SELECT run_id FROM {} WHERE name = ?",
            quote_ident(&migrate::lease_table(&self.table))
        );
        Ok(sqlx::query_scalar(&sql)
            .bind(LEASE_NAME)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Drop any lease, whoever holds it.
    pub async fn break_lease(&self) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE name = ?",
            quote_ident(&migrate::lease_table(&self.table))
        );
        let result = sqlx::query(&sql)
            .bind(LEASE_NAME)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            warn!(table = %self.table, "broke existing checkpoint lease");
        }
        Ok(())
    }
}

//! Pipeline status overview.
//!
//! Summarises where records are: registered and analysed in the checkpoint,
//! waiting in staging, or merged into the durable table. Used by
//! `insights status` to check a run before or after merging.

use anyhow::Result;

use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::db::{self, quote_ident};

/// Row counts for each pipeline table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStatus {
    pub registered: i64,
    pub done: i64,
    pub relevant: i64,
    pub missing_features: i64,
    pub staged: Option<i64>,
    pub merged: Option<i64>,
    pub lease_holder: Option<String>,
    pub last_update: Option<i64>,
}

pub async fn collect_status(config: &Config, pool: &sqlx::SqlitePool) -> Result<PipelineStatus> {
    let mut status = PipelineStatus::default();
    let tables = &config.tables;

    if db::table_exists(pool, &tables.checkpoint).await? {
        let checkpoint = Checkpoint::new(pool.clone(), &tables.checkpoint);
        let counts = checkpoint.counts().await?;
        status.registered = counts.total;
        status.done = counts.done;

        let threshold = config.enrichment.relevance_threshold;
        let (relevant, missing, last): (i64, i64, Option<i64>) = sqlx::query_as(&format!(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN scanned = 'Y' AND relevance_score >= ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN scanned = 'Y' AND relevance_score >= ?1
                                   AND ideal_features IS NULL THEN 1 ELSE 0 END), 0),
                MAX(updated_at)
            FROM {}
            "#,
            quote_ident(&tables.checkpoint)
        ))
        .bind(threshold)
        .fetch_one(pool)
        .await?;
        status.relevant = relevant;
        status.missing_features = missing;
        status.last_update = last;

        status.lease_holder = checkpoint.lease_holder().await?;
    }

    status.staged = count_rows(pool, &tables.staging).await?;
    status.merged = count_rows(pool, &tables.main).await?;
    Ok(status)
}

async fn count_rows(pool: &sqlx::SqlitePool, table: &str) -> Result<Option<i64>> {
    if !db::table_exists(pool, table).await? {
        return Ok(None);
    }
    let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)))
        .fetch_one(pool)
        .await?;
    Ok(Some(n))
}

/// Run the status command: query the database and print a summary.
pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let status = collect_status(config, &pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Comment Insights — Pipeline Status");
    println!("==================================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!(
        "  Checkpoint:  {} registered, {} done, {} pending",
        status.registered,
        status.done,
        status.registered - status.done
    );
    println!(
        "  Relevant:    {} (>= {}), {} without features",
        status.relevant, config.enrichment.relevance_threshold, status.missing_features
    );
    println!("  Staged:      {}", display_count(status.staged));
    println!("  Merged:      {}", display_count(status.merged));
    println!(
        "  Lease:       {}",
        status.lease_holder.as_deref().unwrap_or("free")
    );
    println!(
        "  Last update: {}",
        status
            .last_update
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );
    println!();

    pool.close().await;
    Ok(())
}

fn display_count(n: Option<i64>) -> String {
    n.map(|n| n.to_string())
        .unwrap_or_else(|| "(no table)".to_string())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp relative to now (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::{Config, TablesConfig};
use crate::db::{self, quote_ident};
use crate::schema::{create_table_sql, CHECKPOINT_EXTRA_COLUMNS, STAGING_COLUMNS};

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_tables(&pool, &config.tables).await?;
    pool.close().await;
    Ok(())
}

/// Create the checkpoint, lease and staging tables if missing.
///
/// The durable table is not created here; the first merge creates it from
/// the staging layout.
pub async fn create_tables(pool: &SqlitePool, tables: &TablesConfig) -> Result<()> {
    create_checkpoint_table(pool, &tables.checkpoint).await?;
    create_staging_table(pool, &tables.staging).await?;
    Ok(())
}

pub async fn create_checkpoint_table(pool: &SqlitePool, table: &str) -> Result<()> {
    let columns: Vec<(&str, &str)> = STAGING_COLUMNS
        .iter()
        .chain(CHECKPOINT_EXTRA_COLUMNS.iter())
        .copied()
        .collect();
    sqlx::query(&create_table_sql(table, &columns))
        .execute(pool)
        .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS {} ON {}(scanned)",
        quote_ident(&format!("idx_{}_scanned", table)),
        quote_ident(table)
    ))
    .execute(pool)
    .await?;

    // Single-writer lease: at most one row, keyed on a constant name
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            name TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            acquired_at INTEGER NOT NULL
        )
        "#,
        quote_ident(&lease_table(table))
    ))
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn create_staging_table(pool: &SqlitePool, table: &str) -> Result<()> {
    sqlx::query(&create_table_sql(table, STAGING_COLUMNS))
        .execute(pool)
        .await?;
    Ok(())
}

pub fn lease_table(checkpoint_table: &str) -> String {
    format!("{}_lease", checkpoint_table)
}

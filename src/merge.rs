//! Merge reconciler: staging → durable table.
//!
//! One merge is one SQLite transaction:
//!
//! 1. read the staging columns and types,
//! 2. read the durable columns, creating the table from the staging layout
//!    (keyed on `comment_hash`) if it does not exist,
//! 3. refuse shared columns whose declared types differ, then add every
//!    staging column the durable table lacks,
//! 4. upsert all staging rows, overwriting every non-key column on conflict
//!    (staging wins),
//! 5. empty the staging table.
//!
//! The drain commits together with the upsert. Any error before commit
//! rolls back the schema changes, the upsert and the drain alike, so a retry
//! starts from the same state. Re-merging a row that was already merged
//! writes the same values again.

use anyhow::Result;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::info;

use crate::config::Config;
use crate::db::{self, quote_ident};
use crate::error::MergeError;
use crate::schema::KEY_COLUMN;

/// A column as reported by `pragma_table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
}

/// What a merge changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeResult {
    pub created_main_table: bool,
    pub columns_added: Vec<String>,
    pub rows_merged: u64,
    pub rows_drained: u64,
}

pub struct MergeReconciler {
    pool: SqlitePool,
    staging_table: String,
    main_table: String,
}

impl MergeReconciler {
    pub fn new(
        pool: SqlitePool,
        staging_table: impl Into<String>,
        main_table: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            staging_table: staging_table.into(),
            main_table: main_table.into(),
        }
    }

    pub async fn merge(&self) -> Result<MergeResult, MergeError> {
        let mut tx = self.pool.begin().await?;

        let staging_columns = describe(&mut tx, &self.staging_table).await?;
        if staging_columns.is_empty() {
            // No staging table: nothing to merge
            tx.rollback().await?;
            return Ok(MergeResult::default());
        }
        if !staging_columns.iter().any(|c| c.name == KEY_COLUMN) {
            return Err(MergeError::MissingPrimaryKey {
                table: self.staging_table.clone(),
                column: KEY_COLUMN.to_string(),
            });
        }

        let mut result = MergeResult::default();
        let main_columns = describe(&mut tx, &self.main_table).await?;

        if main_columns.is_empty() {
            create_main_table(&mut tx, &self.main_table, &staging_columns).await?;
            result.created_main_table = true;
        } else {
            if !main_columns.iter().any(|c| c.name == KEY_COLUMN) {
                return Err(MergeError::MissingPrimaryKey {
                    table: self.main_table.clone(),
                    column: KEY_COLUMN.to_string(),
                });
            }
            let missing = missing_columns(&staging_columns, &main_columns)?;
            for column in missing {
                sqlx::query(&format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    quote_ident(&self.main_table),
                    quote_ident(&column.name),
                    column.declared_type
                ))
                .execute(&mut *tx)
                .await?;
                result.columns_added.push(column.name.clone());
            }
        }

        let names: Vec<String> = staging_columns.iter().map(|c| quote_ident(&c.name)).collect();
        let updates: Vec<String> = staging_columns
            .iter()
            .filter(|c| c.name != KEY_COLUMN)
            .map(|c| format!("{0} = excluded.{0}", quote_ident(&c.name)))
            .collect();
        let conflict_action = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };

        // `WHERE true` keeps SQLite from reading ON CONFLICT as a join clause
        let upsert = format!(
            "INSERT INTO {main} ({cols}) SELECT {cols} FROM {staging} WHERE true \
             ON CONFLICT({key}) {action}",
            main = quote_ident(&self.main_table),
            cols = names.join(", "),
            staging = quote_ident(&self.staging_table),
            key = quote_ident(KEY_COLUMN),
            action = conflict_action,
        );
        result.rows_merged = sqlx::query(&upsert).execute(&mut *tx).await?.rows_affected();

        result.rows_drained = sqlx::query(&format!(
            "DELETE FROM {}",
            quote_ident(&self.staging_table)
        ))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        info!(
            staging = %self.staging_table,
            main = %self.main_table,
            created = result.created_main_table,
            columns_added = result.columns_added.len(),
            rows_merged = result.rows_merged,
            "merge committed"
        );
        Ok(result)
    }
}

/// Columns of `table` in declaration order; empty if the table is missing.
pub async fn describe(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
) -> Result<Vec<ColumnInfo>, MergeError> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT name, type FROM pragma_table_info(?) ORDER BY cid")
            .bind(table)
            .fetch_all(&mut **tx)
            .await?;
    Ok(rows
        .into_iter()
        .map(|(name, declared_type)| ColumnInfo {
            name,
            declared_type,
        })
        .collect())
}

/// Staging columns absent from `main`, in staging order.
///
/// Fails with [`MergeError::SchemaConflict`] if a shared column's declared
/// type differs, before anything is altered.
pub fn missing_columns<'a>(
    staging: &'a [ColumnInfo],
    main: &[ColumnInfo],
) -> Result<Vec<&'a ColumnInfo>, MergeError> {
    let mut missing = Vec::new();
    for column in staging {
        match main.iter().find(|m| m.name.eq_ignore_ascii_case(&column.name)) {
            Some(existing) => {
                if !existing
                    .declared_type
                    .trim()
                    .eq_ignore_ascii_case(column.declared_type.trim())
                {
                    return Err(MergeError::SchemaConflict {
                        column: column.name.clone(),
                        staging_type: column.declared_type.clone(),
                        main_type: existing.declared_type.clone(),
                    });
                }
            }
            None => missing.push(column),
        }
    }
    Ok(missing)
}

async fn create_main_table(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
    columns: &[ColumnInfo],
) -> Result<(), MergeError> {
    let cols: Vec<String> = columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.declared_type))
        .collect();
    let sql = format!(
        "CREATE TABLE {} (\n    {},\n    PRIMARY KEY ({})\n)",
        quote_ident(table),
        cols.join(",\n    "),
        quote_ident(KEY_COLUMN)
    );
    sqlx::query(&sql).execute(&mut **tx).await?;
    Ok(())
}

/// `insights merge`: reconcile staging into the durable table.
pub async fn run_merge(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let reconciler = MergeReconciler::new(
        pool.clone(),
        &config.tables.staging,
        &config.tables.main,
    );
    let result = reconciler.merge().await?;

    println!("merge {} -> {}", config.tables.staging, config.tables.main);
    if result.created_main_table {
        println!("  created table: {}", config.tables.main);
    }
    if !result.columns_added.is_empty() {
        println!("  columns added: {}", result.columns_added.join(", "));
    }
    println!("  rows merged: {}", result.rows_merged);
    println!("  staging drained: {}", result.rows_drained);
    println!("ok");

    pool.close().await;
    Ok(())
}

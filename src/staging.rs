//! Staging table: the landing area for enriched records awaiting merge.
//!
//! Inserts are batched multi-row `INSERT … ON CONFLICT(comment_hash) DO
//! NOTHING` statements inside one transaction, so landing the same batch
//! twice leaves the table exactly as landing it once. Columns can also be
//! backfilled per fingerprint when a value arrives outside the main batch
//! path (see [`crate::suggest`]).

use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use crate::db::quote_ident;
use crate::error::StagingError;
use crate::migrate;
use crate::models::StagingRow;
use crate::schema::{self, push_staging_values, staging_column_list, KEY_COLUMN};

/// A value written by [`StagingStore::update_field`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Real(f64),
    Integer(i64),
    Null,
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Real(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<Option<String>> for FieldValue {
    fn from(value: Option<String>) -> Self {
        value.map(FieldValue::Text).unwrap_or(FieldValue::Null)
    }
}

#[derive(Clone)]
pub struct StagingStore {
    pool: SqlitePool,
    table: String,
    batch_size: usize,
}

impl StagingStore {
    pub fn new(pool: SqlitePool, table: impl Into<String>, batch_size: usize) -> Self {
        Self {
            pool,
            table: table.into(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn ensure_table(&self) -> anyhow::Result<()> {
        migrate::create_staging_table(&self.pool, &self.table).await
    }

    /// Land `rows`, skipping any whose fingerprint is already staged.
    /// Returns the number of rows actually inserted.
    pub async fn insert_batch(&self, rows: &[StagingRow]) -> Result<u64, StagingError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let header = format!(
            "INSERT INTO {} ({}) ",
            quote_ident(&self.table),
            staging_column_list()
        );

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in rows.chunks(self.batch_size) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(header.as_str());
            builder.push_values(chunk, |mut b, row| push_staging_values(&mut b, row));
            builder.push(format!(" ON CONFLICT({}) DO NOTHING", quote_ident(KEY_COLUMN)));

            let result = builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected();
            debug!(
                table = %self.table,
                chunk = chunk.len(),
                inserted = result.rows_affected(),
                "staging chunk written"
            );
        }
        tx.commit().await?;

        Ok(inserted)
    }

    /// Set one column of the staged row identified by `fingerprint`.
    ///
    /// `field_name` must be an existing staging column other than the key.
    /// Returns the number of rows updated (0 if the fingerprint is not staged).
    pub async fn update_field(
        &self,
        fingerprint: &str,
        field_name: &str,
        value: impl Into<FieldValue>,
    ) -> Result<u64, StagingError> {
        if field_name == KEY_COLUMN {
            return Err(StagingError::ImmutableColumn(field_name.to_string()));
        }
        let columns = self.columns().await?;
        if !columns.iter().any(|c| c == field_name) {
            return Err(StagingError::UnknownColumn(field_name.to_string()));
        }

        let sql = format!(
            "UPDATE {} SET {} = ? WHERE {} = ?",
            quote_ident(&self.table),
            quote_ident(field_name),
            quote_ident(KEY_COLUMN)
        );
        let query = sqlx::query(&sql);
        let query = match value.into() {
            FieldValue::Text(s) => query.bind(s),
            FieldValue::Real(f) => query.bind(f),
            FieldValue::Integer(i) => query.bind(i),
            FieldValue::Null => query.bind(None::<String>),
        };
        let result = query.bind(fingerprint).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Column names of the live staging table, in declaration order.
    pub async fn columns(&self) -> Result<Vec<String>, StagingError> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info(?) ORDER BY cid")
                .bind(&self.table)
                .fetch_all(&self.pool)
                .await?;
        Ok(names)
    }

    pub async fn count(&self) -> Result<i64, StagingError> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&self.table));
        Ok(sqlx::query_scalar(&sql).fetch_one(&self.pool).await?)
    }

    /// Every staged row, ordered by fingerprint.
    pub async fn rows(&self) -> anyhow::Result<Vec<StagingRow>> {
        let sql = format!(
            "SELECT * FROM {} ORDER BY {}",
            quote_ident(&self.table),
            quote_ident(KEY_COLUMN)
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(schema::staging_row_from_row).collect()
    }
}

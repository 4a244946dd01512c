//! Error types for the component seams.
//!
//! Command-level code works in `anyhow::Result`; the components that have
//! failure modes callers branch on (analysis, staging, merge) return these.

use thiserror::Error;

/// A single failed call to the analysis service.
#[derive(Error, Debug)]
pub enum AnalysisError {
    /// Network failure, timeout, rate limit or server error. Retried.
    #[error("transient service error: {0}")]
    Transport(String),

    /// The service refused the request (bad key, bad model). Not retried.
    #[error("request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// The response could not be turned into the expected structure.
    #[error("malformed response: {reason}")]
    MalformedResponse { reason: String, body: String },
}

impl AnalysisError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AnalysisError::Rejected { .. })
    }

    pub fn malformed(reason: impl Into<String>, body: impl Into<String>) -> Self {
        AnalysisError::MalformedResponse {
            reason: reason.into(),
            body: body.into(),
        }
    }
}

/// Analysis gave up after `attempts` calls.
#[derive(Error, Debug)]
#[error("analysis failed after {attempts} attempt(s): {last_error}")]
pub struct AnalysisFailure {
    pub attempts: u32,
    pub last_error: AnalysisError,
}

/// Errors from staging-table writes.
#[derive(Error, Debug)]
pub enum StagingError {
    #[error("staging table has no column '{0}'")]
    UnknownColumn(String),

    #[error("column '{0}' is the primary key and cannot be updated")]
    ImmutableColumn(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors that abort a merge. Every variant leaves both tables untouched.
#[derive(Error, Debug)]
pub enum MergeError {
    /// A column shared by staging and the durable table has a different type.
    #[error(
        "column '{column}' is {main_type} in the durable table but {staging_type} in staging"
    )]
    SchemaConflict {
        column: String,
        staging_type: String,
        main_type: String,
    },

    #[error("table '{table}' has no '{column}' column to use as the merge key")]
    MissingPrimaryKey { table: String, column: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

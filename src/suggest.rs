//! Feature suggestions for relevant comments.
//!
//! A second, lenient analysis pass asks the service which product features
//! would serve the commenter. The answer does not travel with the main
//! enrichment batch: it is written back per fingerprint, to the checkpoint
//! (so later re-staging keeps it) and to the staging row if one is present.
//!
//! A JSON object answer becomes one `"feature, description"` line per key.
//! Any other answer is stored verbatim. A record whose calls are exhausted
//! gets [`FAILED_MARKER`] and is not retried by later passes.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::analysis::{AnalysisClient, AnalysisPayload, ChatCompletionsService};
use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::db;
use crate::models::StagingRow;
use crate::progress::{PipelineProgressEvent, PipelineProgressReporter};
use crate::staging::StagingStore;

pub const FEATURE_COLUMN: &str = "ideal_features";
pub const FAILED_MARKER: &str = "Analysis failed";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuggestStats {
    pub structured: u64,
    pub raw: u64,
    pub failed: u64,
    /// Suggestions that also reached a staged row.
    pub staged_updates: u64,
}

pub fn feature_prompt(product_context: &str, content: &str) -> String {
    format!(
        r#"Based on the following Reddit comment, suggest ideal features for {product} that would address the user's needs and preferences.

Content: {content}

Format your response as a list of features with descriptions, like:
Feature 1: Description 1
Feature 2: Description 2
etc.

Focus on features that would:
- Address pain points and challenges mentioned
- Enhance the benefits and gains described
- Help accomplish the jobs/tasks discussed
- Align with the user's style and preferences"#,
        product = product_context,
        content = content,
    )
}

/// Flatten a feature answer to the stored text form.
pub fn format_features(payload: &AnalysisPayload) -> String {
    match payload {
        AnalysisPayload::Json(Value::Object(map)) => map
            .iter()
            .map(|(feature, description)| match description {
                Value::String(s) => format!("{}, {}", feature, s),
                other => format!("{}, {}", feature, other),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        AnalysisPayload::Json(other) => other.to_string(),
        AnalysisPayload::Raw(text) => text.clone(),
    }
}

pub struct FeatureSuggester<'a> {
    client: &'a AnalysisClient,
    progress: &'a dyn PipelineProgressReporter,
    stats: SuggestStats,
}

impl<'a> FeatureSuggester<'a> {
    pub fn new(client: &'a AnalysisClient, progress: &'a dyn PipelineProgressReporter) -> Self {
        Self {
            client,
            progress,
            stats: SuggestStats::default(),
        }
    }

    pub fn stats(&self) -> SuggestStats {
        self.stats
    }

    /// Suggest features for each row and backfill the result.
    pub async fn run(
        &mut self,
        rows: &[StagingRow],
        checkpoint: &Checkpoint,
        staging: &StagingStore,
    ) -> Result<()> {
        let total = rows.len() as u64;
        for (i, row) in rows.iter().enumerate() {
            let prompt = feature_prompt(self.client.product_context(), &row.record.content);
            let (text, failed) = match self.client.complete_text(&prompt).await {
                Ok(payload) => {
                    match payload {
                        AnalysisPayload::Json(_) => self.stats.structured += 1,
                        AnalysisPayload::Raw(_) => self.stats.raw += 1,
                    }
                    (format_features(&payload), false)
                }
                Err(failure) => {
                    warn!(
                        fingerprint = %row.fingerprint(),
                        attempts = failure.attempts,
                        error = %failure.last_error,
                        "feature suggestion failed"
                    );
                    self.stats.failed += 1;
                    (FAILED_MARKER.to_string(), true)
                }
            };

            checkpoint.set_ideal_features(row.fingerprint(), &text).await?;
            self.stats.staged_updates += staging
                .update_field(row.fingerprint(), FEATURE_COLUMN, text)
                .await?;

            self.progress.report(PipelineProgressEvent::Suggesting {
                n: i as u64 + 1,
                total,
                failed,
            });
        }
        Ok(())
    }
}

/// Backfill feature suggestions for relevant rows that have none yet.
///
/// `client` is re-moded with the configured feature parse mode.
pub async fn suggest_missing(
    config: &Config,
    pool: &SqlitePool,
    client: &AnalysisClient,
    limit: Option<usize>,
    progress: &dyn PipelineProgressReporter,
) -> Result<SuggestStats> {
    let client = client
        .clone()
        .with_parse_mode(config.analysis.feature_parse_mode);
    let checkpoint = Checkpoint::new(pool.clone(), &config.tables.checkpoint);
    checkpoint.ensure_table().await?;
    let staging = StagingStore::new(
        pool.clone(),
        &config.tables.staging,
        config.staging.batch_size,
    );
    staging.ensure_table().await?;

    let run_id = Uuid::new_v4().to_string();
    checkpoint
        .acquire_lease(&run_id)
        .await
        .context("Failed to acquire checkpoint lease")?;

    let outcome = async {
        let rows = checkpoint
            .missing_features(config.enrichment.relevance_threshold, limit)
            .await?;
        progress.report(PipelineProgressEvent::Phase {
            phase: "suggesting",
            items: rows.len() as u64,
        });
        let mut suggester = FeatureSuggester::new(&client, progress);
        suggester.run(&rows, &checkpoint, &staging).await?;
        Ok::<_, anyhow::Error>(suggester.stats())
    }
    .await;
    let stats = checkpoint.release_after(&run_id, outcome).await?;

    info!(
        structured = stats.structured,
        raw = stats.raw,
        failed = stats.failed,
        "feature suggestions complete"
    );
    Ok(stats)
}

/// `insights suggest`: backfill `ideal_features` for relevant comments.
pub async fn run_suggest(
    config: &Config,
    limit: Option<usize>,
    progress: &dyn PipelineProgressReporter,
) -> Result<()> {
    let service = ChatCompletionsService::from_config(&config.analysis)?;
    let client = AnalysisClient::new(Arc::new(service), &config.analysis);
    let pool = db::connect(config).await?;

    let stats = suggest_missing(config, &pool, &client, limit, progress).await?;

    println!("suggest");
    println!("  structured: {}", stats.structured);
    println!("  raw text: {}", stats.raw);
    println!("  failed: {}", stats.failed);
    println!("  staged rows updated: {}", stats.staged_updates);
    println!("ok");

    pool.close().await;
    Ok(())
}

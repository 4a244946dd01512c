//! End-to-end pipeline run for one collection.
//!
//! ```text
//! ingest → enrich (checkpoint) → stage → suggest features → merge
//! ```
//!
//! This is the single entry point an external scheduler calls. Each stage is
//! restartable on its own: a failed run can simply be repeated.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::analysis::{AnalysisClient, ChatCompletionsService};
use crate::config::Config;
use crate::db;
use crate::enrich::{self, EnrichStats};
use crate::ingest::{Ingest, IngestStats};
use crate::merge::{MergeReconciler, MergeResult};
use crate::progress::{PipelineProgressEvent, PipelineProgressReporter};
use crate::source::{JsonlSource, RecordSource, StreamLimits};
use crate::suggest::{self, SuggestStats};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    pub ingest: IngestStats,
    pub enrich: EnrichStats,
    pub relevant: usize,
    pub staged: u64,
    pub suggest: SuggestStats,
    pub merge: MergeResult,
}

pub struct Pipeline<'a> {
    pub config: &'a Config,
    pub pool: &'a SqlitePool,
    pub source: &'a dyn RecordSource,
    pub client: &'a AnalysisClient,
    pub progress: &'a dyn PipelineProgressReporter,
}

impl<'a> Pipeline<'a> {
    pub async fn run(&self, collection: &str, break_lease: bool) -> Result<PipelineReport> {
        let config = self.config;
        let mut report = PipelineReport::default();

        self.progress.report(PipelineProgressEvent::Phase {
            phase: "ingesting",
            items: 0,
        });
        let ingest = Ingest {
            source: self.source,
            limits: StreamLimits::from_config(&config.source),
            skip_authors: &config.source.skip_authors,
        };
        report.ingest = ingest
            .run(collection, self.pool, &config.tables, false)
            .await
            .with_context(|| format!("ingest of '{}' failed", collection))?;

        let (stats, staged, relevant) =
            enrich::enrich_and_stage(config, self.pool, self.client, break_lease, self.progress)
                .await?;
        report.enrich = stats;
        report.staged = staged;
        report.relevant = relevant;

        report.suggest =
            suggest::suggest_missing(config, self.pool, self.client, None, self.progress).await?;

        self.progress.report(PipelineProgressEvent::Phase {
            phase: "merging",
            items: report.staged,
        });
        report.merge = MergeReconciler::new(
            self.pool.clone(),
            &config.tables.staging,
            &config.tables.main,
        )
        .merge()
        .await
        .context("merge failed; staging left intact")?;

        Ok(report)
    }
}

/// `insights run <collection>`.
pub async fn run_collection(
    config: &Config,
    collection: &str,
    break_lease: bool,
    progress: &dyn PipelineProgressReporter,
) -> Result<()> {
    let service = ChatCompletionsService::from_config(&config.analysis)?;
    let client = AnalysisClient::new(Arc::new(service), &config.analysis);
    let source = JsonlSource::from_config(&config.source);
    let pool = db::connect(config).await?;

    let pipeline = Pipeline {
        config,
        pool: &pool,
        source: &source,
        client: &client,
        progress,
    };
    let report = pipeline.run(collection, break_lease).await?;

    println!("run {}", collection);
    println!(
        "  ingested: {} fetched, {} new",
        report.ingest.fetched, report.ingest.registered
    );
    println!(
        "  enriched: {} analyzed, {} fallbacks",
        report.enrich.analyzed, report.enrich.fallbacks
    );
    println!("  relevant: {} ({} staged)", report.relevant, report.staged);
    println!(
        "  features: {} suggested, {} failed",
        report.suggest.structured + report.suggest.raw,
        report.suggest.failed
    );
    println!(
        "  merged: {} rows into {}",
        report.merge.rows_merged, config.tables.main
    );
    println!("ok");

    pool.close().await;
    Ok(())
}

//! Enrichment runner: drives analysis over records with per-record
//! checkpointing.
//!
//! Each record moves `Pending → Done`. A successful analysis stores its
//! annotation; an [`AnalysisFailure`](crate::error::AnalysisFailure) stores
//! the fallback annotation (empty lists, low score) instead, so a bad record
//! never halts the batch. The checkpoint row is written as soon as a record
//! finishes.
//!
//! The output is every done row of the checkpoint whose score clears the
//! relevance threshold, regardless of which run completed it.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::analysis::{AnalysisClient, ChatCompletionsService};
use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::db;
use crate::models::{Annotation, Record, StagingRow};
use crate::progress::{PipelineProgressEvent, PipelineProgressReporter};
use crate::staging::StagingStore;

/// Outcome counters for one enrichment pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichStats {
    pub analyzed: u64,
    pub fallbacks: u64,
    pub skipped: u64,
}

pub struct EnrichmentRunner<'a> {
    client: &'a AnalysisClient,
    relevance_threshold: f64,
    fallback_score: f64,
    progress: &'a dyn PipelineProgressReporter,
    stats: EnrichStats,
}

impl<'a> EnrichmentRunner<'a> {
    pub fn new(
        client: &'a AnalysisClient,
        relevance_threshold: f64,
        fallback_score: f64,
        progress: &'a dyn PipelineProgressReporter,
    ) -> Self {
        Self {
            client,
            relevance_threshold,
            fallback_score,
            progress,
            stats: EnrichStats::default(),
        }
    }

    pub fn stats(&self) -> EnrichStats {
        self.stats
    }

    /// Enrich `records` against `checkpoint` and return the relevant set.
    pub async fn run(
        &mut self,
        records: &[Record],
        checkpoint: &Checkpoint,
    ) -> Result<Vec<(Record, Annotation)>> {
        Ok(self
            .run_rows(records, checkpoint)
            .await?
            .into_iter()
            .map(|row| (row.record, row.annotation))
            .collect())
    }

    /// Same as [`run`](Self::run) but keeps the full staging rows, including
    /// any feature text already recorded.
    pub async fn run_rows(
        &mut self,
        records: &[Record],
        checkpoint: &Checkpoint,
    ) -> Result<Vec<StagingRow>> {
        checkpoint.register(records).await?;
        let mut done = checkpoint.done_fingerprints().await?;
        let total = records.len() as u64;

        for (i, record) in records.iter().enumerate() {
            let n = i as u64 + 1;
            if done.contains(&record.fingerprint) {
                self.stats.skipped += 1;
                continue;
            }

            let (annotation, fallback) = match self.client.analyze(&record.content).await {
                Ok(annotation) => {
                    self.stats.analyzed += 1;
                    (annotation, false)
                }
                Err(failure) => {
                    warn!(
                        fingerprint = %record.fingerprint,
                        attempts = failure.attempts,
                        error = %failure.last_error,
                        "analysis failed, using fallback annotation"
                    );
                    self.stats.fallbacks += 1;
                    (Annotation::fallback(self.fallback_score), true)
                }
            };

            checkpoint.mark_done(&record.fingerprint, &annotation).await?;
            done.insert(record.fingerprint.clone());
            self.progress.report(PipelineProgressEvent::Enriching {
                n,
                total,
                score: annotation.relevance_score,
                fallback,
            });
        }

        checkpoint.relevant_rows(self.relevance_threshold).await
    }
}

/// `insights enrich`: analyze every pending record, then stage the relevant
/// set.
pub async fn run_enrich(
    config: &Config,
    break_lease: bool,
    progress: &dyn PipelineProgressReporter,
) -> Result<()> {
    let service = ChatCompletionsService::from_config(&config.analysis)?;
    let client = AnalysisClient::new(Arc::new(service), &config.analysis);
    let pool = db::connect(config).await?;

    let (stats, staged, relevant) = enrich_and_stage(config, &pool, &client, break_lease, progress).await?;

    println!("enrich");
    println!("  analyzed: {}", stats.analyzed);
    println!("  fallbacks: {}", stats.fallbacks);
    println!("  skipped (already done): {}", stats.skipped);
    println!("  relevant: {}", relevant);
    println!("  staged: {}", staged);
    println!("ok");

    pool.close().await;
    Ok(())
}

/// Lease the checkpoint, enrich its pending records, and insert the relevant
/// set into staging. Returns `(stats, rows staged, relevant rows)`.
pub async fn enrich_and_stage(
    config: &Config,
    pool: &sqlx::SqlitePool,
    client: &AnalysisClient,
    break_lease: bool,
    progress: &dyn PipelineProgressReporter,
) -> Result<(EnrichStats, u64, usize)> {
    let checkpoint = Checkpoint::new(pool.clone(), &config.tables.checkpoint);
    checkpoint.ensure_table().await?;
    if break_lease {
        checkpoint.break_lease().await?;
    }

    let run_id = Uuid::new_v4().to_string();
    checkpoint
        .acquire_lease(&run_id)
        .await
        .context("Failed to acquire checkpoint lease")?;

    let outcome = enrich_pending(config, &checkpoint, client, progress).await;
    let (stats, rows) = checkpoint.release_after(&run_id, outcome).await?;

    let staging = StagingStore::new(pool.clone(), &config.tables.staging, config.staging.batch_size);
    staging.ensure_table().await?;
    progress.report(PipelineProgressEvent::Phase {
        phase: "staging",
        items: rows.len() as u64,
    });
    let staged = staging.insert_batch(&rows).await?;

    info!(
        run_id = %run_id,
        analyzed = stats.analyzed,
        fallbacks = stats.fallbacks,
        staged,
        "enrichment complete"
    );
    Ok((stats, staged, rows.len()))
}

async fn enrich_pending(
    config: &Config,
    checkpoint: &Checkpoint,
    client: &AnalysisClient,
    progress: &dyn PipelineProgressReporter,
) -> Result<(EnrichStats, Vec<StagingRow>)> {
    let pending = checkpoint.pending().await?;
    progress.report(PipelineProgressEvent::Phase {
        phase: "enriching",
        items: pending.len() as u64,
    });

    let mut runner = EnrichmentRunner::new(
        client,
        config.enrichment.relevance_threshold,
        config.enrichment.fallback_score,
        progress,
    );
    let rows = runner.run_rows(&pending, checkpoint).await?;
    Ok((runner.stats(), rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisService;
    use crate::config::AnalysisConfig;
    use crate::error::AnalysisError;
    use crate::models::{CompletionFlag, RawRecord, Stream};
    use crate::progress::NoProgress;
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers by looking up a marker word in the prompt.
    struct Keyed {
        answers: HashMap<&'static str, &'static str>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AnalysisService for Keyed {
        fn model_name(&self) -> &str {
            "keyed"
        }

        async fn complete(&self, prompt: &str) -> Result<String, AnalysisError> {
            for (marker, answer) in &self.answers {
                if prompt.contains(marker) {
                    self.calls.lock().unwrap().push(marker.to_string());
                    return Ok(answer.to_string());
                }
            }
            self.calls.lock().unwrap().push("unknown".to_string());
            Err(AnalysisError::Transport("connection reset".into()))
        }
    }

    fn keyed(answers: &[(&'static str, &'static str)]) -> Arc<Keyed> {
        Arc::new(Keyed {
            answers: answers.iter().copied().collect(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn record(content: &str) -> Record {
        Record::from_raw(RawRecord {
            id: content.to_string(),
            content: content.to_string(),
            author: Some("a".to_string()),
            created_utc: 1_700_000_000,
            score: 1,
            permalink: String::new(),
            subreddit: "journaling".to_string(),
            parent_id: String::new(),
            is_submitter: false,
            post_title: String::new(),
            post_body: String::new(),
            stream: Stream::New,
        })
    }

    async fn checkpoint() -> (tempfile::TempDir, Checkpoint) {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("e.sqlite")).await.unwrap();
        let cp = Checkpoint::new(pool, "enrichment_checkpoint");
        cp.ensure_table().await.unwrap();
        (tmp, cp)
    }

    fn client(service: Arc<Keyed>) -> AnalysisClient {
        AnalysisClient::new(service, &AnalysisConfig::default())
            .with_retry_policy(RetryPolicy::immediate(3))
    }

    #[tokio::test]
    async fn failure_falls_back_and_marks_done() {
        let (_tmp, cp) = checkpoint().await;
        let service = keyed(&[("aardvark", r#"{"relevance_score": 0.9, "themes": ["habit"]}"#)]);
        let client = client(service.clone());
        let records = vec![record("aardvark comment"), record("quokka comment")];

        let mut runner = EnrichmentRunner::new(&client, 0.5, 0.1, &NoProgress);
        let out = runner.run(&records, &cp).await.unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.content, "aardvark comment");
        assert_eq!(out[0].1.themes, vec!["habit"]);
        assert_eq!(
            runner.stats(),
            EnrichStats {
                analyzed: 1,
                fallbacks: 1,
                skipped: 0
            }
        );

        // Three attempts for the failing record
        let calls = service.calls.lock().unwrap().clone();
        assert_eq!(calls.iter().filter(|c| *c == "unknown").count(), 3);

        assert_eq!(
            cp.status(&records[1].fingerprint).await.unwrap(),
            Some(CompletionFlag::Done)
        );
        let all = cp.relevant_rows(0.0).await.unwrap();
        let failed = all.iter().find(|r| r.record.content == "quokka comment").unwrap();
        assert_eq!(failed.annotation.relevance_score, 0.1);
        assert!(failed.annotation.pain_points.is_empty());
        assert!(failed.annotation.gain_points.is_empty());
        assert!(failed.annotation.jobs_to_be_done.is_empty());
        assert!(failed.annotation.themes.is_empty());
    }

    #[tokio::test]
    async fn rerun_skips_done_records() {
        let (_tmp, cp) = checkpoint().await;
        let service = keyed(&[("narwhal", r#"{"relevance_score": 0.7}"#)]);
        let client = client(service.clone());
        let records = vec![record("narwhal")];

        let mut runner = EnrichmentRunner::new(&client, 0.5, 0.1, &NoProgress);
        runner.run(&records, &cp).await.unwrap();
        let mut again = EnrichmentRunner::new(&client, 0.5, 0.1, &NoProgress);
        let out = again.run(&records, &cp).await.unwrap();

        assert_eq!(service.calls.lock().unwrap().len(), 1);
        assert_eq!(again.stats().skipped, 1);
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn output_is_function_of_whole_table() {
        let (_tmp, cp) = checkpoint().await;
        let service = keyed(&[
            ("axolotl", r#"{"relevance_score": 0.8}"#),
            ("pangolin", r#"{"relevance_score": 0.6}"#),
        ]);
        let client = client(service);

        // Two separate runs over disjoint inputs
        let mut first = EnrichmentRunner::new(&client, 0.5, 0.1, &NoProgress);
        first.run(&[record("axolotl")], &cp).await.unwrap();
        let mut second = EnrichmentRunner::new(&client, 0.5, 0.1, &NoProgress);
        let out = second.run(&[record("pangolin")], &cp).await.unwrap();

        let contents: Vec<&str> = out.iter().map(|(r, _)| r.content.as_str()).collect();
        assert_eq!(contents, vec!["axolotl", "pangolin"]);
    }

    #[tokio::test]
    async fn repeated_record_in_one_batch_is_analyzed_once() {
        let (_tmp, cp) = checkpoint().await;
        let service = keyed(&[("okapi", r#"{"relevance_score": 0.8}"#)]);
        let client = client(service.clone());
        let records = vec![record("okapi"), record("okapi")];

        let mut runner = EnrichmentRunner::new(&client, 0.5, 0.1, &NoProgress);
        let out = runner.run(&records, &cp).await.unwrap();

        assert_eq!(service.calls.lock().unwrap().len(), 1);
        assert_eq!(runner.stats().analyzed, 1);
        assert_eq!(runner.stats().skipped, 1);
        assert_eq!(out.len(), 1);
    }

    /// Answers `tapir` and never returns for `wombat`.
    struct Stalling {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AnalysisService for Stalling {
        fn model_name(&self) -> &str {
            "stalling"
        }

        async fn complete(&self, prompt: &str) -> Result<String, AnalysisError> {
            if prompt.contains("wombat") {
                self.calls.lock().unwrap().push("wombat".to_string());
                std::future::pending::<()>().await;
            }
            self.calls.lock().unwrap().push("tapir".to_string());
            Ok(r#"{"relevance_score": 0.9}"#.to_string())
        }
    }

    #[tokio::test]
    async fn interrupted_run_loses_only_the_in_flight_record() {
        let (_tmp, cp) = checkpoint().await;
        let records = vec![record("tapir"), record("wombat")];

        let stalling = Arc::new(Stalling {
            calls: Mutex::new(Vec::new()),
        });
        let stalled = AnalysisClient::new(stalling.clone(), &AnalysisConfig::default())
            .with_retry_policy(RetryPolicy::immediate(3));
        let mut runner = EnrichmentRunner::new(&stalled, 0.5, 0.1, &NoProgress);
        let interrupted = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            runner.run(&records, &cp),
        )
        .await;
        assert!(interrupted.is_err());
        assert_eq!(*stalling.calls.lock().unwrap(), vec!["tapir", "wombat"]);

        assert_eq!(
            cp.status(&records[0].fingerprint).await.unwrap(),
            Some(CompletionFlag::Done)
        );
        assert_eq!(
            cp.status(&records[1].fingerprint).await.unwrap(),
            Some(CompletionFlag::Pending)
        );

        // The next run only pays for the record that was in flight
        let service = keyed(&[("wombat", r#"{"relevance_score": 0.7}"#)]);
        let client = client(service.clone());
        let mut resumed = EnrichmentRunner::new(&client, 0.5, 0.1, &NoProgress);
        let out = resumed.run(&records, &cp).await.unwrap();

        assert_eq!(*service.calls.lock().unwrap(), vec!["wombat"]);
        assert_eq!(resumed.stats().skipped, 1);
        assert_eq!(resumed.stats().analyzed, 1);
        assert_eq!(out.len(), 2);
    }
}

//! End-to-end pipeline tests against JSONL exports and a scripted analysis
//! service.

use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use comment_insights::analysis::{AnalysisClient, AnalysisService};
use comment_insights::checkpoint::Checkpoint;
use comment_insights::config::Config;
use comment_insights::db;
use comment_insights::error::AnalysisError;
use comment_insights::hash;
use comment_insights::models::CompletionFlag;
use comment_insights::pipeline::Pipeline;
use comment_insights::progress::NoProgress;
use comment_insights::source::JsonlSource;

const GRATITUDE: &str = "My gratitude journal changed my mornings";
const KUMQUAT: &str = "Anyone have kumquat recipes?";
const ZEPPELIN: &str = "Long zeppelin tangent about nothing";

/// Answers by marker word; prompts for `zeppelin` always fail in transport.
struct Scripted {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl AnalysisService for Scripted {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &str) -> Result<String, AnalysisError> {
        let feature_pass = prompt.contains("suggest ideal features");
        let marker = ["gratitude", "kumquat", "zeppelin"]
            .into_iter()
            .find(|m| prompt.contains(m))
            .unwrap_or("unknown");
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}:{}", if feature_pass { "feature" } else { "annotate" }, marker));

        match (feature_pass, marker) {
            (_, "zeppelin") => Err(AnalysisError::Transport("connection reset".into())),
            (true, "gratitude") => Ok(r#"{"Gratitude prompts": "Three things a day"}"#.into()),
            (true, _) => Ok("Feature 1: Reminders".into()),
            (false, "gratitude") => Ok(
                "```json\n{\"pain_points\": [\"busy mornings\"], \"gain_points\": [\"calm\"], \
                 \"jobs_to_be_done\": [\"start the day\"], \"themes\": [\"gratitude\"], \
                 \"relevance_score\": 0.9}\n```"
                    .into(),
            ),
            (false, "kumquat") => Ok(r#"{"relevance_score": "0.2", "themes": "food"}"#.into()),
            _ => Ok(r#"{"relevance_score": 0.5}"#.into()),
        }
    }
}

impl Scripted {
    fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    fn total(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

fn line(id: &str, content: &str, author: &str) -> String {
    serde_json::json!({
        "id": id,
        "content": content,
        "author": author,
        "created_utc": 1_717_000_000,
        "score": 4,
        "permalink": format!("/r/Journaling/comments/{id}"),
        "parent_id": "t3_abc",
        "is_submitter": false,
        "post_title": "What keeps you journaling?",
        "post_body": "Curious about habits."
    })
    .to_string()
}

fn write_exports(root: &Path) {
    let dir = root.join("Journaling");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("hot.jsonl"),
        [
            line("c1", GRATITUDE, "alice"),
            line("c2", "Please follow rule 2", "AutoModerator"),
            line("c3", KUMQUAT, "bob"),
        ]
        .join("\n"),
    )
    .unwrap();
    std::fs::write(
        dir.join("new.jsonl"),
        [line("c4", ZEPPELIN, "carol"), line("c5", GRATITUDE, "dave")].join("\n"),
    )
    .unwrap();
}

struct Harness {
    _tmp: TempDir,
    config: Config,
    pool: sqlx::SqlitePool,
    service: Arc<Scripted>,
    client: AnalysisClient,
    source: JsonlSource,
}

async fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::with_db_path(tmp.path().join("insights.sqlite"));
    config.source.root = tmp.path().join("exports");
    config.analysis.initial_delay_ms = 0;
    write_exports(&config.source.root);

    let pool = db::connect(&config).await.unwrap();
    let service = Arc::new(Scripted {
        calls: Mutex::new(Vec::new()),
    });
    let client = AnalysisClient::new(service.clone(), &config.analysis);
    let source = JsonlSource::from_config(&config.source);

    Harness {
        _tmp: tmp,
        config,
        pool,
        service,
        client,
        source,
    }
}

impl Harness {
    fn pipeline(&self) -> Pipeline<'_> {
        Pipeline {
            config: &self.config,
            pool: &self.pool,
            source: &self.source,
            client: &self.client,
            progress: &NoProgress,
        }
    }

    async fn main_rows(&self) -> Vec<(String, String, f64, Option<String>, String)> {
        sqlx::query_as(
            "SELECT comment_hash, content, relevance_score, ideal_features, themes \
             FROM analyzed_comments ORDER BY content",
        )
        .fetch_all(&self.pool)
        .await
        .unwrap()
    }

    async fn staging_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM analyzed_comments_staging")
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn run_lands_relevant_comments_in_main() {
    let h = harness().await;
    let report = h.pipeline().run("Journaling", false).await.unwrap();

    assert_eq!(report.ingest.fetched, 5);
    assert_eq!(report.ingest.skipped_authors, 1);
    assert_eq!(report.ingest.registered, 3);
    assert_eq!(report.enrich.analyzed, 2);
    assert_eq!(report.enrich.fallbacks, 1);
    assert_eq!(report.relevant, 1);
    assert!(report.merge.created_main_table);
    assert_eq!(report.merge.rows_merged, 1);

    let rows = h.main_rows().await;
    assert_eq!(rows.len(), 1);
    let (fp, content, score, features, themes) = &rows[0];
    assert_eq!(fp, &hash::fingerprint(GRATITUDE));
    assert_eq!(content, GRATITUDE);
    assert_eq!(*score, 0.9);
    assert_eq!(features.as_deref(), Some("Gratitude prompts, Three things a day"));
    assert_eq!(themes, r#"["gratitude"]"#);

    assert_eq!(h.staging_count().await, 0);

    // The failing comment was tried three times, then fell back
    assert_eq!(h.service.count("annotate:zeppelin"), 3);
    let checkpoint = Checkpoint::new(h.pool.clone(), &h.config.tables.checkpoint);
    assert_eq!(
        checkpoint.status(&hash::fingerprint(ZEPPELIN)).await.unwrap(),
        Some(CompletionFlag::Done)
    );
    let all = checkpoint.relevant_rows(0.0).await.unwrap();
    let fallback = all
        .iter()
        .find(|r| r.record.content == ZEPPELIN)
        .unwrap();
    assert_eq!(fallback.annotation.relevance_score, 0.1);
    assert!(fallback.annotation.themes.is_empty());
    assert!(fallback.annotation.pain_points.is_empty());
}

#[tokio::test]
async fn rerun_makes_no_calls_and_leaves_main_unchanged() {
    let h = harness().await;
    h.pipeline().run("Journaling", false).await.unwrap();
    let before = h.main_rows().await;
    let calls = h.service.total();

    let report = h.pipeline().run("Journaling", false).await.unwrap();

    assert_eq!(report.ingest.fresh, 0);
    assert_eq!(report.enrich.analyzed, 0);
    assert_eq!(report.enrich.fallbacks, 0);
    assert_eq!(h.service.total(), calls);
    assert_eq!(h.main_rows().await, before);
    assert_eq!(h.staging_count().await, 0);
}

#[tokio::test]
async fn merge_overwrites_and_grows_existing_main_table() {
    let h = harness().await;
    let fp = hash::fingerprint(GRATITUDE);
    sqlx::query(
        "CREATE TABLE analyzed_comments (comment_hash TEXT PRIMARY KEY, content TEXT, \
         relevance_score REAL, reviewer_note TEXT)",
    )
    .execute(&h.pool)
    .await
    .unwrap();
    sqlx::query("INSERT INTO analyzed_comments VALUES (?, ?, 0.3, 'seen in Q2')")
        .bind(&fp)
        .bind(GRATITUDE)
        .execute(&h.pool)
        .await
        .unwrap();

    let report = h.pipeline().run("Journaling", false).await.unwrap();

    assert!(!report.merge.created_main_table);
    assert!(report.merge.columns_added.contains(&"themes".to_string()));
    assert!(report.merge.columns_added.contains(&"ideal_features".to_string()));
    assert!(!report.merge.columns_added.contains(&"content".to_string()));

    let (score, note): (f64, String) = sqlx::query_as(
        "SELECT relevance_score, reviewer_note FROM analyzed_comments WHERE comment_hash = ?",
    )
    .bind(&fp)
    .fetch_one(&h.pool)
    .await
    .unwrap();
    assert_eq!(score, 0.9);
    assert_eq!(note, "seen in Q2");
}

#[tokio::test]
async fn held_lease_blocks_run_until_broken() {
    let h = harness().await;
    let checkpoint = Checkpoint::new(h.pool.clone(), &h.config.tables.checkpoint);
    checkpoint.ensure_table().await.unwrap();
    checkpoint.acquire_lease("crashed-run").await.unwrap();

    let err = h.pipeline().run("Journaling", false).await.unwrap_err();
    assert!(format!("{:#}", err).contains("--break-lease"));
    assert_eq!(h.service.total(), 0);

    h.pipeline().run("Journaling", true).await.unwrap();
    assert_eq!(h.main_rows().await.len(), 1);
    assert_eq!(checkpoint.lease_holder().await.unwrap(), None);
}

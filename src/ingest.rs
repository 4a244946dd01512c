//! Ingestion: source → hash → author filter → dedup → checkpoint.
//!
//! New records are registered in the enrichment checkpoint as pending, which
//! is where the enrichment pass picks them up.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::info;

use crate::checkpoint::Checkpoint;
use crate::config::{Config, TablesConfig};
use crate::db;
use crate::dedup;
use crate::models::Record;
use crate::source::{JsonlSource, RecordSource, StreamLimits};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub fetched: u64,
    pub skipped_authors: u64,
    pub duplicates: u64,
    /// Records that passed dedup.
    pub fresh: u64,
    /// Records newly written to the checkpoint (0 on a dry run).
    pub registered: u64,
}

pub struct Ingest<'a> {
    pub source: &'a dyn RecordSource,
    pub limits: StreamLimits,
    pub skip_authors: &'a [String],
}

impl<'a> Ingest<'a> {
    /// Fetch `collection` and return the records not seen before.
    pub async fn fresh_records(
        &self,
        collection: &str,
        pool: &SqlitePool,
        tables: &TablesConfig,
        stats: &mut IngestStats,
    ) -> Result<Vec<Record>> {
        let raw = self.source.fetch(collection, &self.limits).await?;
        stats.fetched = raw.len() as u64;

        let records: Vec<Record> = raw
            .into_iter()
            .filter(|item| {
                !item
                    .author
                    .as_deref()
                    .is_some_and(|a| self.skip_authors.iter().any(|s| s == a))
            })
            .map(Record::from_raw)
            .collect();
        stats.skipped_authors = stats.fetched - records.len() as u64;

        let known = dedup::known_fingerprints(pool, tables).await?;
        let before = records.len();
        let fresh = dedup::filter(&known, records);
        stats.duplicates = (before - fresh.len()) as u64;
        stats.fresh = fresh.len() as u64;

        Ok(fresh)
    }

    /// Fetch, dedup and register `collection` in the checkpoint.
    pub async fn run(
        &self,
        collection: &str,
        pool: &SqlitePool,
        tables: &TablesConfig,
        dry_run: bool,
    ) -> Result<IngestStats> {
        let mut stats = IngestStats::default();
        let fresh = self.fresh_records(collection, pool, tables, &mut stats).await?;

        if !dry_run {
            let checkpoint = Checkpoint::new(pool.clone(), &tables.checkpoint);
            checkpoint.ensure_table().await?;
            stats.registered = checkpoint.register(&fresh).await?;
        }

        info!(
            source = self.source.name(),
            collection,
            fetched = stats.fetched,
            duplicates = stats.duplicates,
            registered = stats.registered,
            dry_run,
            "ingest complete"
        );
        Ok(stats)
    }
}

/// `insights ingest <collection>`.
pub async fn run_ingest(
    config: &Config,
    collection: &str,
    hot: Option<usize>,
    new: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let source = JsonlSource::from_config(&config.source);
    let defaults = StreamLimits::from_config(&config.source);
    let ingest = Ingest {
        source: &source,
        limits: StreamLimits {
            hot: hot.unwrap_or(defaults.hot),
            new: new.unwrap_or(defaults.new),
        },
        skip_authors: &config.source.skip_authors,
    };

    let stats = ingest.run(collection, &pool, &config.tables, dry_run).await?;

    if dry_run {
        println!("ingest {} (dry-run)", collection);
    } else {
        println!("ingest {}", collection);
    }
    println!("  fetched: {}", stats.fetched);
    println!("  skipped authors: {}", stats.skipped_authors);
    println!("  duplicates: {}", stats.duplicates);
    println!("  new: {}", stats.fresh);
    if !dry_run {
        println!("  registered: {}", stats.registered);
        println!("ok");
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RawRecord, Stream};
    use async_trait::async_trait;

    struct Fixed(Vec<RawRecord>);

    #[async_trait]
    impl RecordSource for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn fetch(&self, _collection: &str, _limits: &StreamLimits) -> Result<Vec<RawRecord>> {
            Ok(self.0.clone())
        }
    }

    fn raw(id: &str, content: &str, author: Option<&str>) -> RawRecord {
        RawRecord {
            id: id.into(),
            content: content.into(),
            author: author.map(str::to_string),
            created_utc: 1_700_000_000,
            score: 1,
            permalink: String::new(),
            subreddit: "journaling".into(),
            parent_id: String::new(),
            is_submitter: false,
            post_title: String::new(),
            post_body: String::new(),
            stream: Stream::New,
        }
    }

    #[tokio::test]
    async fn second_ingest_finds_nothing_new() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("i.sqlite")).await.unwrap();
        let tables = TablesConfig::default();
        let skip = vec!["AutoModerator".to_string()];
        let source = Fixed(vec![
            raw("1", "I journal every night", Some("a")),
            raw("2", "Removed by rule 3", Some("AutoModerator")),
            raw("3", "I journal every night", Some("b")),
            raw("4", "Bullet journals are great", None),
        ]);
        let ingest = Ingest {
            source: &source,
            limits: StreamLimits::default(),
            skip_authors: &skip,
        };

        let first = ingest.run("journaling", &pool, &tables, false).await.unwrap();
        assert_eq!(first.fetched, 4);
        assert_eq!(first.skipped_authors, 1);
        assert_eq!(first.duplicates, 0);
        // Same content under two ids collapses to one checkpoint row
        assert_eq!(first.registered, 2);

        let second = ingest.run("journaling", &pool, &tables, false).await.unwrap();
        assert_eq!(second.duplicates, 3);
        assert_eq!(second.fresh, 0);
        assert_eq!(second.registered, 0);
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("i.sqlite")).await.unwrap();
        let tables = TablesConfig::default();
        let source = Fixed(vec![raw("1", "x", Some("a"))]);
        let ingest = Ingest {
            source: &source,
            limits: StreamLimits::default(),
            skip_authors: &[],
        };

        let stats = ingest.run("journaling", &pool, &tables, true).await.unwrap();
        assert_eq!(stats.fresh, 1);
        assert_eq!(stats.registered, 0);
        assert!(!db::table_exists(&pool, &tables.checkpoint).await.unwrap());
    }
}

//! Content-based deduplication.
//!
//! Freshly fetched records are compared against every fingerprint the
//! pipeline has already seen: everything registered in the enrichment
//! checkpoint plus everything already merged into the durable table.

use anyhow::Result;
use sqlx::SqlitePool;
use std::collections::HashSet;

use crate::config::TablesConfig;
use crate::db;
use crate::models::Record;

/// Keep only the candidates whose fingerprint is not in `known`.
///
/// Order is preserved and `known` is left untouched. Duplicates inside
/// `candidates` itself are not collapsed here; the checkpoint registration
/// absorbs them.
pub fn filter(known: &HashSet<String>, candidates: Vec<Record>) -> Vec<Record> {
    if known.is_empty() {
        return candidates;
    }
    candidates
        .into_iter()
        .filter(|record| !known.contains(&record.fingerprint))
        .collect()
}

/// Load every fingerprint recorded in the checkpoint and durable tables.
pub async fn known_fingerprints(pool: &SqlitePool, tables: &TablesConfig) -> Result<HashSet<String>> {
    let mut known = HashSet::new();

    for table in [&tables.checkpoint, &tables.main] {
        if !db::table_exists(pool, table).await? {
            continue;
        }
        let sql = format!(
            "SELECT comment_hash FROM {}",
            db::quote_ident(table)
        );
        let hashes: Vec<String> = sqlx::query_scalar(&sql).fetch_all(pool).await?;
        known.extend(hashes);
    }

    Ok(known)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RawRecord, Stream};

    fn record(content: &str) -> Record {
        Record::from_raw(RawRecord {
            id: content.to_string(),
            content: content.to_string(),
            author: Some("someone".to_string()),
            created_utc: 0,
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

    #[test]
    fn empty_known_set_is_identity() {
        let candidates = vec![record("a"), record("b")];
        let out = filter(&HashSet::new(), candidates.clone());
        assert_eq!(out, candidates);
    }

    #[test]
    fn drops_known_and_keeps_unknown() {
        let candidates = vec![record("a"), record("b"), record("c")];
        let known: HashSet<String> = [record("b").fingerprint].into_iter().collect();
        let snapshot = known.clone();

        let out = filter(&known, candidates.clone());

        assert_eq!(known, snapshot);
        assert!(out.iter().all(|r| !known.contains(&r.fingerprint)));
        for c in candidates.iter().filter(|c| !known.contains(&c.fingerprint)) {
            assert!(out.contains(c));
        }
        assert_eq!(
            out.iter().map(|r| r.content.as_str()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );
    }

    #[test]
    fn content_match_wins_over_id() {
        let mut same_text = record("a");
        same_text.id = "different-id".to_string();
        let known: HashSet<String> = [record("a").fingerprint].into_iter().collect();
        assert!(filter(&known, vec![same_text]).is_empty());
    }
}

//! # Comment Insights
//!
//! Ingests short comments from exported community threads, deduplicates them
//! by content, annotates each one with a remote text-analysis service, and
//! reconciles the relevant results into a durable SQLite table through a
//! staging/merge step.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌────────────┐   ┌─────────┐   ┌────────┐
//! │  Source  │──▶│  Dedup  │──▶│ Checkpoint │──▶│ Staging │──▶│  Main  │
//! │  JSONL   │   │ sha256  │   │ + Analysis │   │  table  │   │ table  │
//! └──────────┘   └─────────┘   └────────────┘   └─────────┘   └────────┘
//!                                    ▲               ▲
//!                                    └── suggest ────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! insights init                  # create checkpoint + staging tables
//! insights ingest Journaling     # register new comments
//! insights enrich                # annotate pending comments, stage relevant ones
//! insights suggest               # backfill feature suggestions
//! insights merge                 # staging → main
//! insights run Journaling        # all of the above
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`hash`] | Content fingerprints |
//! | [`dedup`] | Fingerprint filtering |
//! | [`source`] | Record sources |
//! | [`ingest`] | Fetch + dedup + checkpoint registration |
//! | [`retry`] | Retry policy and backoff |
//! | [`analysis`] | Analysis service client and response decoding |
//! | [`checkpoint`] | Per-record enrichment progress and lease |
//! | [`enrich`] | Enrichment runner |
//! | [`suggest`] | Feature-suggestion backfill |
//! | [`staging`] | Staging table writes |
//! | [`merge`] | Staging → durable merge |
//! | [`pipeline`] | End-to-end run |
//! | [`db`] | Database connection |
//! | [`migrate`] | Table creation |

pub mod analysis;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod dedup;
pub mod enrich;
pub mod error;
pub mod hash;
pub mod ingest;
pub mod merge;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod schema;
pub mod source;
pub mod staging;
pub mod stats;
pub mod suggest;

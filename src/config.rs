use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub tables: TablesConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub staging: StagingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TablesConfig {
    #[serde(default = "default_checkpoint_table")]
    pub checkpoint: String,
    #[serde(default = "default_staging_table")]
    pub staging: String,
    #[serde(default = "default_main_table")]
    pub main: String,
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            checkpoint: default_checkpoint_table(),
            staging: default_staging_table(),
            main: default_main_table(),
        }
    }
}

fn default_checkpoint_table() -> String {
    "enrichment_checkpoint".to_string()
}
fn default_staging_table() -> String {
    "analyzed_comments_staging".to_string()
}
fn default_main_table() -> String {
    "analyzed_comments".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_source_root")]
    pub root: PathBuf,
    #[serde(default = "default_hot_limit")]
    pub hot_limit: usize,
    #[serde(default = "default_new_limit")]
    pub new_limit: usize,
    #[serde(default = "default_skip_authors")]
    pub skip_authors: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            root: default_source_root(),
            hot_limit: default_hot_limit(),
            new_limit: default_new_limit(),
            skip_authors: default_skip_authors(),
        }
    }
}

fn default_source_root() -> PathBuf {
    PathBuf::from("./exports")
}
fn default_hot_limit() -> usize {
    10
}
fn default_new_limit() -> usize {
    25
}
fn default_skip_authors() -> Vec<String> {
    vec!["AutoModerator".to_string()]
}

/// How a response that is not valid JSON is treated.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    /// Parse failure is a malformed response and is retried.
    Strict,
    /// Parse failure is accepted and the raw text is kept.
    Lenient,
}

/// What to do with a `relevance_score` outside `[0.0, 1.0]`.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScorePolicy {
    PassThrough,
    Clamp,
    Reject,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_parse_mode")]
    pub parse_mode: ParseMode,
    #[serde(default = "default_feature_parse_mode")]
    pub feature_parse_mode: ParseMode,
    #[serde(default = "default_score_policy")]
    pub score_policy: ScorePolicy,
    #[serde(default = "default_product_context")]
    pub product_context: String,
    /// Also retry requests the service rejected (4xx other than 429).
    #[serde(default)]
    pub retry_rejected: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            parse_mode: default_parse_mode(),
            feature_parse_mode: default_feature_parse_mode(),
            score_policy: default_score_policy(),
            product_context: default_product_context(),
            retry_rejected: false,
        }
    }
}

fn default_base_url() -> String {
    "https://api.deepseek.com".to_string()
}
fn default_model() -> String {
    "deepseek-chat".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    2000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_parse_mode() -> ParseMode {
    ParseMode::Strict
}
fn default_feature_parse_mode() -> ParseMode {
    ParseMode::Lenient
}
fn default_score_policy() -> ScorePolicy {
    ScorePolicy::PassThrough
}
fn default_product_context() -> String {
    "an AI journaling app".to_string()
}

impl AnalysisConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            multiplier: self.backoff_multiplier,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f64,
    #[serde(default = "default_fallback_score")]
    pub fallback_score: f64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            relevance_threshold: default_relevance_threshold(),
            fallback_score: default_fallback_score(),
        }
    }
}

fn default_relevance_threshold() -> f64 {
    0.5
}
fn default_fallback_score() -> f64 {
    0.1
}

#[derive(Debug, Deserialize, Clone)]
pub struct StagingConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

fn default_batch_size() -> usize {
    500
}

impl Config {
    /// Config with every section at its default and the database at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            tables: TablesConfig::default(),
            source: SourceConfig::default(),
            analysis: AnalysisConfig::default(),
            enrichment: EnrichmentConfig::default(),
            staging: StagingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate tables
    let tables = &config.tables;
    for (key, name) in [
        ("tables.checkpoint", &tables.checkpoint),
        ("tables.staging", &tables.staging),
        ("tables.main", &tables.main),
    ] {
        if !is_identifier(name) {
            anyhow::bail!(
                "{} must be a plain identifier (letters, digits, underscore), got '{}'",
                key,
                name
            );
        }
    }
    if tables.checkpoint == tables.staging
        || tables.checkpoint == tables.main
        || tables.staging == tables.main
    {
        anyhow::bail!("tables.checkpoint, tables.staging and tables.main must be distinct");
    }

    // Validate analysis
    if config.analysis.max_attempts < 1 {
        anyhow::bail!("analysis.max_attempts must be >= 1");
    }
    if !config.analysis.backoff_multiplier.is_finite() || config.analysis.backoff_multiplier < 1.0
    {
        anyhow::bail!("analysis.backoff_multiplier must be >= 1.0");
    }
    if config.analysis.model.trim().is_empty() {
        anyhow::bail!("analysis.model must not be empty");
    }

    // Validate enrichment
    if !config.enrichment.relevance_threshold.is_finite() {
        anyhow::bail!("enrichment.relevance_threshold must be a finite number");
    }
    if !config.enrichment.fallback_score.is_finite() {
        anyhow::bail!("enrichment.fallback_score must be a finite number");
    }

    // Validate staging
    if config.staging.batch_size == 0 {
        anyhow::bail!("staging.batch_size must be > 0");
    }

    Ok(())
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

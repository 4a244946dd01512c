//! Remote text analysis with retry and tolerant response parsing.
//!
//! The pipeline talks to an LLM through the [`AnalysisService`] trait, which
//! turns a prompt into free text. [`AnalysisClient`] sits on top of it and
//! owns everything the remote side does not guarantee:
//!
//! - **Retry**: transport and service errors are retried under a
//!   [`RetryPolicy`]. Rejected requests (4xx other than 429) fail on the
//!   first attempt unless `analysis.retry_rejected` is set.
//! - **Fences**: a single leading ```` ```json ```` (or bare ```` ``` ````)
//!   and a single trailing ```` ``` ```` are stripped before parsing.
//! - **Parse mode**: [`ParseMode::Strict`] treats unparseable output as a
//!   retryable malformed response; [`ParseMode::Lenient`] keeps the text
//!   verbatim instead.
//! - **Score policy**: `relevance_score` is coerced to `f64` and then passed
//!   through, clamped, or rejected according to [`ScorePolicy`].
//!
//! After the attempt budget is spent the client returns an
//! [`AnalysisFailure`]; choosing fallback values is the caller's job.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::{AnalysisConfig, ParseMode, ScorePolicy};
use crate::error::{AnalysisError, AnalysisFailure};
use crate::models::{Annotation, CompletionFlag};
use crate::retry::{call_with_retry, RetryPolicy};

/// Score given to an annotation whose response could only be kept as text.
pub const DEGENERATE_SCORE: f64 = 0.1;

/// A remote capability that answers a prompt with free text.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    /// Returns the model identifier used for logging.
    fn model_name(&self) -> &str;

    /// Send `prompt` and return the raw response text.
    async fn complete(&self, prompt: &str) -> Result<String, AnalysisError>;
}

// ============ Chat completions service ============

/// [`AnalysisService`] backed by an OpenAI-compatible `/chat/completions`
/// endpoint (OpenAI, DeepSeek, a local gateway).
pub struct ChatCompletionsService {
    http: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    api_key: String,
}

impl ChatCompletionsService {
    /// Build the service from config, reading the API key from the
    /// environment variable named by `api_key_env`.
    pub fn from_config(config: &AnalysisConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            anyhow::anyhow!("{} environment variable not set", config.api_key_env)
        })?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            api_key,
        })
    }
}

#[async_trait]
impl AnalysisService for ChatCompletionsService {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String, AnalysisError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": self.temperature,
        });

        debug!(model = %self.model, "chat completion request");

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AnalysisError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            // Rate limited or server error: retryable
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(AnalysisError::Transport(format!(
                    "API error {}: {}",
                    status, body_text
                )));
            }
            return Err(AnalysisError::Rejected {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| AnalysisError::Transport(e.to_string()))?;

        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                AnalysisError::Transport("response has no choices[0].message.content".to_string())
            })
    }
}

// ============ Parsing ============

/// A decoded response: structured JSON, or raw text accepted in lenient mode.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisPayload {
    Json(Value),
    Raw(String),
}

/// Strip one leading ```` ```json ```` / ```` ``` ```` and one trailing
/// ```` ``` ````, trimming whitespace around and inside.
pub fn strip_fence(text: &str) -> &str {
    let mut cleaned = text.trim();
    if let Some(rest) = cleaned.strip_prefix("```json") {
        cleaned = rest;
    } else if let Some(rest) = cleaned.strip_prefix("```") {
        cleaned = rest;
    }
    if let Some(rest) = cleaned.strip_suffix("```") {
        cleaned = rest;
    }
    cleaned.trim()
}

/// Parse a response into a payload according to `mode`.
pub fn parse_payload(text: &str, mode: ParseMode) -> Result<AnalysisPayload, AnalysisError> {
    let cleaned = strip_fence(text);
    match serde_json::from_str::<Value>(cleaned) {
        Ok(value) => Ok(AnalysisPayload::Json(value)),
        Err(e) => match mode {
            ParseMode::Lenient => Ok(AnalysisPayload::Raw(cleaned.to_string())),
            ParseMode::Strict => Err(AnalysisError::malformed(e.to_string(), cleaned)),
        },
    }
}

/// Build an annotation from a parsed JSON object.
///
/// Missing list fields become empty lists; a bare string becomes a one-item
/// list. `relevance_score` is required and may be a number or a numeric
/// string.
pub fn annotation_from_json(value: &Value, policy: ScorePolicy) -> Result<Annotation, AnalysisError> {
    let obj = value
        .as_object()
        .ok_or_else(|| AnalysisError::malformed("expected a JSON object", value.to_string()))?;

    let raw_score = obj
        .get("relevance_score")
        .ok_or_else(|| AnalysisError::malformed("missing relevance_score", value.to_string()))?;
    let score = coerce_score(raw_score)
        .ok_or_else(|| AnalysisError::malformed("relevance_score is not a number", value.to_string()))?;
    let relevance_score = apply_score_policy(score, policy).ok_or_else(|| {
        AnalysisError::malformed(
            format!("relevance_score {} outside [0.0, 1.0]", score),
            value.to_string(),
        )
    })?;

    Ok(Annotation {
        pain_points: string_list(obj.get("pain_points")),
        gain_points: string_list(obj.get("gain_points")),
        jobs_to_be_done: string_list(obj.get("jobs_to_be_done")),
        themes: string_list(obj.get("themes")),
        relevance_score,
        completion_flag: CompletionFlag::Done,
        raw_text: None,
    })
}

/// Decode a full annotation response, degrading to raw text in lenient mode.
pub fn decode_annotation(
    text: &str,
    mode: ParseMode,
    policy: ScorePolicy,
) -> Result<Annotation, AnalysisError> {
    let cleaned = strip_fence(text);
    let parsed = serde_json::from_str::<Value>(cleaned)
        .map_err(|e| AnalysisError::malformed(e.to_string(), cleaned))
        .and_then(|value| annotation_from_json(&value, policy));

    match (parsed, mode) {
        (Ok(annotation), _) => Ok(annotation),
        (Err(_), ParseMode::Lenient) => {
            Ok(Annotation::degenerate(cleaned.to_string(), DEGENERATE_SCORE))
        }
        (Err(e), ParseMode::Strict) => Err(e),
    }
}

fn coerce_score(value: &Value) -> Option<f64> {
    let score = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    score.is_finite().then_some(score)
}

fn apply_score_policy(score: f64, policy: ScorePolicy) -> Option<f64> {
    match policy {
        ScorePolicy::PassThrough => Some(score),
        ScorePolicy::Clamp => Some(score.clamp(0.0, 1.0)),
        ScorePolicy::Reject => (0.0..=1.0).contains(&score).then_some(score),
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(s)) if s.trim().is_empty() => Vec::new(),
        Some(Value::String(s)) => vec![s.clone()],
        Some(other) => vec![other.to_string()],
    }
}

// ============ Prompt ============

/// The fixed annotation prompt for one comment.
pub fn annotation_prompt(product_context: &str, content: &str) -> String {
    format!(
        r#"Analyze the following Reddit comment and identify:
1. Pain points mentioned
2. Gain points (benefits or positive aspects)
3. Jobs to be done (what the user is trying to accomplish)
4. Key themes/tags for affinity mapping
5. Relevance score (0.1-1.0) for building {product}, where:
   - 1.0: highly relevant insights about habits, needs and pain points
   - 0.5: moderately useful general discussion
   - 0.1: not relevant for {product}

Content: {content}

Format your response as JSON with these keys:
- pain_points: list of pain points
- gain_points: list of gain points
- jobs_to_be_done: list of jobs
- themes: list of key themes/tags
- relevance_score: float between 0.1 and 1.0"#,
        product = product_context,
        content = content,
    )
}

// ============ Client ============

/// Analysis client: prompt building, retry, and response decoding.
#[derive(Clone)]
pub struct AnalysisClient {
    service: Arc<dyn AnalysisService>,
    policy: RetryPolicy,
    parse_mode: ParseMode,
    score_policy: ScorePolicy,
    product_context: String,
    retry_rejected: bool,
}

impl AnalysisClient {
    pub fn new(service: Arc<dyn AnalysisService>, config: &AnalysisConfig) -> Self {
        Self {
            service,
            policy: config.retry_policy(),
            parse_mode: config.parse_mode,
            score_policy: config.score_policy,
            product_context: config.product_context.clone(),
            retry_rejected: config.retry_rejected,
        }
    }

    pub fn with_parse_mode(mut self, mode: ParseMode) -> Self {
        self.parse_mode = mode;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_retry_rejected(mut self, retry_rejected: bool) -> Self {
        self.retry_rejected = retry_rejected;
        self
    }

    pub fn parse_mode(&self) -> ParseMode {
        self.parse_mode
    }

    pub fn product_context(&self) -> &str {
        &self.product_context
    }

    /// Annotate one comment.
    pub async fn analyze(&self, content: &str) -> Result<Annotation, AnalysisFailure> {
        let prompt = annotation_prompt(&self.product_context, content);
        let mode = self.parse_mode;
        let policy = self.score_policy;
        self.call(&prompt, |text| decode_annotation(text, mode, policy))
            .await
    }

    /// Send an arbitrary prompt and decode the answer per the parse mode.
    pub async fn complete_text(&self, prompt: &str) -> Result<AnalysisPayload, AnalysisFailure> {
        let mode = self.parse_mode;
        self.call(prompt, |text| parse_payload(text, mode)).await
    }

    async fn call<T, D>(&self, prompt: &str, decode: D) -> Result<T, AnalysisFailure>
    where
        D: Fn(&str) -> Result<T, AnalysisError>,
    {
        let service = self.service.as_ref();
        let decode = &decode;
        let retry_rejected = self.retry_rejected;
        let is_retryable = move |e: &AnalysisError| retry_rejected || e.is_retryable();

        call_with_retry(&self.policy, is_retryable, |attempt| async move {
            let text = service.complete(prompt).await?;
            debug!(
                model = service.model_name(),
                attempt,
                bytes = text.len(),
                "analysis response received"
            );
            decode(&text)
        })
        .await
        .map_err(|exhausted| AnalysisFailure {
            attempts: exhausted.attempts,
            last_error: exhausted.last_error,
        })
    }
}

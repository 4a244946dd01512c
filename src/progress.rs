//! Pipeline progress reporting.
//!
//! Reports per-phase and per-record progress during `insights enrich`,
//! `insights suggest` and `insights run` so an operator can see how far a
//! long enrichment pass has got and which records fell back.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineProgressEvent {
    /// A phase is starting with `items` units of work.
    Phase { phase: &'static str, items: u64 },
    /// Record n of total has been analyzed (or fell back) and checkpointed.
    Enriching {
        n: u64,
        total: u64,
        score: f64,
        fallback: bool,
    },
    /// Feature suggestion n of total has been backfilled.
    Suggesting { n: u64, total: u64, failed: bool },
}

/// Reports pipeline progress. Implementations write to stderr (human or JSON).
pub trait PipelineProgressReporter: Send + Sync {
    fn report(&self, event: PipelineProgressEvent);
}

/// Human-friendly progress on stderr: "enrich  12 / 40 records  score 0.80".
pub struct StderrProgress;

impl PipelineProgressReporter for StderrProgress {
    fn report(&self, event: PipelineProgressEvent) {
        let line = match &event {
            PipelineProgressEvent::Phase { phase, items } => {
                format!("{}  {} items\n", phase, format_number(*items))
            }
            PipelineProgressEvent::Enriching {
                n,
                total,
                score,
                fallback,
            } => {
                let suffix = if *fallback { "  (fallback)" } else { "" };
                format!(
                    "enrich  {} / {} records  score {:.2}{}\n",
                    format_number(*n),
                    format_number(*total),
                    score,
                    suffix
                )
            }
            PipelineProgressEvent::Suggesting { n, total, failed } => {
                let suffix = if *failed { "  (failed)" } else { "" };
                format!(
                    "suggest  {} / {} records{}\n",
                    format_number(*n),
                    format_number(*total),
                    suffix
                )
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl PipelineProgressReporter for JsonProgress {
    fn report(&self, event: PipelineProgressEvent) {
        let obj = match &event {
            PipelineProgressEvent::Phase { phase, items } => serde_json::json!({
                "event": "phase",
                "phase": phase,
                "items": items
            }),
            PipelineProgressEvent::Enriching {
                n,
                total,
                score,
                fallback,
            } => serde_json::json!({
                "event": "progress",
                "phase": "enriching",
                "n": n,
                "total": total,
                "score": score,
                "fallback": fallback
            }),
            PipelineProgressEvent::Suggesting { n, total, failed } => serde_json::json!({
                "event": "progress",
                "phase": "suggesting",
                "n": n,
                "total": total,
                "failed": failed
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl PipelineProgressReporter for NoProgress {
    fn report(&self, _event: PipelineProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn PipelineProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}

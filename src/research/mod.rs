//! Deep-research iteration engine.
//!
//! One research run per conversation drives a bounded loop:
//!
//! ```text
//! plan(initial) → execute level → hypothesis → (reflection ∥ discovery?)
//!      → plan(next) → continue/stop decision → reply
//!      → [continue] promote suggestions, chain a new message, loop
//! ```
//!
//! - [`planner`]: leveled task batches and suggestion promotion
//! - [`executor`]: concurrent level execution with per-task failure isolation
//! - [`evaluation`]: hypothesis, reflection and discovery steps
//! - [`decision`]: continue-vs-stop policy
//! - [`iteration`]: the loop itself ([`ResearchEngine`])
//! - [`run_guard`]: one active run per conversation
//! - [`execution`]: inline and queued execution strategies
//! - [`service`]: the surface used by the MCP server ([`ResearchService`])

pub mod agents;
pub mod backends;
pub mod decision;
pub mod evaluation;
pub mod execution;
pub mod executor;
pub mod iteration;
pub mod pipes;
pub mod planner;
pub mod run_guard;
pub mod service;
pub mod state;

pub use agents::*;
pub use backends::{
    AnalysisBackend, BackendOutput, BackendRegistry, LiteratureBackend, PipeAnalysisBackend,
    PipeLiteratureBackend,
};
pub use execution::{InlineExecutor, IterationJobProcessor, Launch, QueuedExecutor, RunExecutor};
pub use iteration::{IterationContext, IterationOutcome, ResearchEngine};
pub use pipes::PipeAgents;
pub use run_guard::{RunGuard, StartLock};
pub use service::{MessageStatus, ResearchService, StartOutcome};
pub use state::StateHandle;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Auto-iteration cap for semi-autonomous runs when not configured.
pub const DEFAULT_SEMI_AUTONOMOUS_ITERATIONS: u32 = 5;

/// Hard ceiling on iterations a single user turn can trigger.
pub const FULLY_AUTONOMOUS_MAX_ITERATIONS: u32 = 20;

/// Steering runs always hand control back after one iteration.
pub const STEERING_MAX_ITERATIONS: u32 = 1;

/// Queue job name for one research iteration.
pub const ITERATION_JOB: &str = "research-iteration";

/// How many iterations may run before control returns to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResearchMode {
    /// One iteration per user message.
    Steering,
    /// A configurable number of automatic iterations.
    SemiAutonomous,
    /// Up to the hard ceiling of automatic iterations.
    FullyAutonomous,
}

impl ResearchMode {
    /// Get the mode name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            ResearchMode::Steering => "steering",
            ResearchMode::SemiAutonomous => "semi-autonomous",
            ResearchMode::FullyAutonomous => "fully-autonomous",
        }
    }
}

impl std::fmt::Display for ResearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ResearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "steering" => Ok(ResearchMode::Steering),
            "semi-autonomous" => Ok(ResearchMode::SemiAutonomous),
            "fully-autonomous" => Ok(ResearchMode::FullyAutonomous),
            _ => Err(format!("Unknown research mode: {}", s)),
        }
    }
}

/// Maximum number of iterations a run may execute in the given mode.
///
/// `semi_autonomous_cap` is the configured semi-autonomous limit; it is kept
/// within `1..=FULLY_AUTONOMOUS_MAX_ITERATIONS`.
pub fn max_auto_iterations(mode: ResearchMode, semi_autonomous_cap: u32) -> u32 {
    match mode {
        ResearchMode::Steering => STEERING_MAX_ITERATIONS,
        ResearchMode::FullyAutonomous => FULLY_AUTONOMOUS_MAX_ITERATIONS,
        ResearchMode::SemiAutonomous => {
            semi_autonomous_cap.clamp(1, FULLY_AUTONOMOUS_MAX_ITERATIONS)
        }
    }
}

/// Where research runs execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Supervised background task inside the serving process.
    Inline,
    /// One durable queue job per iteration, processed by workers.
    Queue,
}

impl ExecutionMode {
    /// Get the mode name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Inline => "inline",
            ExecutionMode::Queue => "queue",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inline" => Ok(ExecutionMode::Inline),
            "queue" => Ok(ExecutionMode::Queue),
            _ => Err(format!("Unknown execution mode: {}", s)),
        }
    }
}

/// Literature backends a LITERATURE task fans out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiteratureSource {
    /// Open-access scholarly search.
    OpenScholar,
    /// Deep literature agent.
    Edison,
    /// Curated knowledge base.
    Knowledge,
}

impl LiteratureSource {
    /// Get the source name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            LiteratureSource::OpenScholar => "openscholar",
            LiteratureSource::Edison => "edison",
            LiteratureSource::Knowledge => "knowledge",
        }
    }

    /// Pipe used for this source when none is configured.
    pub fn default_pipe(&self) -> String {
        format!("literature-{}-v1", self.as_str())
    }
}

impl std::fmt::Display for LiteratureSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LiteratureSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openscholar" => Ok(LiteratureSource::OpenScholar),
            "edison" => Ok(LiteratureSource::Edison),
            "knowledge" => Ok(LiteratureSource::Knowledge),
            _ => Err(format!("Unknown literature source: {}", s)),
        }
    }
}

/// JSON form of a value for the invocation log.
///
/// Logging must never fail a call, so unserializable values become a marker
/// string.
pub(crate) fn log_value<T: Serialize>(value: &T, context: &str) -> serde_json::Value {
    match serde_json::to_value(value) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, context = %context, "Value not loggable as JSON");
            serde_json::Value::String(format!("<unserializable {}: {}>", context, e))
        }
    }
}

/// Locate the JSON payload in a model completion.
///
/// Accepts, in order: a completion that is itself JSON, the body of the first
/// fenced block (any language tag), or the first balanced `{...}` embedded in
/// prose.
pub(crate) fn extract_json_from_completion(completion: &str) -> Result<&str, String> {
    let trimmed = completion.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed);
    }

    if let Some((_, after_fence)) = trimmed.split_once("```") {
        let body = match after_fence.split_once('\n') {
            Some((tag, rest)) if is_fence_tag(tag) => rest,
            _ => after_fence,
        };
        let body = body.split("```").next().unwrap_or_default().trim();
        if body.is_empty() {
            return Err("fenced block in completion is empty".to_string());
        }
        return Ok(body);
    }

    embedded_object(trimmed).ok_or_else(|| {
        format!(
            "no JSON in completion: '{}'",
            trimmed.chars().take(100).collect::<String>()
        )
    })
}

fn is_fence_tag(line: &str) -> bool {
    line.trim()
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// First brace-balanced object, ignoring braces inside string literals.
fn embedded_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

//! Literature and analysis backends.
//!
//! [`BackendRegistry`] is built once at startup from configuration: one
//! [`LiteratureBackend`] per enabled [`LiteratureSource`] and a single
//! [`AnalysisBackend`].

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{extract_json_from_completion, log_value, LiteratureSource};
use crate::config::PipeConfig;
use crate::error::AppResult;
use crate::langbase::{LangbaseClient, Message, PipeRequest};
use crate::prompts::{ANALYSIS_PROMPT, LITERATURE_PROMPT};
use crate::storage::{Artifact, Dataset, Invocation, Storage};

/// Result of one backend call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendOutput {
    pub output: String,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

impl BackendOutput {
    /// Parse a completion as structured output, falling back to plain text.
    pub fn from_completion(completion: &str) -> Self {
        extract_json_from_completion(completion)
            .ok()
            .and_then(|json| serde_json::from_str::<BackendOutput>(json).ok())
            .unwrap_or_else(|| Self {
                output: completion.trim().to_string(),
                job_id: None,
                artifacts: Vec::new(),
            })
    }
}

/// A literature search backend.
#[async_trait]
pub trait LiteratureBackend: Send + Sync {
    /// Which source this backend serves.
    fn source(&self) -> LiteratureSource;
    /// Search the literature for an objective.
    async fn search(&self, objective: &str) -> AppResult<BackendOutput>;
}

/// A data analysis backend.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Analyze the datasets against an objective.
    async fn analyze(&self, objective: &str, datasets: &[Dataset]) -> AppResult<BackendOutput>;
}

/// Backends resolved at startup.
#[derive(Clone)]
pub struct BackendRegistry {
    literature: Vec<Arc<dyn LiteratureBackend>>,
    analysis: Arc<dyn AnalysisBackend>,
}

impl BackendRegistry {
    /// Create a registry. Later backends for an already registered source are ignored.
    pub fn new(
        literature: Vec<Arc<dyn LiteratureBackend>>,
        analysis: Arc<dyn AnalysisBackend>,
    ) -> Self {
        let mut unique: Vec<Arc<dyn LiteratureBackend>> = Vec::with_capacity(literature.len());
        for backend in literature {
            if !unique.iter().any(|b| b.source() == backend.source()) {
                unique.push(backend);
            }
        }
        Self {
            literature: unique,
            analysis,
        }
    }

    /// Build pipe-backed backends for every configured source.
    pub fn from_pipes(
        pipes: &PipeConfig,
        langbase: LangbaseClient,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let literature = pipes
            .literature
            .iter()
            .map(|p| {
                Arc::new(PipeLiteratureBackend::new(
                    p.source,
                    langbase.clone(),
                    storage.clone(),
                    p.pipe.clone(),
                )) as Arc<dyn LiteratureBackend>
            })
            .collect();
        let analysis = Arc::new(PipeAnalysisBackend::new(
            langbase,
            storage,
            pipes.analysis.clone(),
        ));
        Self::new(literature, analysis)
    }

    /// Every literature backend, in configuration order.
    pub fn literature(&self) -> &[Arc<dyn LiteratureBackend>] {
        &self.literature
    }

    /// Look up the backend for a source.
    pub fn literature_for(&self, source: LiteratureSource) -> Option<&Arc<dyn LiteratureBackend>> {
        self.literature.iter().find(|b| b.source() == source)
    }

    /// The analysis backend.
    pub fn analysis(&self) -> &Arc<dyn AnalysisBackend> {
        &self.analysis
    }
}

/// Call a backend pipe and log the invocation.
async fn run_backend_pipe(
    langbase: &LangbaseClient,
    storage: &dyn Storage,
    tool: &str,
    pipe: &str,
    prompt: &str,
    input: serde_json::Value,
) -> AppResult<BackendOutput> {
    let start = Instant::now();
    let mut invocation = Invocation::new(tool, input.clone()).with_pipe(pipe);

    let messages = vec![Message::system(prompt), Message::user(input.to_string())];
    let response = match langbase.call_pipe(PipeRequest::new(pipe, messages)).await {
        Ok(resp) => resp,
        Err(e) => {
            let latency = start.elapsed().as_millis() as i64;
            invocation = invocation.failure(e.to_string(), latency);
            storage.log_invocation(&invocation).await?;
            return Err(e.into());
        }
    };

    let output = BackendOutput::from_completion(&response.completion);
    let latency = start.elapsed().as_millis() as i64;
    invocation = invocation.success(log_value(&output, tool), latency);
    storage.log_invocation(&invocation).await?;

    debug!(tool = %tool, pipe = %pipe, latency_ms = latency, "Backend call completed");
    Ok(output)
}

/// Literature backend served by a Langbase pipe.
pub struct PipeLiteratureBackend {
    source: LiteratureSource,
    langbase: LangbaseClient,
    storage: Arc<dyn Storage>,
    pipe_name: String,
}

impl PipeLiteratureBackend {
    /// Create a backend for `source` backed by `pipe_name`.
    pub fn new(
        source: LiteratureSource,
        langbase: LangbaseClient,
        storage: Arc<dyn Storage>,
        pipe_name: impl Into<String>,
    ) -> Self {
        Self {
            source,
            langbase,
            storage,
            pipe_name: pipe_name.into(),
        }
    }
}

#[async_trait]
impl LiteratureBackend for PipeLiteratureBackend {
    fn source(&self) -> LiteratureSource {
        self.source
    }

    async fn search(&self, objective: &str) -> AppResult<BackendOutput> {
        run_backend_pipe(
            &self.langbase,
            self.storage.as_ref(),
            &format!("literature.{}", self.source),
            &self.pipe_name,
            LITERATURE_PROMPT,
            serde_json::json!({ "source": self.source, "objective": objective }),
        )
        .await
    }
}

/// Analysis backend served by a Langbase pipe.
pub struct PipeAnalysisBackend {
    langbase: LangbaseClient,
    storage: Arc<dyn Storage>,
    pipe_name: String,
}

impl PipeAnalysisBackend {
    /// Create an analysis backend backed by `pipe_name`.
    pub fn new(
        langbase: LangbaseClient,
        storage: Arc<dyn Storage>,
        pipe_name: impl Into<String>,
    ) -> Self {
        Self {
            langbase,
            storage,
            pipe_name: pipe_name.into(),
        }
    }
}

#[async_trait]
impl AnalysisBackend for PipeAnalysisBackend {
    async fn analyze(&self, objective: &str, datasets: &[Dataset]) -> AppResult<BackendOutput> {
        run_backend_pipe(
            &self.langbase,
            self.storage.as_ref(),
            "analysis",
            &self.pipe_name,
            ANALYSIS_PROMPT,
            serde_json::json!({ "objective": objective, "datasets": datasets }),
        )
        .await
    }
}

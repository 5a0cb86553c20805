use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::agents::*;
use super::{extract_json_from_completion, log_value};
use crate::config::PipeConfig;
use crate::error::{AppResult, LangbaseResult, ResearchError};
use crate::langbase::{LangbaseClient, Message, PipeRequest};
use crate::prompts::{
    ANALYSIS_PROMPT, CONTINUATION_PROMPT, DISCOVERY_PROMPT, HYPOTHESIS_PROMPT, LITERATURE_PROMPT,
    PLANNER_PROMPT, REFLECTION_PROMPT, REPLY_PROMPT,
};
use crate::storage::{Invocation, Storage};

/// [`ResearchAgents`] backed by Langbase pipes.
///
/// Each call sends the agent's system prompt plus the JSON-encoded request,
/// extracts JSON from the completion, validates it, and logs an invocation row.
#[derive(Clone)]
pub struct PipeAgents {
    langbase: LangbaseClient,
    storage: Arc<dyn Storage>,
    pipes: PipeConfig,
}

impl PipeAgents {
    /// Create agents using the configured pipe names.
    pub fn new(langbase: LangbaseClient, storage: Arc<dyn Storage>, pipes: PipeConfig) -> Self {
        Self {
            langbase,
            storage,
            pipes,
        }
    }

    async fn invoke<Req, Out>(
        &self,
        agent: &str,
        pipe: &str,
        prompt: &str,
        session_id: &str,
        request: &Req,
        variables: &[(&str, &str)],
    ) -> AppResult<Out>
    where
        Req: Serialize,
        Out: AgentOutput + Serialize,
    {
        let start = Instant::now();
        let input = log_value(request, agent);

        let mut invocation = Invocation::new(format!("agent.{}", agent), input.clone())
            .with_session(session_id)
            .with_pipe(pipe);

        let messages = vec![Message::system(prompt), Message::user(input.to_string())];
        let mut pipe_request = PipeRequest::new(pipe, messages);
        for (key, value) in variables {
            pipe_request = pipe_request.with_variable(*key, *value);
        }

        debug!(agent = %agent, pipe = %pipe, session_id = %session_id, "Calling agent pipe");

        let response = match self.langbase.call_pipe(pipe_request).await {
            Ok(resp) => resp,
            Err(e) => {
                let latency = start.elapsed().as_millis() as i64;
                invocation = invocation.failure(e.to_string(), latency);
                self.storage.log_invocation(&invocation).await?;
                return Err(e.into());
            }
        };

        let parsed = parse_agent_response::<Out>(agent, &response.completion);
        let latency = start.elapsed().as_millis() as i64;

        match parsed {
            Ok(output) => {
                invocation = invocation.success(log_value(&output, agent), latency);
                self.storage.log_invocation(&invocation).await?;
                info!(
                    agent = %agent,
                    latency_ms = latency,
                    total_tokens = ?response.total_tokens(),
                    "Agent call completed"
                );
                Ok(output)
            }
            Err(e) => {
                warn!(
                    agent = %agent,
                    error = %e,
                    completion_preview = %response.completion.chars().take(200).collect::<String>(),
                    "Agent response violated its contract"
                );
                invocation = invocation.failure(e.to_string(), latency);
                self.storage.log_invocation(&invocation).await?;
                Err(e.into())
            }
        }
    }
}

/// Extract, deserialize and validate a structured agent response.
fn parse_agent_response<Out: AgentOutput>(
    agent: &str,
    completion: &str,
) -> Result<Out, ResearchError> {
    let json = extract_json_from_completion(completion)
        .map_err(|e| ResearchError::contract(agent, e))?;
    let output: Out = serde_json::from_str(json)
        .map_err(|e| ResearchError::contract(agent, format!("invalid JSON shape: {}", e)))?;
    output
        .validate()
        .map_err(|reason| ResearchError::contract(agent, reason))?;
    Ok(output)
}

#[async_trait]
impl ResearchAgents for PipeAgents {
    async fn plan(&self, request: PlanRequest) -> AppResult<PlanOutput> {
        let mode = request.mode.as_str();
        self.invoke(
            "planner",
            &self.pipes.planner,
            PLANNER_PROMPT,
            &request.conversation_state_id,
            &request,
            &[("mode", mode)],
        )
        .await
    }

    async fn hypothesize(&self, request: HypothesisRequest) -> AppResult<HypothesisOutput> {
        self.invoke(
            "hypothesis",
            &self.pipes.hypothesis,
            HYPOTHESIS_PROMPT,
            &request.conversation_state_id,
            &request,
            &[],
        )
        .await
    }

    async fn reflect(&self, request: ReflectionRequest) -> AppResult<ReflectionOutput> {
        self.invoke(
            "reflection",
            &self.pipes.reflection,
            REFLECTION_PROMPT,
            &request.conversation_state_id,
            &request,
            &[],
        )
        .await
    }

    async fn discover(&self, request: DiscoveryRequest) -> AppResult<DiscoveryOutput> {
        self.invoke(
            "discovery",
            &self.pipes.discovery,
            DISCOVERY_PROMPT,
            &request.conversation_state_id,
            &request,
            &[],
        )
        .await
    }

    async fn decide_continuation(
        &self,
        request: ContinuationRequest,
    ) -> AppResult<ContinuationDecision> {
        self.invoke(
            "continuation",
            &self.pipes.continuation,
            CONTINUATION_PROMPT,
            &request.conversation_state_id,
            &request,
            &[("research_mode", request.research_mode.as_str())],
        )
        .await
    }

    async fn reply(&self, request: ReplyRequest) -> AppResult<ReplyOutput> {
        let is_final = if request.is_final { "true" } else { "false" };
        self.invoke(
            "reply",
            &self.pipes.reply,
            REPLY_PROMPT,
            &request.conversation_state_id,
            &request,
            &[("is_final", is_final)],
        )
        .await
    }
}

/// Every configured pipe with its description and system prompt.
pub fn pipe_definitions(pipes: &PipeConfig) -> Vec<(String, String, &'static str)> {
    let mut definitions = vec![
        (pipes.planner.clone(), "Research planner".to_string(), PLANNER_PROMPT),
        (pipes.hypothesis.clone(), "Research hypothesis".to_string(), HYPOTHESIS_PROMPT),
        (pipes.reflection.clone(), "Research reflection".to_string(), REFLECTION_PROMPT),
        (pipes.discovery.clone(), "Research discovery".to_string(), DISCOVERY_PROMPT),
        (
            pipes.continuation.clone(),
            "Research continuation decision".to_string(),
            CONTINUATION_PROMPT,
        ),
        (pipes.reply.clone(), "Research reply".to_string(), REPLY_PROMPT),
        (pipes.analysis.clone(), "Data analysis backend".to_string(), ANALYSIS_PROMPT),
    ];
    for lit in &pipes.literature {
        definitions.push((
            lit.pipe.clone(),
            format!("Literature search ({})", lit.source),
            LITERATURE_PROMPT,
        ));
    }
    definitions
}

/// Upsert every configured pipe so calls find them.
pub async fn provision_pipes(langbase: &LangbaseClient, pipes: &PipeConfig) -> LangbaseResult<()> {
    for (name, description, prompt) in pipe_definitions(pipes) {
        langbase.ensure_pipe(&name, &description, prompt).await?;
    }
    info!("Research pipes provisioned");
    Ok(())
}

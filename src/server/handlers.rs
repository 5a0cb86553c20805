use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::SharedState;
use crate::error::{McpError, McpResult};
use crate::research::ResearchMode;

/// Route tool calls to appropriate handlers
pub async fn handle_tool_call(
    state: &SharedState,
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<Value> {
    info!(tool = %tool_name, "Routing tool call");

    match tool_name {
        "research_start" => handle_start(state, arguments).await,
        "research_status" => handle_status(state, arguments).await,
        "research_retry" => handle_retry(state, arguments).await,
        "research_state" => handle_state(state, arguments).await,
        _ => Err(McpError::UnknownTool {
            tool_name: tool_name.to_string(),
        }),
    }
}

/// Parameters for `research_start`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StartParams {
    /// Conversation the message belongs to.
    pub conversation_id: String,
    /// The user's question.
    pub message: String,
    /// Overrides the conversation's research mode from now on.
    #[serde(default)]
    pub research_mode: Option<ResearchMode>,
}

/// Parameters for `research_status`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatusParams {
    pub message_id: String,
}

/// Parameters for `research_retry`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryParams {
    pub job_id: String,
}

/// Parameters for `research_state`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateParams {
    pub conversation_id: String,
}

async fn handle_start(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler("research_start", arguments, |params: StartParams| async move {
        state
            .research
            .start_run(
                &params.conversation_id,
                &params.message,
                params.research_mode,
            )
            .await
    })
    .await
}

async fn handle_status(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    let params: StatusParams = parse_arguments("research_status", arguments)?;

    let status = state
        .research
        .get_status(&params.message_id)
        .await
        .map_err(|e| McpError::ExecutionFailed {
            message: e.to_string(),
        })?;

    let mut value = serde_json::to_value(status).map_err(McpError::Json)?;
    if let Value::Object(map) = &mut value {
        map.insert("message_id".to_string(), Value::String(params.message_id));
    }
    Ok(value)
}

async fn handle_retry(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler("research_retry", arguments, |params: RetryParams| async move {
        state.research.retry(&params.job_id).await
    })
    .await
}

async fn handle_state(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler("research_state", arguments, |params: StateParams| async move {
        state
            .research
            .get_conversation_state(&params.conversation_id)
            .await
    })
    .await
}

fn parse_arguments<T: serde::de::DeserializeOwned>(
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<T> {
    match arguments {
        Some(args) => serde_json::from_value(args).map_err(|e| McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: e.to_string(),
        }),
        None => Err(McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: "Missing arguments".to_string(),
        }),
    }
}

/// Parse arguments, run the operation and serialize its result.
async fn execute_handler<P, R, E, F, Fut>(
    tool_name: &str,
    arguments: Option<Value>,
    operation: F,
) -> McpResult<Value>
where
    P: serde::de::DeserializeOwned,
    R: Serialize,
    E: std::fmt::Display,
    F: FnOnce(P) -> Fut,
    Fut: std::future::Future<Output = Result<R, E>>,
{
    let params: P = parse_arguments(tool_name, arguments)?;

    let result = operation(params)
        .await
        .map_err(|e| McpError::ExecutionFailed {
            message: e.to_string(),
        })?;

    serde_json::to_value(result).map_err(McpError::Json)
}

//! MCP over newline-delimited JSON-RPC 2.0.
//!
//! One request per line on stdin, one response per line on stdout.
//! Notifications (requests without an id) never get a response. Tool
//! failures are reported inside a successful `tools/call` result with
//! `isError: true`, so clients can show them to the model.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use super::{handle_tool_call, SharedState};

#[cfg(test)]
#[path = "mcp_tests.rs"]
mod mcp_tests;

const PROTOCOL_VERSION: &str = "2024-11-05";
const SERVER_NAME: &str = "mcp-deep-research";

const PARSE_ERROR: i32 = -32700;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;

/// Incoming JSON-RPC request or notification.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    /// Absent for notifications.
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// Outgoing JSON-RPC response. Exactly one of `result` and `error` is set.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    /// Echoes the request id; `null` when the request could not be parsed.
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// An MCP tool and the JSON Schema of its arguments.
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl Tool {
    fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

/// `tools/call` result: a single text block.
#[derive(Debug, Serialize)]
struct ToolCallResult {
    content: Vec<TextContent>,
    #[serde(rename = "isError", skip_serializing_if = "std::ops::Not::not")]
    is_error: bool,
}

#[derive(Debug, Serialize)]
struct TextContent {
    #[serde(rename = "type")]
    kind: &'static str,
    text: String,
}

impl ToolCallResult {
    fn text(text: String, is_error: bool) -> Self {
        Self {
            content: vec![TextContent { kind: "text", text }],
            is_error,
        }
    }
}

/// MCP server exposing the research tools.
pub struct McpServer {
    state: SharedState,
}

impl McpServer {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Serve stdin/stdout until stdin closes.
    pub async fn run(&self) -> std::io::Result<()> {
        info!("MCP Deep Research Server starting...");
        self.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    }

    /// Serve line-delimited JSON-RPC from `reader` to `writer` until EOF.
    pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                info!("EOF received, shutting down");
                return Ok(());
            }

            let payload = line.trim();
            if payload.is_empty() {
                continue;
            }
            debug!(request = %payload, "Received request");

            let response = match serde_json::from_str::<JsonRpcRequest>(payload) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => {
                    warn!(error = %e, "Unparseable request");
                    Some(JsonRpcResponse::error(
                        None,
                        PARSE_ERROR,
                        format!("Parse error: {}", e),
                    ))
                }
            };

            if let Some(response) = response {
                let mut encoded = serde_json::to_vec(&response)?;
                encoded.push(b'\n');
                writer.write_all(&encoded).await?;
                writer.flush().await?;
            }
        }
    }

    /// Route one request. `None` means nothing is written back.
    async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;

        match method.as_str() {
            "initialize" => Some(JsonRpcResponse::success(id, initialize_result())),
            "tools/list" => Some(JsonRpcResponse::success(
                id,
                json!({ "tools": research_tools() }),
            )),
            "tools/call" => Some(self.call_tool(id, params).await),
            "ping" => Some(JsonRpcResponse::success(id, json!({}))),
            _ if id.is_none() => {
                debug!(method = %method, "Notification ignored");
                None
            }
            _ => {
                warn!(method = %method, "Unknown method");
                Some(JsonRpcResponse::error(
                    id,
                    METHOD_NOT_FOUND,
                    format!("Method not found: {}", method),
                ))
            }
        }
    }

    async fn call_tool(&self, id: Option<Value>, params: Option<Value>) -> JsonRpcResponse {
        let params = match params.map(serde_json::from_value::<ToolCallParams>) {
            Some(Ok(params)) => params,
            Some(Err(e)) => {
                return JsonRpcResponse::error(id, INVALID_PARAMS, format!("Invalid params: {}", e))
            }
            None => return JsonRpcResponse::error(id, INVALID_PARAMS, "Missing params"),
        };

        debug!(tool = %params.name, "Tool call");

        let result = match handle_tool_call(&self.state, &params.name, params.arguments).await {
            Ok(value) => match serde_json::to_string_pretty(&value) {
                Ok(text) => ToolCallResult::text(text, false),
                Err(e) => {
                    return JsonRpcResponse::error(id, INTERNAL_ERROR, format!("Internal error: {}", e))
                }
            },
            Err(e) => {
                info!(tool = %params.name, error = %e, "Tool call failed");
                ToolCallResult::text(format!("Error: {}", e), true)
            }
        };

        match serde_json::to_value(result) {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, format!("Internal error: {}", e)),
        }
    }
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": { "listChanged": false } },
        "serverInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

/// Tool definitions exposed by the server.
pub fn research_tools() -> Vec<Tool> {
    vec![start_tool(), status_tool(), retry_tool(), state_tool()]
}

fn start_tool() -> Tool {
    Tool::new(
        "research_start",
        "Start a deep research run for a user message. Plans tasks, searches literature, runs analyses, forms hypotheses and replies; may continue autonomously depending on the research mode. Returns immediately with the message and job identifiers.",
        json!({
            "type": "object",
            "properties": {
                "conversation_id": {
                    "type": "string",
                    "description": "Conversation the message belongs to"
                },
                "message": {
                    "type": "string",
                    "description": "The research question or follow-up"
                },
                "research_mode": {
                    "type": "string",
                    "enum": ["steering", "semi-autonomous", "fully-autonomous"],
                    "description": "How many iterations may run before control returns to the user. Sticks to the conversation once set."
                }
            },
            "required": ["conversation_id", "message"]
        }),
    )
}

fn status_tool() -> Tool {
    Tool::new(
        "research_status",
        "Get the status of a research message: processing, completed with reply text, papers and files, or failed with an error.",
        json!({
            "type": "object",
            "properties": {
                "message_id": {
                    "type": "string",
                    "description": "Message returned by research_start, or a chained continuation message"
                }
            },
            "required": ["message_id"]
        }),
    )
}

fn retry_tool() -> Tool {
    Tool::new(
        "research_retry",
        "Retry a failed research iteration job. Only available in queue execution mode.",
        json!({
            "type": "object",
            "properties": {
                "job_id": { "type": "string", "description": "Failed job to retry" }
            },
            "required": ["job_id"]
        }),
    )
}

fn state_tool() -> Tool {
    Tool::new(
        "research_state",
        "Get the research state of a conversation: objectives, plan, hypothesis, insights, discoveries and staged next steps.",
        json!({
            "type": "object",
            "properties": {
                "conversation_id": { "type": "string", "description": "Conversation to inspect" }
            },
            "required": ["conversation_id"]
        }),
    )
}

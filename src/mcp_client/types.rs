//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 frames, MCP protocol payloads, and the server spawn config.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// The only JSON-RPC version this client speaks.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request message. Outbound ids are numeric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Value::from(id),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Successful response to a server-initiated request.
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error response to a server-initiated request.
    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// The numeric request id this response answers, if it has one.
    pub fn request_id(&self) -> Option<u64> {
        self.id.as_u64()
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One protocol frame, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    /// Classify a decoded JSON object.
    ///
    /// The caller has already checked the `jsonrpc` tag. Returns a reason
    /// string when the object is neither a request, a notification, nor a
    /// response.
    pub fn classify(value: Value) -> Result<Self, String> {
        let has_method = value.get("method").is_some();
        let has_id = value.get("id").is_some_and(|id| !id.is_null());

        if has_method {
            if has_id {
                serde_json::from_value(value)
                    .map(JsonRpcMessage::Request)
                    .map_err(|e| format!("invalid request: {e}"))
            } else {
                serde_json::from_value(value)
                    .map(JsonRpcMessage::Notification)
                    .map_err(|e| format!("invalid notification: {e}"))
            }
        } else if value.get("id").is_some() {
            let response: JsonRpcResponse =
                serde_json::from_value(value).map_err(|e| format!("invalid response: {e}"))?;
            if response.result.is_none() && response.error.is_none() {
                return Err("response carries neither result nor error".into());
            }
            Ok(JsonRpcMessage::Response(response))
        } else {
            Err("message has neither method nor id".into())
        }
    }

    /// Serialize to a single-line JSON string.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        match self {
            JsonRpcMessage::Request(req) => serde_json::to_string(req),
            JsonRpcMessage::Notification(note) => serde_json::to_string(note),
            JsonRpcMessage::Response(resp) => serde_json::to_string(resp),
        }
    }
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Name/version pair used by both sides of the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Parameters of the `initialize` request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: Value,
    pub client_info: Implementation,
}

/// MCP `initialize` response payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub capabilities: Value,
    #[serde(default)]
    pub server_info: Option<Implementation>,
    #[serde(default)]
    pub instructions: Option<String>,
}

/// A tool as advertised by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema", alias = "inputSchema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// One page of a `tools/list` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<ToolDescriptor>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Result of `tools/call`.
///
/// `content` is kept as raw MCP content items; the orchestrator converts them
/// for the model. `is_error` signals a tool-level failure, which is not a
/// protocol error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default = "empty_content")]
    pub content: Value,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

fn empty_content() -> Value {
    Value::Array(Vec::new())
}

impl CallToolResult {
    /// Concatenate the `text` items of the content array.
    pub fn text(&self) -> String {
        match &self.content {
            Value::Array(items) => items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Peer information recorded after a successful handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub protocol_version: String,
    pub server: Option<Implementation>,
    pub capabilities: Value,
    pub instructions: Option<String>,
}

// ─── Session State ───────────────────────────────────────────────────────────

/// Connection lifecycle of a protocol session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Handshaking,
    Ready,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Handshaking => "handshaking",
            SessionState::Ready => "ready",
            SessionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

// ─── Server Config ───────────────────────────────────────────────────────────

/// How to spawn the tool server process.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_name")]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child process.
    #[serde(default)]
    pub cwd: Option<String>,
}

fn default_server_name() -> String {
    "tools".to_string()
}

impl ServerConfig {
    /// Build a config for a bare server script, choosing the interpreter by
    /// file extension. Unknown extensions are executed directly.
    pub fn from_script_path(path: &str) -> Self {
        let ext = std::path::Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        let (command, mut args) = match ext.as_deref() {
            Some("py") => (default_python_command().to_string(), Vec::new()),
            Some("js" | "mjs" | "cjs") => ("node".to_string(), Vec::new()),
            Some("ts") => (default_npx_command().to_string(), vec!["tsx".to_string()]),
            _ => (path.to_string(), Vec::new()),
        };
        if command != path {
            args.push(path.to_string());
        }

        let name = std::path::Path::new(path)
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .unwrap_or_else(default_server_name);

        Self {
            name,
            command,
            args,
            env: HashMap::new(),
            cwd: None,
        }
    }
}

/// Platform-correct Python command.
///
/// macOS 12.3+ removed the `python` symlink; only `python3` exists.
fn default_python_command() -> &'static str {
    if cfg!(target_os = "windows") {
        "python"
    } else {
        "python3"
    }
}

/// Platform-correct npx command (`npx.cmd` on Windows).
fn default_npx_command() -> &'static str {
    if cfg!(target_os = "windows") {
        "npx.cmd"
    } else {
        "npx"
    }
}

// ─── Standard Error Codes ────────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
        // params should be omitted when None
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_classify_response() {
        let msg = JsonRpcMessage::classify(json!({
            "jsonrpc": "2.0", "id": 7, "result": {"tools": []}
        }))
        .unwrap();
        match msg {
            JsonRpcMessage::Response(resp) => assert_eq!(resp.request_id(), Some(7)),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_request_and_notification() {
        let req = JsonRpcMessage::classify(json!({
            "jsonrpc": "2.0", "id": "srv-1", "method": "ping"
        }))
        .unwrap();
        assert!(matches!(req, JsonRpcMessage::Request(_)));

        let note = JsonRpcMessage::classify(json!({
            "jsonrpc": "2.0", "method": "notifications/tools/list_changed"
        }))
        .unwrap();
        assert!(matches!(note, JsonRpcMessage::Notification(_)));
    }

    #[test]
    fn test_classify_rejects_shapeless_messages() {
        assert!(JsonRpcMessage::classify(json!({"jsonrpc": "2.0"})).is_err());
        assert!(JsonRpcMessage::classify(json!({"jsonrpc": "2.0", "id": 3})).is_err());
    }

    #[test]
    fn test_error_response_deserialization() {
        let msg = JsonRpcMessage::classify(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "error": {"code": -32601, "message": "Method not found"}
        }))
        .unwrap();
        let JsonRpcMessage::Response(resp) = msg else {
            panic!("expected response");
        };
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_tool_descriptor_accepts_camel_case_schema() {
        let tool: ToolDescriptor = serde_json::from_value(json!({
            "name": "get_forecast",
            "description": "Weather forecast",
            "inputSchema": {"type": "object", "required": ["state"]}
        }))
        .unwrap();
        assert_eq!(tool.input_schema["required"][0], "state");
    }

    #[test]
    fn test_tool_descriptor_defaults() {
        let tool: ToolDescriptor = serde_json::from_value(json!({"name": "noop"})).unwrap();
        assert_eq!(tool.description, "");
        assert_eq!(tool.input_schema["type"], "object");
    }

    #[test]
    fn test_call_tool_result_text_and_error_flag() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "line one"},
                {"type": "image", "data": "...", "mimeType": "image/png"},
                {"type": "text", "text": "line two"}
            ],
            "isError": true
        }))
        .unwrap();
        assert!(result.is_error);
        assert_eq!(result.text(), "line one\nline two");
    }

    #[test]
    fn test_server_config_from_script_path() {
        let py = ServerConfig::from_script_path("servers/weather.py");
        assert_eq!(py.args, vec!["servers/weather.py"]);
        assert_eq!(py.name, "weather");
        assert!(py.command.starts_with("python"));

        let js = ServerConfig::from_script_path("build/index.js");
        assert_eq!(js.command, "node");
        assert_eq!(js.args, vec!["build/index.js"]);

        let bin = ServerConfig::from_script_path("./target/release/git-tools");
        assert_eq!(bin.command, "./target/release/git-tools");
        assert!(bin.args.is_empty());
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::Ready.to_string(), "ready");
        assert_eq!(SessionState::Closed.to_string(), "closed");
    }
}

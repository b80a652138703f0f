//! MCP client error types.

use thiserror::Error;

use super::types::SessionState;

/// Errors that can occur while talking to an MCP server.
///
/// Every variant owns its context as plain data so the same error can be
/// delivered to every pending call when the session fails.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// The server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The child exited, a stream closed, or a frame was malformed.
    #[error("transport error for server '{server}': {reason}")]
    Transport { server: String, reason: String },

    /// Capability negotiation failed or timed out.
    #[error("server '{server}' handshake failed: {reason}")]
    Handshake { server: String, reason: String },

    /// Well-formed frame that violates the protocol (missing fields, bad shape).
    #[error("protocol error from server '{server}': {reason}")]
    Protocol { server: String, reason: String },

    /// Server answered a request with a JSON-RPC error object.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Operation attempted outside the `Ready` state.
    #[error("session with server '{server}' is not ready (state: {state})")]
    NotReady { server: String, state: SessionState },

    /// No response within the configured window.
    #[error("'{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// The session closed while the request was pending.
    #[error("request '{method}' cancelled: session closed")]
    Cancelled { method: String },

    /// The server advertised the same tool name twice.
    #[error("server '{server}' lists tool '{name}' more than once")]
    DuplicateTool { server: String, name: String },

    /// Tool call arguments were rejected before reaching the server.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },
}

/// Coarse failure classes used for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Handshake,
    Protocol,
    Timeout,
    Cancelled,
    Config,
}

impl McpError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            McpError::SpawnFailed { .. } | McpError::Transport { .. } => ErrorKind::Transport,
            McpError::Handshake { .. } => ErrorKind::Handshake,
            McpError::Protocol { .. }
            | McpError::ServerError { .. }
            | McpError::NotReady { .. }
            | McpError::InvalidArguments { .. } => ErrorKind::Protocol,
            McpError::Timeout { .. } => ErrorKind::Timeout,
            McpError::Cancelled { .. } => ErrorKind::Cancelled,
            McpError::DuplicateTool { .. } => ErrorKind::Config,
        }
    }

    /// Whether this error ends the session (as opposed to a single request).
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Handshake)
    }

    /// One-line description with a likely corrective action, for end users.
    pub fn user_message(&self) -> String {
        let hint = match self.kind() {
            ErrorKind::Transport => match self {
                McpError::SpawnFailed { .. } => {
                    "could not start the tool server; check `server.command` and `server.args`"
                }
                _ => "connection to the tool server was lost; it may have crashed or printed to stdout",
            },
            ErrorKind::Handshake => {
                "the tool server rejected the connection; check that it speaks a supported MCP version"
            }
            ErrorKind::Protocol => "tool execution failed; the tool server sent an invalid or error response",
            ErrorKind::Timeout => "the tool server did not answer in time; raise `engine.call_timeout_secs` or retry",
            ErrorKind::Cancelled => "the request was cancelled because the session closed",
            ErrorKind::Config => "the tool server configuration is inconsistent; fix the server's tool list",
        };
        format!("{hint} ({self})")
    }
}

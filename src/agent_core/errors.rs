//! Agent Core error types.

use thiserror::Error;

use crate::inference::InferenceError;
use crate::mcp_client::McpError;

/// Errors that end a query.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A tool invocation failed below the tool itself (transport, protocol, timeout).
    #[error("tool execution failed: {0}")]
    Tool(#[from] McpError),

    /// The model call failed.
    #[error("model call failed: {0}")]
    Model(#[from] InferenceError),

    /// The model kept requesting tools past the round limit.
    #[error("gave up after {max_rounds} model rounds without a final answer")]
    RoundCapExceeded { max_rounds: u32 },

    /// The user cancelled the query.
    #[error("query cancelled")]
    Cancelled,
}

impl AgentError {
    /// Whether the tool session is gone and the engine must be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::Tool(e) if e.is_fatal())
    }

    /// One-line description with a likely corrective action.
    pub fn user_message(&self) -> String {
        match self {
            AgentError::Tool(e) => e.user_message(),
            AgentError::Model(e) => e.user_message(),
            AgentError::RoundCapExceeded { .. } => format!(
                "the model did not finish; rephrase the question or raise `engine.max_rounds` ({self})"
            ),
            AgentError::Cancelled => "query cancelled".to_string(),
        }
    }
}

//! Agent Core: orchestration layer for mcpilot.
//!
//! Submodules:
//! - `conversation`: Append-only message history
//! - `orchestrator`: Bounded model/tool loop for one query
//! - `errors`: Agent-level error types

pub mod conversation;
pub mod errors;
pub mod orchestrator;

// Re-exports for convenience
pub use conversation::Conversation;
pub use errors::AgentError;
pub use orchestrator::{
    CancelFlag, LoopState, Orchestrator, OrchestratorConfig, QueryOutcome, DEFAULT_MAX_ROUNDS,
};

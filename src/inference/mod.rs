//! Inference Client: Messages API client for the conversation model.
//!
//! This module handles all communication with the model endpoint:
//! - Wire types for messages, content blocks, and tool definitions
//! - A non-streaming Messages API client with bounded retries
//!
//! The orchestrator depends only on the [`ModelClient`] trait, so tests
//! and alternative backends can stand in for the HTTP client.

pub mod client;
pub mod errors;
pub mod types;

// Re-exports for convenience
pub use client::{MessagesClient, ModelClient};
pub use errors::InferenceError;
pub use types::{ContentBlock, Message, ModelRequest, Role, ToolDefinition};

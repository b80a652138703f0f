//! MCP Client: JSON-RPC over stdio to a single tool server.
//!
//! This module handles:
//! - Spawning the server child process and framing JSON-RPC 2.0 on its stdio
//! - The protocol session: handshake, tool listing, correlated tool calls
//! - The tool catalog offered to the model
//! - Ordered start-up and shutdown of process and session
//!
//! The orchestrator reaches tools only through the [`ToolExecutor`] trait.

pub mod catalog;
pub mod errors;
pub mod lifecycle;
pub mod session;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use catalog::ToolCatalog;
pub use errors::{ErrorKind, McpError};
pub use lifecycle::ManagedServer;
pub use session::{McpSession, SessionTimeouts, ToolExecutor};
pub use transport::{LineChannel, StdioTransport, Transport};
pub use types::{CallToolResult, ServerConfig, SessionState, ToolDescriptor};

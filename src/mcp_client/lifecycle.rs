//! Server process lifecycle management.
//!
//! Acquires the pieces of a connection in order (child process, protocol
//! session, handshake) and releases them in reverse. A partially started
//! server is always torn down before the error is returned.

use std::sync::Arc;

use super::errors::McpError;
use super::session::{McpSession, SessionTimeouts};
use super::transport::{StdioTransport, Transport};
use super::types::{PeerInfo, ServerConfig};

// ─── ManagedServer ───────────────────────────────────────────────────────────

/// A running MCP server process with its ready protocol session.
pub struct ManagedServer {
    /// Human-readable server name (e.g., "weather").
    pub name: String,
    transport: Arc<StdioTransport>,
    session: McpSession,
    shut_down: bool,
}

impl ManagedServer {
    /// Spawn the server and complete the handshake.
    ///
    /// On failure after spawn the session is closed, then the process is
    /// stopped; the error carries whatever the server wrote to stderr.
    pub async fn start(config: &ServerConfig, timeouts: SessionTimeouts) -> Result<Self, McpError> {
        let name = config.name.clone();
        let transport = Arc::new(StdioTransport::spawn(config)?);
        let session = McpSession::new(&name, transport.clone(), timeouts);

        if let Err(e) = session.initialize().await {
            let _ = session.close().await;
            let _ = transport.close().await;

            let stderr_ctx = transport.stderr_tail().snapshot();
            if !stderr_ctx.is_empty() {
                tracing::warn!(
                    server = %name,
                    stderr = %stderr_ctx,
                    "server stderr captured on failure"
                );
            }
            return Err(with_stderr(e, &transport.stderr_tail().error_suffix()));
        }

        Ok(Self {
            name,
            transport,
            session,
            shut_down: false,
        })
    }

    /// The protocol session (always past the handshake).
    pub fn session(&self) -> &McpSession {
        &self.session
    }

    pub fn peer_info(&self) -> Option<PeerInfo> {
        self.session.peer_info()
    }

    /// Check if the server process is still running.
    pub async fn is_alive(&self) -> bool {
        self.transport.is_alive().await
    }

    /// Close the session, then stop the process. Idempotent.
    pub async fn shutdown(&mut self) -> Result<(), McpError> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        // Session close releases the transport (stdin EOF, wait, kill).
        self.session.close().await?;
        tracing::info!(server = %self.name, "server shut down");
        Ok(())
    }
}

impl Drop for ManagedServer {
    fn drop(&mut self) {
        if !self.shut_down {
            tracing::warn!(
                server = %self.name,
                "server dropped without shutdown; process will be killed"
            );
        }
    }
}

/// Append the stderr suffix to an error's reason where it has one.
fn with_stderr(err: McpError, suffix: &str) -> McpError {
    if suffix.is_empty() {
        return err;
    }
    match err {
        McpError::Transport { server, reason } if !reason.contains(" | stderr: ") => {
            McpError::Transport {
                server,
                reason: format!("{reason}{suffix}"),
            }
        }
        McpError::Handshake { server, reason } => McpError::Handshake {
            server,
            reason: format!("{reason}{suffix}"),
        },
        other => other,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::mcp_client::types::SessionState;
    use std::time::Duration;

    fn sh(name: &str, script: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: Default::default(),
            cwd: None,
        }
    }

    fn quick() -> SessionTimeouts {
        SessionTimeouts {
            init: Duration::from_secs(5),
            list: Duration::from_secs(5),
            call: Duration::from_secs(5),
        }
    }

    /// A shell server that answers the handshake, one listing, and one call.
    ///
    /// Request ids are deterministic: initialize = 1, tools/list = 2, tools/call = 3.
    const SCRIPTED_SERVER: &str = r#"
read line
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-06-18","capabilities":{"tools":{}},"serverInfo":{"name":"scripted","version":"1.0"}}}'
read line
read line
echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"Echo text","inputSchema":{"type":"object","required":["text"]}}]}}'
read line
echo 'working...' >&2
echo '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"hello"}],"isError":false}}'
read line
"#;

    #[tokio::test]
    async fn test_child_exiting_before_initialize_is_an_error() {
        let err = ManagedServer::start(&sh("quitter", "exit 0"), quick())
            .await
            .err()
            .expect("start should fail");
        assert!(err.is_fatal(), "got {err}");
    }

    #[tokio::test]
    async fn test_stdout_noise_is_malformed_frame() {
        let err = ManagedServer::start(&sh("noisy", "echo hello; read line"), quick())
            .await
            .err()
            .expect("start should fail");
        assert!(err.to_string().contains("malformed frame"), "got {err}");
    }

    #[tokio::test]
    async fn test_failure_reports_stderr() {
        let err = ManagedServer::start(&sh("broken", "echo 'ImportError: mcp' >&2; exit 1"), quick())
            .await
            .err()
            .expect("start should fail");
        assert!(err.to_string().contains("ImportError"), "got {err}");
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_failure() {
        let config = ServerConfig {
            name: "ghost".into(),
            command: "/no/such/server".into(),
            args: vec![],
            env: Default::default(),
            cwd: None,
        };
        let err = ManagedServer::start(&config, quick()).await.err().unwrap();
        assert!(matches!(err, McpError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn test_scripted_server_round_trip() {
        let mut server = ManagedServer::start(&sh("scripted", SCRIPTED_SERVER), quick())
            .await
            .unwrap();
        assert_eq!(server.session().state(), SessionState::Ready);
        assert_eq!(server.peer_info().unwrap().server.unwrap().name, "scripted");

        let tools = server.session().list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let mut args = serde_json::Map::new();
        args.insert("text".into(), serde_json::json!("hello"));
        let result = server.session().call_tool("echo", args).await.unwrap();
        assert_eq!(result.text(), "hello");

        server.shutdown().await.unwrap();
        assert_eq!(server.session().state(), SessionState::Closed);
        assert!(!server.is_alive().await);
        server.shutdown().await.unwrap();
    }
}

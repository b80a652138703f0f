//! Engine: one tool server, its catalog, and one conversation.
//!
//! Start-up is ordered (process, session, catalog, orchestrator) and
//! shutdown runs in reverse. The engine is the only owner of the server; the
//! orchestrator borrows its session for the duration of each query.

use thiserror::Error;

use crate::agent_core::{AgentError, CancelFlag, Orchestrator, QueryOutcome};
use crate::config::{AppConfig, ConfigError};
use crate::inference::{InferenceError, ModelClient};
use crate::mcp_client::{ManagedServer, McpError, ServerConfig, ToolCatalog};

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("tool server error: {0}")]
    Server(#[from] McpError),

    #[error("model client error: {0}")]
    Model(#[from] InferenceError),
}

impl EngineError {
    pub fn user_message(&self) -> String {
        match self {
            EngineError::Config(e) => e.user_message(),
            EngineError::Server(e) => e.user_message(),
            EngineError::Model(e) => e.user_message(),
        }
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct Engine {
    server: ManagedServer,
    orchestrator: Orchestrator,
    shut_down: bool,
}

impl Engine {
    /// Start the configured server, load its tools, and get ready for queries.
    ///
    /// If the tool listing fails the server is shut down before returning.
    pub async fn start(config: &AppConfig, model: Box<dyn ModelClient>) -> Result<Self, EngineError> {
        config.validate()?;
        let server_config: &ServerConfig = config.server.as_ref().ok_or_else(|| ConfigError::Invalid {
            reason: "no tool server configured; pass a server script or set `server.command`".into(),
        })?;

        let mut server = ManagedServer::start(server_config, config.engine.session_timeouts()).await?;

        let catalog = match ToolCatalog::fetch(server.session()).await {
            Ok(catalog) => catalog,
            Err(e) => {
                if let Err(close_err) = server.shutdown().await {
                    tracing::warn!(error = %close_err, "shutdown after failed tool listing");
                }
                return Err(e.into());
            }
        };

        tracing::info!(
            server = %server.name,
            tools = ?catalog.names(),
            max_rounds = config.engine.max_rounds,
            "engine ready"
        );

        let mut orchestrator_config = config.orchestrator_config();
        let instructions = server.peer_info().and_then(|peer| peer.instructions);
        orchestrator_config.system_prompt =
            system_prompt_with(orchestrator_config.system_prompt.take(), instructions);

        Ok(Self {
            orchestrator: Orchestrator::new(model, catalog, orchestrator_config),
            server,
            shut_down: false,
        })
    }

    /// Run one query to completion.
    pub async fn ask(&mut self, query: &str) -> Result<QueryOutcome, AgentError> {
        tracing::info!(query_len = query.len(), "query received");
        self.orchestrator.run_query(self.server.session(), query).await
    }

    /// Whether the tool session can still serve calls.
    pub fn is_connected(&self) -> bool {
        self.server.session().is_ready()
    }

    /// Whether the server announced new tools since the catalog was loaded.
    pub fn tools_changed(&self) -> bool {
        self.server.session().tools_changed()
    }

    /// Re-list the server's tools and use them for later queries.
    pub async fn refresh_tools(&mut self) -> Result<usize, McpError> {
        let catalog = ToolCatalog::fetch(self.server.session()).await?;
        let count = catalog.len();
        self.orchestrator.set_catalog(catalog);
        Ok(count)
    }

    pub fn catalog(&self) -> &ToolCatalog {
        self.orchestrator.catalog()
    }

    pub fn server_name(&self) -> &str {
        &self.server.name
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.orchestrator.cancel_flag()
    }

    /// Close the session, then stop the server process. Idempotent.
    pub async fn shutdown(&mut self) -> Result<(), McpError> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        self.server.shutdown().await
    }
}

/// Append the server's usage instructions to the configured system prompt.
fn system_prompt_with(configured: Option<String>, instructions: Option<String>) -> Option<String> {
    let instructions = instructions.filter(|text| !text.trim().is_empty());
    match (configured, instructions) {
        (Some(prompt), Some(extra)) => Some(format!("{prompt}\n\n{extra}")),
        (prompt, extra) => prompt.or(extra),
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.shut_down {
            tracing::warn!(server = %self.server.name, "engine dropped without shutdown");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

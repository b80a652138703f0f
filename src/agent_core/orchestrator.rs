//! Conversation orchestrator: the bounded model/tool loop.
//!
//! One query runs as a sequence of rounds. Each round sends the full history
//! and the tool catalog to the model, appends the reply, and executes any
//! requested tools in the order the model emitted them. The results go back
//! to the model as one user message, and the loop continues until a reply
//! requests no tools or the round limit is hit.
//!
//! ```text
//! Idle → AwaitingModel → (ExecutingTools → AwaitingModel)* → Idle
//!                 └──────────── error ────────────→ Failed
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use super::conversation::Conversation;
use super::errors::AgentError;
use crate::inference::types::{ContentBlock, ModelRequest};
use crate::inference::ModelClient;
use crate::mcp_client::{CallToolResult, ToolCatalog, ToolExecutor};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default maximum model rounds per query.
pub const DEFAULT_MAX_ROUNDS: u32 = 10;

/// Maximum characters of tool output handed back to the model per call.
pub const MAX_TOOL_RESULT_CHARS: usize = 6_000;

/// Image media types the Messages API accepts inline.
const MODEL_IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

/// Shared flag that asks a running query to stop at the next checkpoint.
pub type CancelFlag = Arc<AtomicBool>;

// ─── Types ───────────────────────────────────────────────────────────────────

/// Per-query model parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub model: String,
    pub max_tokens: u32,
    pub max_rounds: u32,
    pub system_prompt: Option<String>,
}

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    AwaitingModel,
    ExecutingTools,
    Failed,
}

/// Result of a completed query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOutcome {
    /// Text blocks from every round, in order, joined with newlines.
    pub answer: String,
    /// Model calls made.
    pub rounds: u32,
    /// Tool invocations sent to the server.
    pub tool_calls: u32,
}

// ─── Orchestrator ────────────────────────────────────────────────────────────

pub struct Orchestrator {
    model: Box<dyn ModelClient>,
    catalog: ToolCatalog,
    conversation: Conversation,
    config: OrchestratorConfig,
    cancel: CancelFlag,
    state: LoopState,
}

impl Orchestrator {
    pub fn new(model: Box<dyn ModelClient>, catalog: ToolCatalog, config: OrchestratorConfig) -> Self {
        Self {
            model,
            catalog,
            conversation: Conversation::new(),
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            state: LoopState::Idle,
        }
    }

    /// Handle for cancelling the running query from another task.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Replace the tool catalog used by subsequent queries.
    pub fn set_catalog(&mut self, catalog: ToolCatalog) {
        self.catalog = catalog;
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Resolve one user query through as many tool rounds as it needs.
    ///
    /// On any error the history is rolled back to where it was before the
    /// query, so a later query never replays an unanswered tool request.
    pub async fn run_query(
        &mut self,
        tools: &dyn ToolExecutor,
        query: &str,
    ) -> Result<QueryOutcome, AgentError> {
        self.cancel.store(false, Ordering::SeqCst);
        self.state = LoopState::Idle;
        let checkpoint = self.conversation.len();

        match self.drive(tools, query).await {
            Ok(outcome) => {
                self.state = LoopState::Idle;
                tracing::info!(
                    rounds = outcome.rounds,
                    tool_calls = outcome.tool_calls,
                    answer_len = outcome.answer.len(),
                    "query completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                self.state = LoopState::Failed;
                self.conversation.truncate(checkpoint);
                tracing::warn!(error = %e, "query failed; history rolled back");
                Err(e)
            }
        }
    }

    async fn drive(&mut self, tools: &dyn ToolExecutor, query: &str) -> Result<QueryOutcome, AgentError> {
        self.conversation.push_user_text(query);
        let definitions = self.catalog.definitions();
        let mut answer_parts: Vec<String> = Vec::new();
        let mut tool_calls = 0u32;

        for round in 1..=self.config.max_rounds {
            self.check_cancelled()?;
            self.state = LoopState::AwaitingModel;

            let request = ModelRequest {
                model: self.config.model.clone(),
                max_tokens: self.config.max_tokens,
                system: self.config.system_prompt.clone(),
                messages: self.conversation.messages().to_vec(),
                tools: definitions.clone(),
            };
            let reply = self.model.generate(&request).await?;
            tracing::debug!(round, blocks = reply.content.len(), "model replied");
            self.conversation.push_assistant(reply.clone());

            let mut results = Vec::new();
            for block in reply.content {
                match block {
                    ContentBlock::Text { text } => answer_parts.push(text),
                    ContentBlock::ToolUse { id, name, input } => {
                        self.state = LoopState::ExecutingTools;
                        let result = self.invoke(tools, &id, &name, input, &mut tool_calls).await?;
                        results.push(result);
                        self.check_cancelled()?;
                    }
                    ContentBlock::ToolResult { tool_use_id, .. } => {
                        tracing::warn!(%tool_use_id, "ignoring tool_result block in model reply");
                    }
                }
            }

            if results.is_empty() {
                let answer = answer_parts.join("\n");
                if answer.is_empty() {
                    tracing::warn!(round, "model finished without any text");
                }
                return Ok(QueryOutcome {
                    answer,
                    rounds: round,
                    tool_calls,
                });
            }

            self.conversation.push_tool_results(results);
        }

        Err(AgentError::RoundCapExceeded {
            max_rounds: self.config.max_rounds,
        })
    }

    /// Execute one requested tool and wrap the outcome as a `ToolResult`.
    ///
    /// Calls the catalog rejects never reach the server; the model sees the
    /// rejection as an error result instead.
    async fn invoke(
        &self,
        tools: &dyn ToolExecutor,
        id: &str,
        name: &str,
        input: Value,
        tool_calls: &mut u32,
    ) -> Result<ContentBlock, AgentError> {
        if let Err(e) = self.catalog.validate_call(name, &input) {
            tracing::warn!(tool = name, error = %e, "rejected tool call");
            return Ok(ContentBlock::tool_error(id, e.to_string()));
        }

        let arguments = match input {
            Value::Object(map) => map,
            _ => Default::default(),
        };

        tracing::info!(tool = name, tool_use_id = id, "invoking tool");
        *tool_calls += 1;
        let result = tools.call_tool(name, arguments).await?;
        let is_error = result.is_error;
        if is_error {
            tracing::info!(tool = name, error = %result.text(), "tool reported an error");
        }

        Ok(ContentBlock::ToolResult {
            tool_use_id: id.to_string(),
            content: tool_result_content(name, result),
            is_error,
        })
    }

    fn check_cancelled(&self) -> Result<(), AgentError> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(AgentError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ─── Tool Result Conversion ──────────────────────────────────────────────────

/// One MCP content item as the model will see it.
enum ResultPart {
    Text(String),
    Image(Value),
}

/// Convert MCP tool output into `tool_result` content for the model.
///
/// Text and supported images map directly. Every other MCP item type is
/// rendered as text, and text past `MAX_TOOL_RESULT_CHARS` is cut with a
/// notice.
fn tool_result_content(tool: &str, result: CallToolResult) -> Value {
    let mut items = match result.content {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        Value::String(s) => vec![json!({ "type": "text", "text": s })],
        other => vec![json!({ "type": "text", "text": other.to_string() })],
    };
    if items.is_empty() {
        if let Some(structured) = result.structured_content {
            items.push(json!({ "type": "text", "text": structured.to_string() }));
        }
    }

    let mut blocks = Vec::with_capacity(items.len());
    let mut budget = MAX_TOOL_RESULT_CHARS;
    let mut total_chars = 0usize;
    for item in &items {
        match result_part(item) {
            ResultPart::Image(block) => blocks.push(block),
            ResultPart::Text(text) => {
                let len = text.chars().count();
                total_chars += len;
                if budget == 0 || text.is_empty() {
                    continue;
                }
                let kept: String = text.chars().take(budget).collect();
                budget -= kept.chars().count();
                if !kept.is_empty() {
                    blocks.push(json!({ "type": "text", "text": kept }));
                }
            }
        }
    }

    if total_chars > MAX_TOOL_RESULT_CHARS {
        tracing::warn!(
            tool = tool,
            original_len = total_chars,
            truncated_to = MAX_TOOL_RESULT_CHARS,
            "tool result truncated"
        );
        blocks.push(json!({
            "type": "text",
            "text": format!(
                "[... truncated: showing first {MAX_TOOL_RESULT_CHARS} of {total_chars} chars]"
            ),
        }));
    }
    Value::Array(blocks)
}

fn result_part(item: &Value) -> ResultPart {
    let field = |key: &str| item.get(key).and_then(Value::as_str);
    match field("type") {
        Some("text") => ResultPart::Text(field("text").unwrap_or_default().to_string()),
        Some("image") => match (field("data"), field("mimeType")) {
            (Some(data), Some(mime)) if MODEL_IMAGE_TYPES.contains(&mime) => {
                ResultPart::Image(json!({
                    "type": "image",
                    "source": { "type": "base64", "media_type": mime, "data": data },
                }))
            }
            (_, mime) => ResultPart::Text(format!(
                "[image omitted: {}]",
                mime.unwrap_or("no media type")
            )),
        },
        Some("audio") => ResultPart::Text(format!(
            "[audio omitted: {}]",
            field("mimeType").unwrap_or("no media type")
        )),
        Some("resource") => {
            let resource = item.get("resource");
            let uri = resource
                .and_then(|r| r.get("uri"))
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            match resource.and_then(|r| r.get("text")).and_then(Value::as_str) {
                Some(text) => ResultPart::Text(format!("[resource {uri}]\n{text}")),
                None => ResultPart::Text(format!("[binary resource omitted: {uri}]")),
            }
        }
        Some("resource_link") => {
            let uri = field("uri").unwrap_or("unknown");
            ResultPart::Text(format!(
                "[resource link: {} ({uri})]",
                field("name").unwrap_or(uri)
            ))
        }
        _ => ResultPart::Text(item.to_string()),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! Messages API inference client.
//!
//! Sends the conversation and tool definitions to the model endpoint and
//! decodes one assistant message. Transient failures are retried with
//! exponential backoff.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::Value;
use uuid::Uuid;

use super::errors::InferenceError;
use super::types::{ContentBlock, Message, MessagesResponse, ModelRequest};
use crate::config::ModelConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Retries after the first attempt.
const MAX_RETRIES: u32 = 2;

/// Delay before the first retry; doubles each time.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

// ─── ModelClient ─────────────────────────────────────────────────────────────

/// Capability to produce one assistant message for a conversation.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, request: &ModelRequest) -> Result<Message, InferenceError>;
}

// ─── MessagesClient ──────────────────────────────────────────────────────────

/// HTTP client for `POST {base_url}/v1/messages`.
pub struct MessagesClient {
    http: HttpClient,
    endpoint: String,
    api_key: String,
    timeout_secs: u64,
    retry_base_delay: Duration,
}

impl MessagesClient {
    /// Build a client from the `model` config section.
    ///
    /// Reads the API key from the environment variable the config names.
    /// Does NOT check connectivity; that happens on the first request.
    pub fn from_config(config: &ModelConfig) -> Result<Self, InferenceError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| InferenceError::MissingApiKey {
                env_var: config.api_key_env.clone(),
            })?;
        Self::new(&config.base_url, &api_key, config.request_timeout_secs)
    }

    /// Build a client with an explicit key.
    pub fn new(base_url: &str, api_key: &str, timeout_secs: u64) -> Result<Self, InferenceError> {
        let base = base_url.trim_end_matches('/');
        if base.is_empty() {
            return Err(InferenceError::ConfigError {
                reason: "model base_url is empty".into(),
            });
        }
        let endpoint = format!("{base}/v1/messages");

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: endpoint.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            endpoint,
            api_key: api_key.to_string(),
            timeout_secs,
            retry_base_delay: RETRY_BASE_DELAY,
        })
    }

    /// The full URL requests are posted to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn try_request(&self, request: &ModelRequest) -> Result<Message, InferenceError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout {
                        duration_secs: self.timeout_secs,
                    }
                } else {
                    InferenceError::ConnectionFailed {
                        endpoint: self.endpoint.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body_text = response.text().await.map_err(|e| InferenceError::ResponseParse {
            reason: format!("failed to read response body: {e}"),
        })?;

        parse_messages_response(&body_text)
    }
}

#[async_trait]
impl ModelClient for MessagesClient {
    async fn generate(&self, request: &ModelRequest) -> Result<Message, InferenceError> {
        let mut attempt = 0;
        loop {
            match self.try_request(request).await {
                Ok(message) => return Ok(message),
                Err(e) if e.is_retriable() && attempt < MAX_RETRIES => {
                    let delay = self.retry_base_delay * 2u32.pow(attempt);
                    attempt += 1;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "model request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ─── Response Parsing ────────────────────────────────────────────────────────

/// Decode a Messages API body into an assistant message.
///
/// Block types other than `text` and `tool_use` (e.g. `thinking`) are skipped.
/// A `tool_use` block without an id gets a generated one.
pub fn parse_messages_response(body: &str) -> Result<Message, InferenceError> {
    let response: MessagesResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::ResponseParse {
            reason: format!("invalid JSON: {e}"),
        })?;

    let mut content = Vec::with_capacity(response.content.len());
    for block in response.content {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                let text = block.get("text").and_then(Value::as_str).unwrap_or_default();
                content.push(ContentBlock::text(text));
            }
            Some("tool_use") => {
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| InferenceError::ResponseParse {
                        reason: "tool_use block without a name".into(),
                    })?;
                let id = block
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("toolu_{}", Uuid::new_v4().simple()));
                let input = block
                    .get("input")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Default::default()));
                content.push(ContentBlock::ToolUse {
                    id,
                    name: name.to_string(),
                    input,
                });
            }
            other => {
                tracing::debug!(block_type = ?other, "skipping unsupported content block");
            }
        }
    }

    if let Some(usage) = response.usage {
        tracing::debug!(
            message_id = ?response.id,
            stop_reason = ?response.stop_reason,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "model response"
        );
    }

    Ok(Message::assistant(content))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::Role;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve canned HTTP responses, one per connection, and return the raw requests.
    async fn canned_server(responses: Vec<(u16, String)>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 64 * 1024];
                let mut request = String::new();
                // Read until the declared body has arrived.
                loop {
                    let n = socket.read(&mut buf).await.unwrap();
                    request.push_str(&String::from_utf8_lossy(&buf[..n]));
                    if let Some(head_end) = request.find("\r\n\r\n") {
                        let content_length = request[..head_end]
                            .lines()
                            .find_map(|l| {
                                let lower = l.to_ascii_lowercase();
                                lower
                                    .strip_prefix("content-length:")
                                    .map(|v| v.trim().parse::<usize>().unwrap())
                            })
                            .unwrap_or(0);
                        if request.len() >= head_end + 4 + content_length {
                            break;
                        }
                    }
                    if n == 0 {
                        break;
                    }
                }
                let reply = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
                seen.push(request);
            }
            seen
        });
        (format!("http://{addr}"), handle)
    }

    fn request() -> ModelRequest {
        ModelRequest {
            model: "test-model".into(),
            max_tokens: 100,
            system: None,
            messages: vec![Message::user_text("what's the weather in NY")],
            tools: vec![],
        }
    }

    #[test]
    fn test_parse_skips_unknown_blocks() {
        let body = r#"{
            "id": "msg_1",
            "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "toolu_9", "name": "get_forecast", "input": {"state": "NY"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        }"#;
        let msg = parse_messages_response(body).unwrap();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.content.len(), 2);
        assert_eq!(msg.text(), "Let me check.");
        match &msg.content[1] {
            ContentBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "toolu_9");
                assert_eq!(name, "get_forecast");
                assert_eq!(input["state"], "NY");
            }
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_generates_missing_tool_id() {
        let body = r#"{"content": [{"type": "tool_use", "name": "noop"}]}"#;
        let msg = parse_messages_response(body).unwrap();
        let ContentBlock::ToolUse { id, input, .. } = &msg.content[0] else {
            panic!("expected tool_use");
        };
        assert!(id.starts_with("toolu_"));
        assert!(input.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_invalid_json() {
        let err = parse_messages_response("<html>").unwrap_err();
        assert!(matches!(err, InferenceError::ResponseParse { .. }));
    }

    #[test]
    fn test_new_rejects_empty_base_url() {
        assert!(matches!(
            MessagesClient::new("", "key", 30),
            Err(InferenceError::ConfigError { .. })
        ));
        let client = MessagesClient::new("https://api.example.com/", "key", 30).unwrap();
        assert_eq!(client.endpoint(), "https://api.example.com/v1/messages");
    }

    #[tokio::test]
    async fn test_generate_sends_headers_and_decodes() {
        let body = r#"{"content": [{"type": "text", "text": "It will be sunny."}]}"#;
        let (base, server) = canned_server(vec![(200, body.to_string())]).await;
        let client = MessagesClient::new(&base, "sk-test", 5).unwrap();

        let msg = client.generate(&request()).await.unwrap();
        assert_eq!(msg.text(), "It will be sunny.");

        let seen = server.await.unwrap();
        let raw = seen[0].to_ascii_lowercase();
        assert!(raw.starts_with("post /v1/messages"));
        assert!(raw.contains("x-api-key: sk-test"));
        assert!(raw.contains("anthropic-version: 2023-06-01"));
        assert!(raw.contains("\"max_tokens\":100"));
    }

    #[tokio::test]
    async fn test_generate_retries_server_errors() {
        let ok = r#"{"content": [{"type": "text", "text": "recovered"}]}"#;
        let (base, server) = canned_server(vec![
            (529, r#"{"error":"overloaded"}"#.to_string()),
            (200, ok.to_string()),
        ])
        .await;
        let mut client = MessagesClient::new(&base, "sk-test", 5).unwrap();
        client.retry_base_delay = Duration::from_millis(1);

        let msg = client.generate(&request()).await.unwrap();
        assert_eq!(msg.text(), "recovered");
        assert_eq!(server.await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_generate_does_not_retry_client_errors() {
        let (base, server) =
            canned_server(vec![(400, r#"{"error":"bad request"}"#.to_string())]).await;
        let mut client = MessagesClient::new(&base, "sk-test", 5).unwrap();
        client.retry_base_delay = Duration::from_millis(1);

        let err = client.generate(&request()).await.unwrap_err();
        assert!(matches!(err, InferenceError::HttpError { status: 400, .. }));
        assert_eq!(server.await.unwrap().len(), 1);
    }
}

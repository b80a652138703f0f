//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with the MCP server child process:
//! - Writing JSON-RPC messages to stdin
//! - Reading JSON-RPC messages from stdout
//! - Line-delimited JSON protocol (one JSON object per line)
//!
//! The server's stdout is reserved for protocol traffic. A line that is not a
//! JSON-RPC 2.0 object corrupts the stream and is reported as a fatal
//! transport error; it is never skipped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::{JsonRpcMessage, ServerConfig, JSONRPC_VERSION};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Largest inbound frame accepted; a longer line is a fatal transport error.
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Timeout for the child to exit after its stdin is closed before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of trailing stderr lines kept for error context.
const STDERR_TAIL_LINES: usize = 20;

/// Cap on stderr text included in an error message.
const STDERR_SUFFIX_MAX_CHARS: usize = 2000;

/// How long `close()` waits for buffered stderr to be drained.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

// ─── Transport Trait ─────────────────────────────────────────────────────────

/// A duplex channel of discrete protocol messages.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one fully framed message.
    async fn send(&self, message: &JsonRpcMessage) -> Result<(), McpError>;

    /// Wait for the next complete inbound message.
    ///
    /// `McpError::Transport` means the stream is unusable from now on;
    /// `McpError::Protocol` means one well-formed but unclassifiable frame
    /// was dropped and reading may continue.
    async fn receive(&self) -> Result<JsonRpcMessage, McpError>;

    /// Release the underlying streams (and process, if any).
    async fn close(&self) -> Result<(), McpError>;
}

// ─── Line Channel ────────────────────────────────────────────────────────────

/// Newline-delimited JSON-RPC framing over any async reader/writer pair.
pub struct LineChannel<R, W> {
    label: String,
    reader: Mutex<BufReader<R>>,
    writer: Mutex<Option<W>>,
}

impl<R, W> LineChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap a reader/writer pair. `label` names the peer in errors and logs.
    pub fn new(label: &str, reader: R, writer: W) -> Self {
        Self {
            label: label.to_string(),
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(Some(writer)),
        }
    }

    fn transport_error(&self, reason: impl Into<String>) -> McpError {
        McpError::Transport {
            server: self.label.clone(),
            reason: reason.into(),
        }
    }

    /// Drop the writer so the peer sees EOF on its input.
    async fn close_writer(&self) {
        let mut writer = self.writer.lock().await;
        if let Some(mut w) = writer.take() {
            let _ = w.shutdown().await;
        }
    }

    /// Decode one non-empty line into a classified message.
    fn decode_line(&self, line: &str) -> Result<JsonRpcMessage, McpError> {
        let value: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| self.transport_error(format!("malformed frame (not JSON: {e}): {}", preview(line))))?;

        if value.get("jsonrpc").and_then(|v| v.as_str()) != Some(JSONRPC_VERSION) {
            return Err(self.transport_error(format!(
                "malformed frame (missing jsonrpc \"2.0\" tag): {}",
                preview(line)
            )));
        }

        JsonRpcMessage::classify(value).map_err(|reason| McpError::Protocol {
            server: self.label.clone(),
            reason,
        })
    }
}

#[async_trait]
impl<R, W> Transport for LineChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, message: &JsonRpcMessage) -> Result<(), McpError> {
        let mut json = message
            .to_line()
            .map_err(|e| self.transport_error(format!("failed to serialize message: {e}")))?;
        json.push('\n');

        let mut writer = self.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or_else(|| self.transport_error("input stream is closed"))?;
        stream
            .write_all(json.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        stream
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))?;
        Ok(())
    }

    async fn receive(&self) -> Result<JsonRpcMessage, McpError> {
        let mut line_buf = Vec::new();
        let mut reader = self.reader.lock().await;

        loop {
            line_buf.clear();
            let bytes_read = (&mut *reader)
                .take(MAX_FRAME_BYTES as u64 + 1)
                .read_until(b'\n', &mut line_buf)
                .await
                .map_err(|e| self.transport_error(format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                return Err(self.transport_error("server stdout closed"));
            }
            if bytes_read > MAX_FRAME_BYTES && line_buf.last() != Some(&b'\n') {
                return Err(self.transport_error(format!(
                    "frame exceeds {MAX_FRAME_BYTES} bytes"
                )));
            }

            let line = std::str::from_utf8(&line_buf)
                .map_err(|e| self.transport_error(format!("malformed frame (not UTF-8: {e})")))?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            return self.decode_line(trimmed);
        }
    }

    async fn close(&self) -> Result<(), McpError> {
        self.close_writer().await;
        Ok(())
    }
}

/// Shorten a line for inclusion in an error message.
fn preview(line: &str) -> String {
    const MAX: usize = 120;
    if line.chars().count() <= MAX {
        line.to_string()
    } else {
        let cut: String = line.chars().take(MAX).collect();
        format!("{cut}...")
    }
}

// ─── Stderr Capture ──────────────────────────────────────────────────────────

/// Ring buffer of the most recent stderr lines from the server.
#[derive(Debug, Clone, Default)]
pub struct StderrTail {
    lines: Arc<StdMutex<VecDeque<String>>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// The captured lines joined with newlines (empty if none).
    pub fn snapshot(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Format a stderr suffix for error messages (empty string if no stderr).
    pub fn error_suffix(&self) -> String {
        let captured = self.snapshot();
        let captured = captured.trim();
        if captured.is_empty() {
            return String::new();
        }
        if captured.chars().count() > STDERR_SUFFIX_MAX_CHARS {
            let cut: String = captured.chars().take(STDERR_SUFFIX_MAX_CHARS).collect();
            format!(" | stderr: {cut}...(truncated)")
        } else {
            format!(" | stderr: {captured}")
        }
    }
}

/// Forward the child's stderr to the log, keeping a short tail.
fn spawn_stderr_forwarder(server: String, stderr: ChildStderr, tail: StderrTail) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target: "mcpilot::server_stderr", server = %server, "{line}");
            tail.push(line);
        }
    })
}

// ─── Stdio Transport ─────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    channel: LineChannel<ChildStdout, ChildStdin>,
    process: Mutex<Child>,
    stderr: StderrTail,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Spawn the server process and wire its stdio.
    ///
    /// The child is killed if the transport is dropped without `close()`.
    pub fn spawn(config: &ServerConfig) -> Result<Self, McpError> {
        let name = config.name.as_str();
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);

        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(dir) = config.cwd.as_deref() {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{} {}: {e}", config.command, config.args.join(" ")),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr = StderrTail::default();
        let stderr_task = child
            .stderr
            .take()
            .map(|handle| spawn_stderr_forwarder(name.to_string(), handle, stderr.clone()));

        tracing::info!(
            server = name,
            command = %config.command,
            args = ?config.args,
            pid = child.id(),
            "spawned tool server"
        );

        Ok(Self {
            server_name: name.to_string(),
            channel: LineChannel::new(name, stdout, stdin),
            process: Mutex::new(child),
            stderr,
            stderr_task: Mutex::new(stderr_task),
        })
    }

    /// Recent stderr output of the server.
    pub fn stderr_tail(&self) -> &StderrTail {
        &self.stderr
    }

    /// Check if the server process is still running.
    pub async fn is_alive(&self) -> bool {
        let mut process = self.process.lock().await;
        matches!(process.try_wait(), Ok(None))
    }

    /// Describe how the child exited, if it has.
    async fn exit_description(&self) -> Option<String> {
        let mut process = self.process.lock().await;
        match process.try_wait() {
            Ok(Some(status)) => Some(format!("process exited with {status}")),
            _ => None,
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: &JsonRpcMessage) -> Result<(), McpError> {
        self.channel.send(message).await
    }

    async fn receive(&self) -> Result<JsonRpcMessage, McpError> {
        match self.channel.receive().await {
            Err(McpError::Transport { server, reason }) => {
                // Give the exit status a moment to become observable.
                tokio::time::sleep(Duration::from_millis(20)).await;
                let reason = match self.exit_description().await {
                    Some(exit) => format!("{reason} ({exit})"),
                    None => reason,
                };
                Err(McpError::Transport {
                    server,
                    reason: format!("{reason}{}", self.stderr.error_suffix()),
                })
            }
            other => other,
        }
    }

    /// Close stdin, wait for a graceful exit, then force-kill.
    async fn close(&self) -> Result<(), McpError> {
        self.channel.close_writer().await;

        let mut process = self.process.lock().await;
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, process.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(server = %self.server_name, %status, "tool server exited");
            }
            _ => {
                tracing::warn!(
                    server = %self.server_name,
                    "tool server did not exit after stdin closed; killing"
                );
                let _ = process.kill().await;
            }
        }
        drop(process);

        if let Some(task) = self.stderr_task.lock().await.take() {
            let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await;
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::types::{JsonRpcNotification, JsonRpcRequest};
    use tokio::io::{duplex, AsyncReadExt};

    fn channel_pair() -> (
        LineChannel<tokio::io::DuplexStream, tokio::io::DuplexStream>,
        tokio::io::DuplexStream,
        tokio::io::DuplexStream,
    ) {
        let (client_in, server_out) = duplex(4096);
        let (server_in, client_out) = duplex(4096);
        (LineChannel::new("test", client_in, client_out), server_out, server_in)
    }

    #[tokio::test]
    async fn test_send_writes_one_line_per_message() {
        let (channel, _server_out, mut server_in) = channel_pair();
        let msg = JsonRpcMessage::Request(JsonRpcRequest::new(1, "tools/list", None));
        channel.send(&msg).await.unwrap();
        channel.close().await.unwrap();

        let mut written = String::new();
        server_in.read_to_string(&mut written).await.unwrap();
        assert_eq!(written.lines().count(), 1);
        assert!(written.ends_with('\n'));
        assert!(written.contains("\"method\":\"tools/list\""));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_fatal() {
        let (channel, mut server_out, _server_in) = channel_pair();
        // The writer stalls once the reader gives up, so it is never joined.
        tokio::spawn(async move {
            let line = vec![b'a'; MAX_FRAME_BYTES + 16];
            let _ = server_out.write_all(&line).await;
            let _ = server_out.write_all(b"\n").await;
        });

        let err = channel.receive().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("exceeds"), "got {err}");
    }

    #[tokio::test]
    async fn test_frame_at_limit_is_accepted() {
        let (channel, mut server_out, _server_in) = channel_pair();
        let mut frame = br#"{"jsonrpc":"2.0","method":"notifications/message","params":{"data":""#.to_vec();
        let closing = br#""}}"#;
        let padding = MAX_FRAME_BYTES - frame.len() - closing.len() - 1;
        frame.extend(std::iter::repeat(b'x').take(padding));
        frame.extend_from_slice(closing);
        frame.push(b'\n');
        assert_eq!(frame.len(), MAX_FRAME_BYTES);
        tokio::spawn(async move {
            let _ = server_out.write_all(&frame).await;
        });

        let msg = channel.receive().await.unwrap();
        assert!(matches!(msg, JsonRpcMessage::Notification(_)));
    }

    #[tokio::test]
    async fn test_receive_skips_blank_lines() {
        let (channel, mut server_out, _server_in) = channel_pair();
        server_out
            .write_all(b"\n  \n{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n")
            .await
            .unwrap();

        let msg = channel.receive().await.unwrap();
        assert_eq!(
            msg,
            JsonRpcMessage::Notification(JsonRpcNotification::new(
                "notifications/initialized",
                None
            ))
        );
    }

    #[tokio::test]
    async fn test_stray_stdout_text_is_fatal() {
        let (channel, mut server_out, _server_in) = channel_pair();
        server_out.write_all(b"Starting weather server...\n").await.unwrap();

        let err = channel.receive().await.unwrap_err();
        assert!(err.is_fatal(), "stray text must be a transport error: {err}");
        assert!(err.to_string().contains("malformed frame"));
    }

    #[tokio::test]
    async fn test_json_without_version_tag_is_fatal() {
        let (channel, mut server_out, _server_in) = channel_pair();
        server_out.write_all(b"{\"id\":1,\"result\":{}}\n").await.unwrap();

        let err = channel.receive().await.unwrap_err();
        assert!(matches!(err, McpError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_shapeless_frame_is_protocol_error() {
        let (channel, mut server_out, _server_in) = channel_pair();
        server_out
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":4}\n{\"jsonrpc\":\"2.0\",\"id\":5,\"result\":{}}\n")
            .await
            .unwrap();

        let err = channel.receive().await.unwrap_err();
        assert!(matches!(err, McpError::Protocol { .. }));
        // The stream is still usable afterwards.
        let next = channel.receive().await.unwrap();
        assert!(matches!(next, JsonRpcMessage::Response(_)));
    }

    #[tokio::test]
    async fn test_eof_is_transport_error() {
        let (channel, server_out, _server_in) = channel_pair();
        drop(server_out);
        let err = channel.receive().await.unwrap_err();
        assert!(err.to_string().contains("stdout closed"));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (channel, _server_out, _server_in) = channel_pair();
        channel.close().await.unwrap();
        let msg = JsonRpcMessage::Notification(JsonRpcNotification::new("ping", None));
        let err = channel.send(&msg).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let tail = StderrTail::default();
        for i in 0..(STDERR_TAIL_LINES + 5) {
            tail.push(format!("line {i}"));
        }
        let snapshot = tail.snapshot();
        assert!(!snapshot.contains("line 0\n"));
        assert!(snapshot.ends_with(&format!("line {}", STDERR_TAIL_LINES + 4)));
        assert!(tail.error_suffix().starts_with(" | stderr: "));
    }

    #[test]
    fn test_empty_stderr_suffix() {
        assert_eq!(StderrTail::default().error_suffix(), "");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_missing_command_fails() {
        let config = ServerConfig {
            name: "ghost".into(),
            command: "/definitely/not/a/real/binary".into(),
            args: vec![],
            env: Default::default(),
            cwd: None,
        };
        let err = StdioTransport::spawn(&config).err().expect("spawn should fail");
        assert!(matches!(err, McpError::SpawnFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_receive_reports_exit_and_stderr() {
        let config = ServerConfig {
            name: "crashy".into(),
            command: "sh".into(),
            args: vec!["-c".into(), "echo boom >&2; exit 3".into()],
            env: Default::default(),
            cwd: None,
        };
        let transport = StdioTransport::spawn(&config).unwrap();
        let err = transport.receive().await.unwrap_err();
        assert!(err.is_fatal());
        transport.close().await.unwrap();
        assert!(!transport.is_alive().await);
    }
}

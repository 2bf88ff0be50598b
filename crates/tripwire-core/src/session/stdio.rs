//! Newline-delimited JSON-RPC over a child process.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use super::{is_response_to, RpcChannel};
use crate::error::{CoreError, Result};

/// Captured output kept per server.
const MAX_CAPTURE: usize = 16 * 1024;

/// Grace period for a server to exit after stdin closes.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Bounded buffer of text a server wrote outside the protocol.
#[derive(Debug, Clone, Default)]
pub(crate) struct Capture(Arc<Mutex<String>>);

impl Capture {
    pub(crate) fn push(&self, text: &str) {
        if let Ok(mut buf) = self.0.lock() {
            let room = MAX_CAPTURE.saturating_sub(buf.len());
            if room == 0 {
                return;
            }
            let mut end = text.len().min(room);
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            buf.push_str(&text[..end]);
        }
    }

    pub(crate) fn contents(&self) -> Option<String> {
        let buf = self.0.lock().ok()?;
        let trimmed = buf.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

pub(crate) struct StdioChannel {
    server: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    capture: Capture,
}

impl StdioChannel {
    /// Spawns the server. With `suppress_io` its stderr is captured,
    /// otherwise inherited.
    pub(crate) fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        suppress_io: bool,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if suppress_io {
                Stdio::piped()
            } else {
                Stdio::inherit()
            })
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| CoreError::connect(server, format!("failed to start '{command}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CoreError::connect(server, "no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::connect(server, "no stdout"))?;

        let capture = Capture::default();
        if let Some(mut stderr) = child.stderr.take() {
            let sink = capture.clone();
            tokio::spawn(async move {
                let mut chunk = [0u8; 4096];
                loop {
                    match stderr.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => sink.push(&String::from_utf8_lossy(&chunk[..n])),
                    }
                }
            });
        }

        debug!(server, command, ?args, "spawned server");
        Ok(Self {
            server: server.to_string(),
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            capture,
        })
    }

    async fn write_message(&mut self, message: &Value) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| CoreError::protocol(&self.server, "stdin already closed"))?;
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| CoreError::protocol(&self.server, format!("write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| CoreError::protocol(&self.server, format!("write failed: {e}")))?;
        Ok(())
    }

    fn closed_error(&self) -> CoreError {
        let mut reason = "server closed its output".to_string();
        if let Some(diag) = self.capture.contents() {
            reason.push_str(":\n");
            reason.push_str(&diag);
        }
        CoreError::protocol(&self.server, reason)
    }
}

#[async_trait]
impl RpcChannel for StdioChannel {
    async fn request(&mut self, id: u64, message: Value) -> Result<Value> {
        self.write_message(&message).await?;

        let mut line = String::new();
        loop {
            line.clear();
            let read = self.stdout.read_line(&mut line).await?;
            if read == 0 {
                return Err(self.closed_error());
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let incoming: Value = match serde_json::from_str(trimmed) {
                Ok(v) => v,
                Err(_) => {
                    // Some servers log to stdout.
                    self.capture.push(trimmed);
                    self.capture.push("\n");
                    continue;
                }
            };

            if is_response_to(&incoming, id) {
                return Ok(incoming);
            }

            if let (Some(method), Some(req_id)) = (
                incoming.get("method").and_then(Value::as_str),
                incoming.get("id").cloned(),
            ) {
                let reply = if method == "ping" {
                    json!({"jsonrpc": "2.0", "id": req_id, "result": {}})
                } else {
                    json!({"jsonrpc": "2.0", "id": req_id,
                           "error": {"code": super::METHOD_NOT_FOUND, "message": "not supported by scanner"}})
                };
                self.write_message(&reply).await?;
            }
        }
    }

    async fn notify(&mut self, message: Value) -> Result<()> {
        self.write_message(&message).await
    }

    fn diagnostics(&self) -> Option<String> {
        self.capture.contents()
    }

    async fn shutdown(&mut self) -> Result<()> {
        drop(self.stdin.take());
        match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!(server = %self.server, %status, "server exited"),
            Ok(Err(e)) => warn!(server = %self.server, error = %e, "wait failed"),
            Err(_) => {
                debug!(server = %self.server, "server did not exit, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(server = %self.server, error = %e, "kill failed");
                }
            }
        }
        Ok(())
    }
}

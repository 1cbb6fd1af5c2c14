//! Ephemeral server process lifecycle.
//!
//! Every call attempt against an ephemeral server gets its own child process:
//! spawn, `initialize` handshake, exactly one `tools/call`, shutdown. The
//! process is torn down on every exit path, including timeouts; a process
//! that outlives its handle is killed on drop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout_at;

use super::errors::McpError;
use super::registry::EphemeralConfig;
use super::reliability::Attempt;
use super::transport::{extract_result, tool_result, StdioTransport};
use super::types::{initialize_params, InitializeResult};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Time a server gets to exit after its stdin is closed before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Time allowed for stderr to drain after a failed handshake.
const STDERR_DRAIN_WAIT: Duration = Duration::from_millis(500);

/// Stderr kept per process (the most recent bytes).
const MAX_STDERR_BYTES: usize = 2000;

// ─── EphemeralProcess ────────────────────────────────────────────────────────

/// One running child process for one call attempt.
pub struct EphemeralProcess {
    server_id: String,
    child: Child,
    transport: StdioTransport,
    stderr_tail: Arc<Mutex<String>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl EphemeralProcess {
    /// Spawn the server with piped stdio and the resolved environment.
    pub fn spawn(
        server_id: &str,
        config: &EphemeralConfig,
        env: &HashMap<String, String>,
    ) -> Result<Self, McpError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        cmd.envs(env);
        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: server_id.to_string(),
            reason: format!("{} {}: {e}", config.command, config.args.join(" ")),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: server_id.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: server_id.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr_tail = Arc::new(Mutex::new(String::new()));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(stderr, stderr_tail.clone())));

        tracing::debug!(server = server_id, pid = ?child.id(), "spawned server process");

        Ok(Self {
            server_id: server_id.to_string(),
            child,
            transport: StdioTransport::new(server_id, stdin, stdout),
            stderr_tail,
            stderr_task,
        })
    }

    /// OS process id, while the process is running.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Perform the MCP initialization handshake.
    ///
    /// Failures carry the tail of the server's stderr.
    pub async fn initialize(&mut self) -> Result<InitializeResult, McpError> {
        match self.handshake().await {
            Ok(result) => Ok(result),
            Err(e) => {
                let stderr = self.stderr_snapshot(STDERR_DRAIN_WAIT).await;
                if !stderr.is_empty() {
                    tracing::warn!(
                        server = %self.server_id,
                        stderr = %stderr,
                        "server stderr captured on failure"
                    );
                }
                let reason = match e {
                    McpError::ServerError { message, .. } => message,
                    McpError::TransportError { reason, .. } => reason,
                    other => other.to_string(),
                };
                Err(McpError::InitFailed {
                    name: self.server_id.clone(),
                    reason: format!("{reason}{}", format_stderr_suffix(&stderr)),
                })
            }
        }
    }

    async fn handshake(&self) -> Result<InitializeResult, McpError> {
        let response = self
            .transport
            .request("initialize", Some(initialize_params(None)))
            .await?;
        let result = extract_result(response)?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::TransportError {
                server: self.server_id.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;
        self.transport
            .notify("notifications/initialized", None)
            .await?;
        Ok(init)
    }

    /// Send one `tools/call` and return its result.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let response = self
            .transport
            .request(
                "tools/call",
                Some(serde_json::json!({ "name": tool, "arguments": arguments })),
            )
            .await?;
        tool_result(&self.server_id, tool, extract_result(response)?)
    }

    /// Close stdin, give the process a moment to exit, then kill it.
    ///
    /// Always reaps the child.
    pub async fn shutdown(mut self) {
        self.transport.close_stdin().await;

        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.server_id, %status, "server exited");
            }
            _ => {
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(server = %self.server_id, error = %e, "failed to kill server");
                } else {
                    tracing::debug!(server = %self.server_id, "server killed after grace period");
                }
            }
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }

    /// Current stderr tail, waiting up to `wait` for the stream to end.
    async fn stderr_snapshot(&mut self, wait: Duration) -> String {
        if let Some(task) = self.stderr_task.as_mut() {
            let _ = tokio::time::timeout(wait, task).await;
        }
        self.stderr_tail
            .lock()
            .map(|tail| tail.trim().to_string())
            .unwrap_or_default()
    }
}

/// Keep the most recent stderr output of a child.
async fn drain_stderr(mut stderr: ChildStderr, tail: Arc<Mutex<String>>) {
    let mut buf = [0u8; 1024];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]);
                if let Ok(mut tail) = tail.lock() {
                    tail.push_str(&chunk);
                    keep_tail(&mut tail, MAX_STDERR_BYTES);
                }
            }
        }
    }
}

/// Drop leading bytes so that at most `max_bytes` remain, on a char boundary.
fn keep_tail(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut cut = s.len() - max_bytes;
    while !s.is_char_boundary(cut) {
        cut += 1;
    }
    s.drain(..cut);
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {stderr}")
    }
}

// ─── One-shot call ───────────────────────────────────────────────────────────

/// Spawn, initialize, call one tool and shut down, all within the attempt's
/// deadline. The process is shut down whatever the outcome.
pub async fn run_once(
    server_id: &str,
    config: &EphemeralConfig,
    env: &HashMap<String, String>,
    tool: &str,
    arguments: serde_json::Value,
    attempt: &Attempt,
) -> Result<serde_json::Value, McpError> {
    let mut process = EphemeralProcess::spawn(server_id, config, env)?;

    let outcome = timeout_at(attempt.deadline, async {
        process.initialize().await?;
        process.call_tool(tool, arguments).await
    })
    .await;

    process.shutdown().await;

    match outcome {
        Ok(result) => result,
        Err(_) => Err(McpError::Timeout {
            tool: format!("{server_id}.{tool}"),
            timeout_ms: attempt.timeout_ms(),
        }),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

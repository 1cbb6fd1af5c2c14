//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with ephemeral server child processes:
//! - Writing JSON-RPC requests to stdin
//! - Reading JSON-RPC responses from stdout
//! - Line-delimited JSON protocol (one JSON object per line)
//!
//! Also holds the response helpers shared with the HTTP session transport.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::types::{error_codes, JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_id: String,
    /// `None` once stdin has been closed for shutdown.
    writer: Mutex<Option<ChildStdin>>,
    reader: Mutex<BufReader<ChildStdout>>,
}

impl StdioTransport {
    /// Create a new transport from a child process's stdin/stdout.
    pub fn new(server_id: &str, stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self {
            server_id: server_id.to_string(),
            writer: Mutex::new(Some(stdin)),
            reader: Mutex::new(BufReader::new(stdout)),
        }
    }

    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// Write one line of JSON, then read lines until one parses as a
    /// response with the same `id`. Anything else on stdout is skipped.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);

        let mut json = serde_json::to_string(&req).map_err(|e| self.error(format!(
            "failed to serialize request: {e}"
        )))?;
        json.push('\n');
        self.write_line(&json).await?;

        let mut line_buf = String::new();
        let mut reader = self.reader.lock().await;

        loop {
            line_buf.clear();
            let bytes_read = reader
                .read_line(&mut line_buf)
                .await
                .map_err(|e| self.error(format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                return Err(self.error(
                    "server stdout closed (process may have exited)".to_string(),
                ));
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == Some(id) => return Ok(resp),
                Ok(resp) => {
                    tracing::trace!(server = %self.server_id, id = ?resp.id, "skipping response for another request");
                }
                Err(_) => {
                    // Server log output or a server-initiated request.
                    tracing::trace!(server = %self.server_id, line = trimmed, "skipping non-response line");
                }
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let (Some(params), Some(map)) = (params, notification.as_object_mut()) {
            map.insert("params".to_string(), params);
        }

        let mut json = serde_json::to_string(&notification)
            .map_err(|e| self.error(format!("failed to serialize notification: {e}")))?;
        json.push('\n');
        self.write_line(&json).await
    }

    /// Close the child's stdin, signalling end of input.
    pub async fn close_stdin(&self) {
        let mut writer = self.writer.lock().await;
        if let Some(mut stdin) = writer.take() {
            let _ = stdin.shutdown().await;
        }
    }

    async fn write_line(&self, line: &str) -> Result<(), McpError> {
        let mut writer = self.writer.lock().await;
        let stdin = writer
            .as_mut()
            .ok_or_else(|| self.error("stdin already closed".to_string()))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.error(format!("failed to write to stdin: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| self.error(format!("failed to flush stdin: {e}")))
    }

    fn error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server_id.clone(),
            reason,
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

/// Turn a `tools/call` result flagged `isError` into [`McpError::ToolError`].
///
/// The message is the concatenated text content of the result.
pub fn tool_result(
    server: &str,
    tool: &str,
    result: serde_json::Value,
) -> Result<serde_json::Value, McpError> {
    let is_error = result
        .get("isError")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !is_error {
        return Ok(result);
    }

    let message = result
        .get("content")
        .and_then(|c| c.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "tool reported an error".to_string());

    Err(McpError::ToolError {
        server: server.to_string(),
        tool: tool.to_string(),
        message,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::types::JsonRpcError;
    use serde_json::json;

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[test]
    fn test_extract_result_success() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: Some(1),
            result: Some(json!({"text": "hello"})),
            error: None,
        };
        let result = extract_result(resp).unwrap();
        assert_eq!(result["text"], "hello");
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: Some(1),
            result: None,
            error: Some(JsonRpcError {
                code: error_codes::METHOD_NOT_FOUND,
                message: "Method not found".into(),
                data: None,
            }),
        };
        match extract_result(resp).unwrap_err() {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: Some(1),
            result: None,
            error: None,
        };
        let err = extract_result(resp).unwrap_err();
        assert!(matches!(err, McpError::ServerError { .. }));
    }

    #[test]
    fn test_tool_result_passes_success_through() {
        let value = json!({"content": [{"type": "text", "text": "ok"}]});
        assert_eq!(tool_result("s", "t", value.clone()).unwrap(), value);
    }

    #[test]
    fn test_tool_result_maps_is_error() {
        let value = json!({
            "isError": true,
            "content": [
                {"type": "text", "text": "repository not found"},
                {"type": "text", "text": "check the owner"}
            ]
        });
        match tool_result("github", "get_repo", value).unwrap_err() {
            McpError::ToolError { server, tool, message } => {
                assert_eq!(server, "github");
                assert_eq!(tool, "get_repo");
                assert_eq!(message, "repository not found\ncheck the owner");
            }
            other => panic!("expected ToolError, got {other:?}"),
        }
    }

    #[test]
    fn test_tool_result_error_without_text() {
        let err = tool_result("s", "t", json!({"isError": true})).unwrap_err();
        assert!(err.to_string().contains("tool reported an error"));
    }
}

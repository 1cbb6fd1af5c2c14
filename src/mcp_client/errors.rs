//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur while invoking a tool through the client.
#[derive(Debug, Error)]
pub enum McpError {
    /// The server identifier is not in the registry.
    #[error("unknown server: '{id}'")]
    UnknownServer {
        id: String,
    },

    /// Configuration error (bad registry entry, unreadable config file).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// JSON-RPC communication error (malformed message, I/O error).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Could not reach a persistent server.
    #[error("connection failed to '{server}' at {endpoint}: {reason}")]
    ConnectionFailed {
        server: String,
        endpoint: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The tool ran and reported a domain error (`isError: true`).
    #[error("tool '{tool}' on '{server}' failed: {message}")]
    ToolError {
        server: String,
        tool: String,
        message: String,
    },

    /// No such tool (raised by in-memory invokers).
    #[error("unknown tool: '{server}.{tool}'")]
    UnknownTool {
        server: String,
        tool: String,
    },

    /// A tool call attempt timed out.
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    Timeout {
        tool: String,
        timeout_ms: u64,
    },

    /// The call succeeded but the payload exceeds the configured limit.
    #[error("response from '{server}.{tool}' too large: {actual_bytes} bytes (max {max_bytes})")]
    ResponseTooLarge {
        server: String,
        tool: String,
        actual_bytes: usize,
        max_bytes: usize,
    },

    /// Every attempt failed with a retryable error.
    #[error("tool call failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<McpError>,
    },
}

impl McpError {
    /// Errors that are never retried, whatever the configured patterns say.
    ///
    /// Tool-level and JSON-RPC errors come from a server that executed the
    /// request; an oversized payload would be reproduced by a retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            McpError::UnknownServer { .. }
                | McpError::ConfigError { .. }
                | McpError::ServerError { .. }
                | McpError::ToolError { .. }
                | McpError::UnknownTool { .. }
                | McpError::ResponseTooLarge { .. }
                | McpError::RetriesExhausted { .. }
        )
    }

    /// Whether the failure happened below the protocol level, leaving any
    /// shared session in an unknown state.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            McpError::TransportError { .. }
                | McpError::ConnectionFailed { .. }
                | McpError::Timeout { .. }
                | McpError::InitFailed { .. }
        )
    }
}

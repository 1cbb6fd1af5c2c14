//! Invocation port — the seam callers depend on.
//!
//! Tool wrappers take an `Arc<dyn ToolInvoker>` instead of a concrete client,
//! so their tests can swap in [`StaticInvoker`] and never touch a transport.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::errors::McpError;
use super::types::{CallOptions, CallRequest};

/// Invoke a named tool on a named server.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        params: serde_json::Value,
        options: CallOptions,
    ) -> Result<serde_json::Value, McpError>;
}

// ─── StaticInvoker ───────────────────────────────────────────────────────────

enum Canned {
    Value(serde_json::Value),
    ToolError(String),
}

/// In-memory invoker with canned responses keyed by server and tool.
///
/// Records every call it receives. A call with no canned response fails
/// with [`McpError::UnknownTool`].
#[derive(Default)]
pub struct StaticInvoker {
    responses: HashMap<(String, String), Canned>,
    calls: Mutex<Vec<CallRequest>>,
}

impl StaticInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to `server.tool` with `value`.
    pub fn with_response(mut self, server: &str, tool: &str, value: serde_json::Value) -> Self {
        self.responses
            .insert((server.to_string(), tool.to_string()), Canned::Value(value));
        self
    }

    /// Make `server.tool` fail with a tool-level error.
    pub fn with_tool_error(mut self, server: &str, tool: &str, message: &str) -> Self {
        self.responses.insert(
            (server.to_string(), tool.to_string()),
            Canned::ToolError(message.to_string()),
        );
        self
    }

    /// Calls received so far, in order.
    pub fn calls(&self) -> Vec<CallRequest> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ToolInvoker for StaticInvoker {
    async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        params: serde_json::Value,
        options: CallOptions,
    ) -> Result<serde_json::Value, McpError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(CallRequest {
                server_id: server_id.to_string(),
                tool_name: tool_name.to_string(),
                params,
                options,
            });
        }

        match self
            .responses
            .get(&(server_id.to_string(), tool_name.to_string()))
        {
            Some(Canned::Value(value)) => Ok(value.clone()),
            Some(Canned::ToolError(message)) => Err(McpError::ToolError {
                server: server_id.to_string(),
                tool: tool_name.to_string(),
                message: message.clone(),
            }),
            None => Err(McpError::UnknownTool {
                server: server_id.to_string(),
                tool: tool_name.to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for StaticInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticInvoker")
            .field("responses", &self.responses.len())
            .finish_non_exhaustive()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures, and the per-call
//! request/options types handed to the invocation port.

use serde::{Deserialize, Serialize};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<u64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Protocol revision sent in the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Client name reported to servers.
pub const CLIENT_NAME: &str = "toolgate";

/// MCP initialize response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Build the `initialize` params for this client.
pub fn initialize_params(options: Option<serde_json::Value>) -> serde_json::Value {
    let mut params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    if let (Some(options), Some(map)) = (options, params.as_object_mut()) {
        map.insert("initializationOptions".to_string(), options);
    }
    params
}

// ─── Invocation ──────────────────────────────────────────────────────────────

/// Per-call overrides. Unset fields fall back to the server's defaults, then
/// to the client-wide defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallOptions {
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms_base: Option<u64>,
    pub retryable_error_patterns: Option<Vec<String>>,
    pub max_response_bytes: Option<usize>,
    /// Free-text description of the caller's intent. Only consumed by servers
    /// that declare scopes.
    pub semantic_context: Option<String>,
}

impl CallOptions {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_retry_delay_ms_base(mut self, base_ms: u64) -> Self {
        self.retry_delay_ms_base = Some(base_ms);
        self
    }

    pub fn with_retryable_error_patterns(mut self, patterns: Vec<String>) -> Self {
        self.retryable_error_patterns = Some(patterns);
        self
    }

    pub fn with_max_response_bytes(mut self, max_bytes: usize) -> Self {
        self.max_response_bytes = Some(max_bytes);
        self
    }

    pub fn with_semantic_context(mut self, context: impl Into<String>) -> Self {
        self.semantic_context = Some(context.into());
        self
    }
}

/// One tool invocation as seen by the invocation port.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRequest {
    pub server_id: String,
    pub tool_name: String,
    pub params: serde_json::Value,
    pub options: CallOptions,
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC / MCP error codes.
pub mod error_codes {
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.starts_with(r#"{"jsonrpc":"2.0","id":1,"#));
        assert!(json.contains("\"method\":\"initialize\""));
        // params should be omitted when None
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_json_rpc_response_without_id() {
        let json = r#"{"jsonrpc": "2.0", "result": {}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.id, None);
    }

    #[test]
    fn test_json_rpc_error_response() {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": 2,
            "result": null,
            "error": {"code": -32601, "message": "Method not found"}
        }"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_initialize_params_with_options() {
        let params = initialize_params(Some(serde_json::json!({"autoDetectWorkspace": false})));
        assert_eq!(params["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(params["clientInfo"]["name"], CLIENT_NAME);
        assert_eq!(params["initializationOptions"]["autoDetectWorkspace"], false);

        let bare = initialize_params(None);
        assert!(bare.get("initializationOptions").is_none());
    }

    #[test]
    fn test_call_options_builders() {
        let opts = CallOptions::default()
            .with_timeout_ms(500)
            .with_max_retries(1)
            .with_semantic_context("frontend");
        assert_eq!(opts.timeout_ms, Some(500));
        assert_eq!(opts.max_retries, Some(1));
        assert_eq!(opts.semantic_context.as_deref(), Some("frontend"));
        assert_eq!(opts.max_response_bytes, None);
    }
}

//! HTTP session transport for persistent servers.
//!
//! A persistent server is a long-lived process reached over MCP's streamable
//! HTTP transport: every JSON-RPC message is a `POST` to one endpoint, the
//! server hands out an `Mcp-Session-Id` on `initialize`, and the client
//! echoes it on every later request. Responses arrive either as plain JSON or
//! as a short `text/event-stream` carrying the response in `data:` lines.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;

use super::audit::truncate_utf8;
use super::errors::McpError;
use super::factory::{SessionConnection, SessionConnector};
use super::registry::{PersistentConfig, ServerDescriptor};
use super::transport::{extract_result, next_request_id, tool_result};
use super::types::{initialize_params, InitializeResult, JsonRpcRequest, JsonRpcResponse};
use crate::config::{env_flag, DISABLE_AUTO_DETECT_ENV};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Header carrying the server-assigned session id.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest response body quoted in an HTTP error.
const MAX_ERROR_BODY_BYTES: usize = 500;

// ─── Connector ───────────────────────────────────────────────────────────────

/// Opens HTTP sessions to persistent servers.
#[derive(Debug, Clone)]
pub struct HttpSessionConnector {
    http: reqwest::Client,
    disable_auto_detect: bool,
}

impl HttpSessionConnector {
    pub fn new(disable_auto_detect: bool) -> Result<Self, McpError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| McpError::ConfigError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            disable_auto_detect,
        })
    }

    /// Reads `TOOLGATE_DISABLE_AUTO_DETECT`.
    pub fn from_env() -> Result<Self, McpError> {
        Self::new(env_flag(DISABLE_AUTO_DETECT_ENV))
    }

    fn initialization_options(&self) -> Option<serde_json::Value> {
        self.disable_auto_detect
            .then(|| serde_json::json!({ "autoDetectWorkspace": false }))
    }
}

#[async_trait]
impl SessionConnector for HttpSessionConnector {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        config: &PersistentConfig,
        env: &HashMap<String, String>,
    ) -> Result<Arc<dyn SessionConnection>, McpError> {
        let bearer = config
            .bearer_env
            .as_ref()
            .and_then(|name| env.get(name))
            .cloned();

        let session = HttpSession {
            server_id: descriptor.id.clone(),
            url: config.url.clone(),
            http: self.http.clone(),
            bearer,
            session_id: Mutex::new(None),
        };

        let init = session.initialize(self.initialization_options()).await?;
        tracing::info!(
            server = %descriptor.id,
            url = %config.url,
            protocol = ?init.protocol_version,
            session = ?session.session_id(),
            "persistent session established"
        );
        Ok(Arc::new(session))
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// One initialized session with a persistent server.
#[derive(Debug)]
pub struct HttpSession {
    server_id: String,
    url: String,
    http: reqwest::Client,
    bearer: Option<String>,
    session_id: Mutex<Option<String>>,
}

impl HttpSession {
    /// Server-assigned session id, once known.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|id| id.clone())
    }

    async fn initialize(
        &self,
        options: Option<serde_json::Value>,
    ) -> Result<InitializeResult, McpError> {
        let response = self
            .request("initialize", Some(initialize_params(options)))
            .await
            .map_err(|e| self.init_failed(e))?;
        let result = extract_result(response).map_err(|e| self.init_failed(e))?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::InitFailed {
                name: self.server_id.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;
        self.notify("notifications/initialized").await?;
        Ok(init)
    }

    // Connection failures stay as they are so they remain classifiable.
    fn init_failed(&self, e: McpError) -> McpError {
        match e {
            McpError::ConnectionFailed { .. } => e,
            other => McpError::InitFailed {
                name: self.server_id.clone(),
                reason: other.to_string(),
            },
        }
    }

    /// Send a request and wait for its response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let body = serde_json::to_value(JsonRpcRequest::new(id, method, params)).map_err(|e| {
            self.error(format!("failed to serialize request: {e}"))
        })?;

        let response = self.post(&body).await?;
        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let text = response
            .text()
            .await
            .map_err(|e| self.error(format!("failed to read response body: {e}")))?;

        let parsed = if is_sse {
            parse_sse_response(&text, id)
        } else {
            serde_json::from_str::<JsonRpcResponse>(&text).ok()
        };

        match parsed {
            Some(resp) if resp.id.is_none() || resp.id == Some(id) => Ok(resp),
            Some(resp) => Err(self.error(format!(
                "response id {:?} does not match request id {id}",
                resp.id
            ))),
            None => Err(self.error(format!(
                "invalid JSON-RPC response: {}",
                truncate_utf8(&text, MAX_ERROR_BODY_BYTES)
            ))),
        }
    }

    /// Send a notification; any 2xx counts as accepted.
    pub async fn notify(&self, method: &str) -> Result<(), McpError> {
        let body = serde_json::json!({ "jsonrpc": "2.0", "method": method });
        self.post(&body).await.map(|_| ())
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, McpError> {
        let mut request = self
            .http
            .post(&self.url)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session_id) = self.session_id() {
            request = request.header(SESSION_HEADER, session_id);
        }
        if let Some(token) = &self.bearer {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request.send().await.map_err(|e| self.send_error(e))?;

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut current) = self.session_id.lock() {
                if current.as_deref() != Some(session_id) {
                    *current = Some(session_id.to_string());
                }
            }
        }

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let body = truncate_utf8(body.trim(), MAX_ERROR_BODY_BYTES);
        if status == StatusCode::NOT_FOUND && self.session_id().is_some() {
            return Err(self.error(format!("session expired (HTTP {})", status.as_u16())));
        }
        Err(self.error(format!("HTTP {}: {body}", status.as_u16())))
    }

    fn send_error(&self, e: reqwest::Error) -> McpError {
        if e.is_connect() {
            McpError::ConnectionFailed {
                server: self.server_id.clone(),
                endpoint: self.url.clone(),
                reason: format!("connection refused or unreachable: {e}"),
            }
        } else if e.is_timeout() {
            self.error(format!("request timed out: {e}"))
        } else {
            self.error(format!("request failed: {e}"))
        }
    }

    fn error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server_id.clone(),
            reason,
        }
    }
}

#[async_trait]
impl SessionConnection for HttpSession {
    async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let response = self
            .request(
                "tools/call",
                Some(serde_json::json!({ "name": tool, "arguments": arguments })),
            )
            .await?;
        tool_result(&self.server_id, tool, extract_result(response)?)
    }
}

// ─── SSE ─────────────────────────────────────────────────────────────────────

/// Find the JSON-RPC response with `id` in an event-stream body.
///
/// Events are separated by blank lines; multi-line `data:` fields are joined
/// with newlines. Events that are not responses are skipped.
pub fn parse_sse_response(body: &str, id: u64) -> Option<JsonRpcResponse> {
    let mut data = String::new();
    let mut fallback = None;

    let mut check = |data: &mut String| -> Option<JsonRpcResponse> {
        if data.is_empty() {
            return None;
        }
        let parsed = serde_json::from_str::<JsonRpcResponse>(data).ok();
        data.clear();
        match parsed {
            Some(resp) if resp.id == Some(id) => Some(resp),
            Some(resp) => {
                let answers = resp.result.is_some() || resp.error.is_some();
                if resp.id.is_none() && answers && fallback.is_none() {
                    fallback = Some(resp);
                }
                None
            }
            None => None,
        }
    };

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            if let Some(resp) = check(&mut data) {
                return Some(resp);
            }
        } else if let Some(value) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(value.strip_prefix(' ').unwrap_or(value));
        }
    }
    if let Some(resp) = check(&mut data) {
        return Some(resp);
    }
    fallback
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    /// Answers like a minimal MCP server: echoes request ids, hands out a
    /// session id, acknowledges notifications with 202.
    struct McpResponder {
        sse: bool,
    }

    impl Respond for McpResponder {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body: Value = serde_json::from_slice(&request.body).unwrap();
            let Some(id) = body.get("id").cloned() else {
                return ResponseTemplate::new(202);
            };
            let result = match body["method"].as_str() {
                Some("initialize") => json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "serverInfo": {"name": "code-intel", "version": "0.1"}
                }),
                _ => json!({
                    "content": [{"type": "text", "text": format!("called {}", body["params"]["name"].as_str().unwrap_or(""))}]
                }),
            };
            let message = json!({"jsonrpc": "2.0", "id": id, "result": result});
            let template = ResponseTemplate::new(200).insert_header(SESSION_HEADER, "sess-42");
            if self.sse {
                template.set_body_raw(
                    format!("event: message\ndata: {message}\n\n"),
                    "text/event-stream",
                )
            } else {
                template.set_body_json(message)
            }
        }
    }

    fn descriptor(url: &str) -> (ServerDescriptor, PersistentConfig) {
        let descriptor = ServerDescriptor::persistent("code", url);
        let config = match &descriptor.transport {
            crate::mcp_client::registry::TransportKind::Persistent(c) => c.clone(),
            _ => unreachable!(),
        };
        (descriptor, config)
    }

    #[tokio::test]
    async fn test_connect_and_call_reuses_session_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(McpResponder { sse: false })
            .mount(&server)
            .await;

        let (desc, config) = descriptor(&format!("{}/mcp", server.uri()));
        let connector = HttpSessionConnector::new(false).unwrap();
        let session = connector.connect(&desc, &config, &HashMap::new()).await.unwrap();

        let result = session
            .call_tool("find_symbol", json!({"name": "main"}))
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "called find_symbol");

        let requests = server.received_requests().await.unwrap();
        // initialize, notifications/initialized, tools/call
        assert_eq!(requests.len(), 3);
        assert!(requests[0].headers.get("mcp-session-id").is_none());
        let last = requests.last().unwrap();
        assert_eq!(
            last.headers.get("mcp-session-id").unwrap().to_str().unwrap(),
            "sess-42"
        );
    }

    #[tokio::test]
    async fn test_disable_auto_detect_sends_initialization_options() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "initialize",
                "params": {"initializationOptions": {"autoDetectWorkspace": false}}
            })))
            .respond_with(McpResponder { sse: false })
            .expect(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(McpResponder { sse: false })
            .mount(&server)
            .await;

        let (desc, config) = descriptor(&server.uri());
        let connector = HttpSessionConnector::new(true).unwrap();
        connector.connect(&desc, &config, &HashMap::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_sse_framed_responses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(McpResponder { sse: true })
            .mount(&server)
            .await;

        let (desc, config) = descriptor(&server.uri());
        let connector = HttpSessionConnector::new(false).unwrap();
        let session = connector.connect(&desc, &config, &HashMap::new()).await.unwrap();
        let result = session.call_tool("overview", json!({})).await.unwrap();
        assert_eq!(result["content"][0]["text"], "called overview");
    }

    #[tokio::test]
    async fn test_bearer_token_from_env() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(McpResponder { sse: false })
            .mount(&server)
            .await;

        let (desc, mut config) = descriptor(&server.uri());
        config.bearer_env = Some("CODE_TOKEN".into());
        let env = HashMap::from([("CODE_TOKEN".to_string(), "s3cret".to_string())]);
        HttpSessionConnector::new(false)
            .unwrap()
            .connect(&desc, &config, &env)
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(
            requests[0].headers.get("authorization").unwrap().to_str().unwrap(),
            "Bearer s3cret"
        );
    }

    #[tokio::test]
    async fn test_http_error_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("warming up"))
            .mount(&server)
            .await;

        let (desc, config) = descriptor(&server.uri());
        let err = HttpSessionConnector::new(false)
            .unwrap()
            .connect(&desc, &config, &HashMap::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::InitFailed { .. }));
        assert!(err.to_string().contains("HTTP 503: warming up"), "{err}");
    }

    #[tokio::test]
    async fn test_json_rpc_error_is_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/call"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "error": {"code": -32602, "message": "unknown tool"}
            })))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(McpResponder { sse: false })
            .mount(&server)
            .await;

        let (desc, config) = descriptor(&server.uri());
        let session = HttpSessionConnector::new(false)
            .unwrap()
            .connect(&desc, &config, &HashMap::new())
            .await
            .unwrap();
        let err = session.call_tool("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::ServerError { code: -32602, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connection_failed() {
        let (desc, config) = descriptor("http://127.0.0.1:1/mcp");
        let err = HttpSessionConnector::new(false)
            .unwrap()
            .connect(&desc, &config, &HashMap::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::ConnectionFailed { .. }), "{err:?}");
    }

    #[test]
    fn test_parse_sse_picks_matching_id() {
        let body = "event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\
                    \n\
                    event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":7,\n\
                    data: \"result\":{\"ok\":true}}\n\
                    \n";
        let resp = parse_sse_response(body, 7).unwrap();
        assert_eq!(resp.id, Some(7));
        assert_eq!(resp.result.unwrap()["ok"], true);
    }

    #[test]
    fn test_parse_sse_without_trailing_blank_line() {
        let body = "data: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{}}";
        assert_eq!(parse_sse_response(body, 3).unwrap().id, Some(3));
        assert!(parse_sse_response("data: not json\n\n", 3).is_none());
    }
}

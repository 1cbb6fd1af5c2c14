//! MCP Client — the real invocation port.
//!
//! Composes the pieces of one tool call:
//! 1. Look up the server descriptor and resolve its environment
//! 2. Route to a scope (routing-capable servers only)
//! 3. Per attempt: acquire a transport, run the round-trip, release it,
//!    all under the reliability executor
//! 4. Check the response size
//! 5. Audit the outcome and return it

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::Instrument;
use uuid::Uuid;

use super::audit::{AuditEntry, AuditLogger};
use super::credentials::{default_store, ConfigResolver, CredentialStore};
use super::errors::McpError;
use super::factory::{ProcessLauncher, SessionConnector, StdioLauncher, TransportFactory};
use super::governor;
use super::invoker::ToolInvoker;
use super::registry::ServerRegistry;
use super::reliability::{self, RetryPolicy};
use super::router::{RoutingDecision, SemanticRouter};
use super::session::HttpSessionConnector;
use super::types::CallOptions;
use crate::config::{find_config_path, load_config, ClientDefaults};

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Invokes tools on registered servers.
pub struct McpClient {
    resolver: ConfigResolver,
    router: SemanticRouter,
    factory: TransportFactory,
    audit: AuditLogger,
    defaults: ClientDefaults,
}

impl McpClient {
    pub fn builder() -> McpClientBuilder {
        McpClientBuilder::default()
    }

    /// Client for the current process: built-in servers, the config file
    /// found from `start_dir` (if any), env-based credentials and flags.
    pub fn from_env(start_dir: &Path) -> Result<Self, McpError> {
        let mut builder = Self::builder();
        if let Some(path) = find_config_path(start_dir) {
            tracing::info!(path = %path.display(), "loading config");
            let config = load_config(&path)?;
            let mut registry = ServerRegistry::builtin()?;
            registry.merge(ServerRegistry::from_servers(config.servers)?);
            builder = builder.with_registry(registry).with_defaults(config.defaults);
        }
        builder.build()
    }

    pub fn registry(&self) -> &ServerRegistry {
        self.resolver.registry()
    }

    pub fn defaults(&self) -> &ClientDefaults {
        &self.defaults
    }

    /// Route without calling, e.g. to preview a decision.
    pub fn route(&self, server_id: &str, context: &str) -> RoutingDecision {
        self.router.route(server_id, context)
    }

    /// The most recent routing decision made by this client.
    pub fn last_routing_decision(&self) -> Option<RoutingDecision> {
        self.router.last_decision()
    }

    /// Scope a persistent server is currently narrowed to.
    pub async fn active_scope(&self, server_id: &str) -> Option<String> {
        self.factory.active_scope(server_id).await
    }

    async fn invoke(
        &self,
        server_id: &str,
        tool_name: &str,
        params: serde_json::Value,
        options: CallOptions,
    ) -> Result<serde_json::Value, McpError> {
        let descriptor = match self.resolver.resolve(server_id) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                tracing::warn!(error = %e, "tool call rejected");
                self.audit
                    .record(AuditEntry::call_error(server_id, tool_name, 0, &e.to_string()));
                return Err(e);
            }
        };
        let env = self.resolver.resolve_env(descriptor);

        let decision = descriptor.supports_routing().then(|| {
            self.router
                .route(server_id, options.semantic_context.as_deref().unwrap_or(""))
        });
        if let Some(decision) = &decision {
            tracing::debug!(
                scope = %decision.selected_scope_path,
                routed = decision.was_routed,
                "routing decision"
            );
        }

        let policy = RetryPolicy::resolve(&options, descriptor, &self.defaults);
        let max_bytes = options
            .max_response_bytes
            .or(descriptor.max_response_bytes)
            .unwrap_or(self.defaults.max_response_bytes);
        let label = format!("{server_id}.{tool_name}");
        let start = Instant::now();

        let result = reliability::execute(&policy, &label, |attempt| {
            let env = &env;
            let decision = decision.as_ref();
            let params = params.clone();
            async move {
                self.audit
                    .record(AuditEntry::call_start(server_id, tool_name));
                let handle = self
                    .factory
                    .acquire(descriptor, env, decision, &attempt)
                    .await?;
                tracing::debug!(attempt = attempt.number, transport = handle.kind(), "attempt started");
                let outcome = handle.round_trip(tool_name, params, &attempt).await;
                handle.release(&outcome).await;
                outcome
            }
        })
        .await
        .and_then(|value| governor::check(value, server_id, tool_name, max_bytes));

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => {
                tracing::info!(duration_ms = elapsed_ms, "tool call succeeded");
                self.audit
                    .record(AuditEntry::call_success(server_id, tool_name, elapsed_ms));
            }
            Err(e) => {
                tracing::warn!(duration_ms = elapsed_ms, error = %e, "tool call failed");
                self.audit.record(AuditEntry::call_error(
                    server_id,
                    tool_name,
                    elapsed_ms,
                    &e.to_string(),
                ));
            }
        }
        result
    }
}

#[async_trait]
impl ToolInvoker for McpClient {
    async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        params: serde_json::Value,
        options: CallOptions,
    ) -> Result<serde_json::Value, McpError> {
        let span = tracing::info_span!(
            "tool_call",
            call_id = %Uuid::new_v4(),
            server = server_id,
            tool = tool_name
        );
        self.invoke(server_id, tool_name, params, options)
            .instrument(span)
            .await
    }
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("servers", &self.registry().ids())
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

// ─── Builder ─────────────────────────────────────────────────────────────────

/// Assembles an [`McpClient`]. Unset parts fall back to the process defaults.
#[derive(Default)]
pub struct McpClientBuilder {
    registry: Option<ServerRegistry>,
    defaults: ClientDefaults,
    store: Option<Arc<dyn CredentialStore>>,
    audit: Option<AuditLogger>,
    launcher: Option<Arc<dyn ProcessLauncher>>,
    connector: Option<Arc<dyn SessionConnector>>,
}

impl McpClientBuilder {
    /// Defaults to the built-in registry.
    pub fn with_registry(mut self, registry: ServerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_defaults(mut self, defaults: ClientDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Defaults to [`default_store`].
    pub fn with_credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to [`AuditLogger::from_env`].
    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn SessionConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn build(self) -> Result<McpClient, McpError> {
        let registry = Arc::new(match self.registry {
            Some(registry) => registry,
            None => ServerRegistry::builtin()?,
        });
        let audit = self.audit.unwrap_or_else(AuditLogger::from_env);
        let store = self.store.unwrap_or_else(default_store);
        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(StdioLauncher));
        let connector: Arc<dyn SessionConnector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(HttpSessionConnector::from_env()?),
        };

        Ok(McpClient {
            resolver: ConfigResolver::new(registry.clone(), store, audit.clone()),
            router: SemanticRouter::new(registry),
            factory: TransportFactory::new(
                launcher,
                connector,
                self.defaults.serialize_session_calls,
            ),
            audit,
            defaults: self.defaults,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

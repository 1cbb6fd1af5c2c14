//! MCP Client — multi-transport tool invocation.
//!
//! This module handles:
//! - The static server registry and credential injection
//! - Semantic routing to a scope of a code-intelligence server
//! - Ephemeral stdio servers (one process per attempt) and persistent HTTP
//!   sessions (shared, scope-activated)
//! - Per-attempt timeouts, bounded retries with backoff
//! - Response size limits and the audit log
//!
//! Callers depend on [`ToolInvoker`]; [`McpClient`] is the real
//! implementation and [`StaticInvoker`] the in-memory double.

pub mod audit;
pub mod client;
pub mod credentials;
pub mod errors;
pub mod factory;
pub mod governor;
pub mod invoker;
pub mod lifecycle;
pub mod registry;
pub mod reliability;
pub mod router;
pub mod session;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use audit::{AuditEntry, AuditEventKind, AuditLogger, AuditSink, MemorySink, StderrSink};
pub use client::{McpClient, McpClientBuilder};
pub use credentials::{
    ConfigResolver, CredentialError, CredentialStore, EnvCredentialStore, JsonFileCredentialStore,
};
pub use errors::McpError;
pub use factory::{
    ActiveSessionState, ProcessLauncher, SessionConnection, SessionConnector, TransportFactory,
    TransportHandle,
};
pub use invoker::{StaticInvoker, ToolInvoker};
pub use registry::{AuthMode, EnvSource, ServerDescriptor, ServerRegistry, TransportKind};
pub use reliability::RetryPolicy;
pub use router::{RoutingDecision, ScopeDefinition, ScopeRegistry, SemanticRouter};
pub use types::{CallOptions, CallRequest};

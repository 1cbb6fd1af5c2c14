//! Server registry — the static table of known tool servers.
//!
//! Provides:
//! - Launch/connection descriptors keyed by server identifier
//! - The transport strategy of each server, fixed when the descriptor is built
//! - The env-var → credential mapping used by the config resolver
//!
//! The built-in table lives in `servers.yaml`; adding a server is a data-only
//! change there or in the user's config file.

use std::collections::BTreeMap;

use serde::Deserialize;

use super::errors::McpError;
use super::router::ScopeRegistry;
use crate::config::parse_config_str;

/// Built-in server table.
const BUILTIN_SERVERS: &str = include_str!("servers.yaml");

// ─── Descriptor Types ────────────────────────────────────────────────────────

/// Launch settings for a server spawned per call over stdio.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EphemeralConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the child process.
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Connection settings for a long-lived server reached over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PersistentConfig {
    pub url: String,
    /// Tool called to narrow the server to a scope.
    #[serde(default = "default_activation_tool")]
    pub activation_tool: String,
    /// Argument name carrying the scope path in the activation call.
    #[serde(default = "default_scope_argument")]
    pub scope_argument: String,
    /// Resolved env entry sent as a bearer token, if any.
    #[serde(default)]
    pub bearer_env: Option<String>,
}

fn default_activation_tool() -> String {
    "activate_project".to_string()
}

fn default_scope_argument() -> String {
    "project".to_string()
}

/// Transport strategy of a server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportKind {
    /// A fresh subprocess for every call attempt.
    Ephemeral(EphemeralConfig),
    /// One shared session, reused across calls.
    Persistent(PersistentConfig),
}

/// Where the value of an environment variable comes from.
///
/// Written as `{ credential: <key> }` or `{ literal: <value> }`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawEnvSource")]
pub enum EnvSource {
    /// Key in the credential store.
    Credential(String),
    /// Fixed value.
    Literal(String),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEnvSource {
    credential: Option<String>,
    literal: Option<String>,
}

impl TryFrom<RawEnvSource> for EnvSource {
    type Error = String;

    fn try_from(raw: RawEnvSource) -> Result<Self, Self::Error> {
        match (raw.credential, raw.literal) {
            (Some(key), None) => Ok(EnvSource::Credential(key)),
            (None, Some(value)) => Ok(EnvSource::Literal(value)),
            _ => Err("env entry needs exactly one of 'credential' or 'literal'".to_string()),
        }
    }
}

/// How a server authenticates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Secrets are injected from the credential store.
    #[default]
    Credentials,
    /// OS keychain, prior OAuth flow, or no auth at all.
    External,
}

/// Immutable description of one tool server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerDescriptor {
    /// Filled from the registry key.
    #[serde(skip)]
    pub id: String,
    pub transport: TransportKind,
    #[serde(default)]
    pub env: BTreeMap<String, EnvSource>,
    #[serde(default)]
    pub auth: AuthMode,
    /// Per-server default timeout (ms).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Per-server response size limit (bytes).
    #[serde(default)]
    pub max_response_bytes: Option<usize>,
    /// Sub-scopes for semantic routing. Only routing-capable servers set this.
    #[serde(default)]
    pub scopes: Option<ScopeRegistry>,
}

impl ServerDescriptor {
    /// Descriptor for a server spawned per call.
    pub fn ephemeral(id: &str, command: &str, args: &[&str]) -> Self {
        Self::with_transport(
            id,
            TransportKind::Ephemeral(EphemeralConfig {
                command: command.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                cwd: None,
            }),
        )
    }

    /// Descriptor for a long-lived HTTP server with default activation settings.
    pub fn persistent(id: &str, url: &str) -> Self {
        Self::with_transport(
            id,
            TransportKind::Persistent(PersistentConfig {
                url: url.to_string(),
                activation_tool: default_activation_tool(),
                scope_argument: default_scope_argument(),
                bearer_env: None,
            }),
        )
    }

    fn with_transport(id: &str, transport: TransportKind) -> Self {
        Self {
            id: id.to_string(),
            transport,
            env: BTreeMap::new(),
            auth: AuthMode::Credentials,
            timeout_ms: None,
            max_response_bytes: None,
            scopes: None,
        }
    }

    pub fn with_env(mut self, var: &str, source: EnvSource) -> Self {
        self.env.insert(var.to_string(), source);
        self
    }

    pub fn with_auth(mut self, auth: AuthMode) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_response_bytes(mut self, max_bytes: usize) -> Self {
        self.max_response_bytes = Some(max_bytes);
        self
    }

    pub fn with_scopes(mut self, scopes: ScopeRegistry) -> Self {
        self.scopes = Some(scopes);
        self
    }

    /// Whether calls to this server go through the semantic router.
    pub fn supports_routing(&self) -> bool {
        self.scopes.is_some()
    }

    /// Check the launch/connection settings.
    pub fn validate(&self) -> Result<(), McpError> {
        match &self.transport {
            TransportKind::Ephemeral(config) => {
                let command = config.command.trim();
                if command.is_empty() {
                    return Err(self.invalid("command is empty"));
                }
                // Flags and arguments belong in `args`.
                if command.contains(char::is_whitespace) {
                    return Err(self.invalid(&format!(
                        "command '{command}' contains whitespace; put arguments in 'args'"
                    )));
                }
            }
            TransportKind::Persistent(config) => {
                let url = config.url.trim();
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(self.invalid(&format!("url '{url}' must be http(s)")));
                }
                if config.activation_tool.trim().is_empty() {
                    return Err(self.invalid("activation_tool is empty"));
                }
            }
        }
        Ok(())
    }

    fn invalid(&self, reason: &str) -> McpError {
        McpError::ConfigError {
            reason: format!("server '{}': {reason}", self.id),
        }
    }
}

// ─── ServerRegistry ──────────────────────────────────────────────────────────

/// Static table of server descriptors.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: BTreeMap<String, ServerDescriptor>,
}

impl ServerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in server table.
    pub fn builtin() -> Result<Self, McpError> {
        let config = parse_config_str(BUILTIN_SERVERS)?;
        Self::from_servers(config.servers)
    }

    /// Build from a parsed `servers:` map, filling ids and validating entries.
    pub fn from_servers(servers: BTreeMap<String, ServerDescriptor>) -> Result<Self, McpError> {
        let mut registry = Self::new();
        for (id, mut descriptor) in servers {
            descriptor.id = id;
            registry.insert(descriptor)?;
        }
        Ok(registry)
    }

    /// Add or replace a descriptor.
    pub fn insert(&mut self, descriptor: ServerDescriptor) -> Result<(), McpError> {
        descriptor.validate()?;
        self.servers.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    /// Merge another registry into this one. Entries in `overrides` win.
    pub fn merge(&mut self, overrides: ServerRegistry) {
        for (id, descriptor) in overrides.servers {
            if self.servers.contains_key(&id) {
                tracing::debug!(server = %id, "config entry replaces built-in server");
            }
            self.servers.insert(id, descriptor);
        }
    }

    /// Look up a server by identifier.
    pub fn resolve(&self, id: &str) -> Result<&ServerDescriptor, McpError> {
        self.servers.get(id).ok_or_else(|| McpError::UnknownServer {
            id: id.to_string(),
        })
    }

    /// All server identifiers, sorted.
    pub fn ids(&self) -> Vec<&str> {
        self.servers.keys().map(|k| k.as_str()).collect()
    }

    /// All descriptors, sorted by identifier.
    pub fn descriptors(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.servers.values()
    }

    /// Number of registered servers.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_parses() {
        let registry = ServerRegistry::builtin().unwrap();
        assert!(registry.ids().contains(&"github"));

        let github = registry.resolve("github").unwrap();
        assert_eq!(github.id, "github");
        assert_eq!(github.auth, AuthMode::Credentials);
        assert_eq!(
            github.env.get("GITHUB_PERSONAL_ACCESS_TOKEN"),
            Some(&EnvSource::Credential("github.token".to_string()))
        );
        assert!(matches!(github.transport, TransportKind::Ephemeral(_)));

        let linear = registry.resolve("linear").unwrap();
        assert_eq!(linear.auth, AuthMode::External);
    }

    #[test]
    fn test_builtin_persistent_server() {
        let registry = ServerRegistry::builtin().unwrap();
        let serena = registry.resolve("serena").unwrap();
        assert!(serena.supports_routing());
        match &serena.transport {
            TransportKind::Persistent(config) => {
                assert_eq!(config.activation_tool, "activate_project");
                assert_eq!(config.scope_argument, "project");
                assert!(config.url.starts_with("http"));
            }
            other => panic!("expected persistent transport, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_unknown_server() {
        let registry = ServerRegistry::new();
        let err = registry.resolve("nope").unwrap_err();
        assert!(matches!(err, McpError::UnknownServer { ref id } if id == "nope"));
    }

    #[test]
    fn test_descriptor_from_yaml() {
        let config = parse_config_str(
            r#"
            servers:
              tracker:
                transport:
                  kind: ephemeral
                  command: node
                  args: [server.js]
                  cwd: /opt/tracker
                env:
                  TRACKER_TOKEN: { credential: tracker.apiKey }
                  TRACKER_MODE: { literal: readonly }
                timeout_ms: 5000
            "#,
        )
        .unwrap();
        let registry = ServerRegistry::from_servers(config.servers).unwrap();
        let tracker = registry.resolve("tracker").unwrap();
        assert_eq!(tracker.timeout_ms, Some(5000));
        assert_eq!(
            tracker.env.get("TRACKER_MODE"),
            Some(&EnvSource::Literal("readonly".to_string()))
        );
        match &tracker.transport {
            TransportKind::Ephemeral(cfg) => {
                assert_eq!(cfg.command, "node");
                assert_eq!(cfg.args, vec!["server.js"]);
                assert_eq!(cfg.cwd.as_deref(), Some("/opt/tracker"));
            }
            other => panic!("expected ephemeral transport, got {other:?}"),
        }
    }

    #[test]
    fn test_env_entry_needs_one_source() {
        let err = parse_config_str(
            r#"
            servers:
              broken:
                transport: { kind: ephemeral, command: node }
                env:
                  TOKEN: { credential: a, literal: b }
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn test_validate_rejects_command_with_args() {
        let descriptor = ServerDescriptor::ephemeral("bad", "npx -y thing", &[]);
        assert!(matches!(
            descriptor.validate(),
            Err(McpError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_non_http_url() {
        let descriptor = ServerDescriptor::persistent("bad", "ftp://host/mcp");
        let err = descriptor.validate().unwrap_err();
        assert!(err.to_string().contains("ftp://host/mcp"));
    }

    #[test]
    fn test_merge_overrides_win() {
        let mut base = ServerRegistry::new();
        base.insert(ServerDescriptor::ephemeral("a", "npx", &[])).unwrap();
        base.insert(ServerDescriptor::ephemeral("b", "npx", &[])).unwrap();

        let mut overrides = ServerRegistry::new();
        overrides
            .insert(ServerDescriptor::ephemeral("b", "node", &["b.js"]).with_timeout_ms(10))
            .unwrap();
        overrides
            .insert(ServerDescriptor::ephemeral("c", "python3", &[]))
            .unwrap();

        base.merge(overrides);
        assert_eq!(base.ids(), vec!["a", "b", "c"]);
        assert_eq!(base.resolve("b").unwrap().timeout_ms, Some(10));
    }
}

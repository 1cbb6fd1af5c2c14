//! Credential stores and the config resolver.
//!
//! The resolver turns a server descriptor's env mapping into the concrete
//! environment handed to the transport. Secrets come from a
//! [`CredentialStore`]; the store's own storage is out of the client's hands.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use super::audit::{AuditEntry, AuditLogger};
use super::errors::McpError;
use super::registry::{AuthMode, EnvSource, ServerDescriptor, ServerRegistry};
use crate::config::expand_tilde;

/// Env var naming a JSON credential file.
pub const CREDENTIALS_ENV: &str = "TOOLGATE_CREDENTIALS";

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Failures reading from a credential store.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to read credential file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("credential file {path} is not valid JSON: {reason}")]
    Parse { path: String, reason: String },

    #[error("credential '{key}' is not a string")]
    NotAString { key: String },
}

// ─── Stores ──────────────────────────────────────────────────────────────────

/// Read-only access to stored secrets.
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when the key is simply absent.
    fn lookup(&self, key: &str) -> Result<Option<String>, CredentialError>;
}

impl CredentialStore for HashMap<String, String> {
    fn lookup(&self, key: &str) -> Result<Option<String>, CredentialError> {
        Ok(self.get(key).cloned())
    }
}

/// Reads credentials from the process environment.
///
/// `github.token` is looked up as `GITHUB_TOKEN` (or `<PREFIX>GITHUB_TOKEN`).
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialStore {
    prefix: String,
}

impl EnvCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    /// Env var name for a credential key.
    pub fn var_name(&self, key: &str) -> String {
        let body: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{body}", self.prefix)
    }
}

impl CredentialStore for EnvCredentialStore {
    fn lookup(&self, key: &str) -> Result<Option<String>, CredentialError> {
        Ok(std::env::var(self.var_name(key))
            .ok()
            .filter(|v| !v.is_empty()))
    }
}

/// Reads credentials from a JSON document, addressing nested values with
/// dotted keys (`github.token` → `{"github": {"token": "..."}}`).
///
/// The file is re-read on every lookup so rotated secrets are picked up.
#[derive(Debug, Clone)]
pub struct JsonFileCredentialStore {
    path: PathBuf,
}

impl JsonFileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<serde_json::Value, CredentialError> {
        let path = self.path.display().to_string();
        let raw = std::fs::read_to_string(&self.path).map_err(|e| CredentialError::Read {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|e| CredentialError::Parse {
            path,
            reason: e.to_string(),
        })
    }
}

impl CredentialStore for JsonFileCredentialStore {
    fn lookup(&self, key: &str) -> Result<Option<String>, CredentialError> {
        let document = self.load()?;
        let mut node = &document;
        for part in key.split('.') {
            match node.get(part) {
                Some(next) => node = next,
                None => return Ok(None),
            }
        }
        match node {
            serde_json::Value::String(s) => Ok(Some(s.clone())),
            serde_json::Value::Null => Ok(None),
            _ => Err(CredentialError::NotAString {
                key: key.to_string(),
            }),
        }
    }
}

/// The JSON file named by `TOOLGATE_CREDENTIALS` if set, else the environment.
pub fn default_store() -> Arc<dyn CredentialStore> {
    match std::env::var(CREDENTIALS_ENV) {
        Ok(path) if !path.trim().is_empty() => {
            let path = expand_tilde(&path);
            tracing::debug!(path = %path, "using JSON credential file");
            Arc::new(JsonFileCredentialStore::new(path))
        }
        _ => Arc::new(EnvCredentialStore::new()),
    }
}

// ─── ConfigResolver ──────────────────────────────────────────────────────────

/// Looks up descriptors and resolves their environment.
#[derive(Clone)]
pub struct ConfigResolver {
    registry: Arc<ServerRegistry>,
    store: Arc<dyn CredentialStore>,
    audit: AuditLogger,
}

impl ConfigResolver {
    pub fn new(
        registry: Arc<ServerRegistry>,
        store: Arc<dyn CredentialStore>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            registry,
            store,
            audit,
        }
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Descriptor for `server_id`.
    pub fn resolve(&self, server_id: &str) -> Result<&ServerDescriptor, McpError> {
        self.registry.resolve(server_id)
    }

    /// Concrete environment for `server_id`.
    ///
    /// Missing credentials are logged and left out; the remote server's own
    /// auth check reports the failure.
    pub fn resolve_credentials(
        &self,
        server_id: &str,
    ) -> Result<HashMap<String, String>, McpError> {
        let descriptor = self.registry.resolve(server_id)?;
        Ok(self.resolve_env(descriptor))
    }

    /// Resolve the env mapping of an already looked-up descriptor.
    pub fn resolve_env(&self, descriptor: &ServerDescriptor) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if descriptor.auth == AuthMode::External {
            return env;
        }

        let mut accessed = false;
        for (var, source) in &descriptor.env {
            match source {
                EnvSource::Literal(value) => {
                    env.insert(var.clone(), value.clone());
                }
                EnvSource::Credential(key) => match self.store.lookup(key) {
                    Ok(Some(value)) => {
                        accessed = true;
                        env.insert(var.clone(), value);
                    }
                    Ok(None) => {
                        tracing::warn!(
                            server = %descriptor.id,
                            var = %var,
                            key = %key,
                            "credential not found, leaving variable unset"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            server = %descriptor.id,
                            var = %var,
                            error = %e,
                            "credential lookup failed, leaving variable unset"
                        );
                    }
                },
            }
        }

        if accessed {
            self.audit
                .record(AuditEntry::credential_access(&descriptor.id));
        }
        env
    }
}

impl std::fmt::Debug for ConfigResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigResolver")
            .field("servers", &self.registry.len())
            .finish_non_exhaustive()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! Client configuration loading.
//!
//! Reads `.toolgate/servers.yaml` (or the file named by `TOOLGATE_CONFIG`),
//! resolves environment variables, and yields the client-wide defaults plus
//! any server entries that extend or override the built-in registry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::mcp_client::errors::McpError;
use crate::mcp_client::registry::ServerDescriptor;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Env var naming an explicit config file.
pub const CONFIG_ENV: &str = "TOOLGATE_CONFIG";

/// Env var enabling audit log lines.
pub const AUDIT_ENV: &str = "TOOLGATE_AUDIT";

/// Env var that stops persistent servers from auto-detecting a workspace.
pub const DISABLE_AUTO_DETECT_ENV: &str = "TOOLGATE_DISABLE_AUTO_DETECT";

/// Config file location relative to a project directory.
const CONFIG_RELATIVE_PATH: &str = ".toolgate/servers.yaml";

/// Errors that are transient unless a call says otherwise.
pub const DEFAULT_RETRYABLE_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "ECONNREFUSED",
    "ECONNRESET",
    "ETIMEDOUT",
    "EPIPE",
    "connection refused",
    "connection reset",
    "connection closed",
    "broken pipe",
    "socket hang up",
    "stdout closed",
    "session expired",
    "HTTP 502",
    "HTTP 503",
    "HTTP 504",
];

// ─── Public Types ────────────────────────────────────────────────────────────

/// Client-wide defaults, used when neither the call nor the server sets a value.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientDefaults {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms_base")]
    pub retry_delay_ms_base: u64,
    #[serde(default = "default_retryable_patterns")]
    pub retryable_error_patterns: Vec<String>,
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
    /// Hold a per-server gate across scope activation and the dependent call
    /// so concurrent callers never run against each other's scope.
    #[serde(default = "default_serialize_session_calls")]
    pub serialize_session_calls: bool,
}

fn default_timeout_ms() -> u64 {
    30_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms_base() -> u64 {
    1_000
}
fn default_retryable_patterns() -> Vec<String> {
    DEFAULT_RETRYABLE_PATTERNS
        .iter()
        .map(|p| p.to_string())
        .collect()
}
fn default_max_response_bytes() -> usize {
    1_048_576
}
fn default_serialize_session_calls() -> bool {
    true
}

impl Default for ClientDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms_base: default_retry_delay_ms_base(),
            retryable_error_patterns: default_retryable_patterns(),
            max_response_bytes: default_max_response_bytes(),
            serialize_session_calls: default_serialize_session_calls(),
        }
    }
}

/// Top-level config document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolgateConfig {
    #[serde(default)]
    pub defaults: ClientDefaults,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerDescriptor>,
}

/// `1`, `true`, `yes` and `on` (any case) count as set.
pub fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Checks `TOOLGATE_CONFIG` first, then searches upward from `start` for
/// `.toolgate/servers.yaml`. Returns `None` when neither exists; the client
/// then runs on the built-in registry alone.
pub fn find_config_path(start: &Path) -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.exists() {
            return Some(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV} points to a missing file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_RELATIVE_PATH);
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Load and parse a config file.
pub fn load_config(path: &Path) -> Result<ToolgateConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_config_str(&raw)
}

/// Parse a config document after `${VAR}` interpolation.
pub fn parse_config_str(raw: &str) -> Result<ToolgateConfig, McpError> {
    let interpolated = interpolate_env_vars(raw);
    serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
        reason: format!("failed to parse config: {e}"),
    })
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
pub(crate) fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__TOOLGATE_TEST_MISSING__");
        let result = interpolate_env_vars("${__TOOLGATE_TEST_MISSING__:-/fallback/path}");
        assert_eq!(result, "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__TOOLGATE_TEST_ROOT__", "/custom/path");
        let result = interpolate_env_vars("root: ${__TOOLGATE_TEST_ROOT__:-/fallback}");
        assert_eq!(result, "root: /custom/path");
        std::env::remove_var("__TOOLGATE_TEST_ROOT__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with $ but no braces";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/repo");
        assert!(!result.starts_with('~'));
        assert!(result.ends_with("/repo"));
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1"));
        assert!(parse_flag(" TRUE "));
        assert!(parse_flag("on"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = parse_config_str("defaults:\n  timeout_ms: 500\n").unwrap();
        assert_eq!(config.defaults.timeout_ms, 500);
        assert_eq!(config.defaults.max_retries, 3);
        assert_eq!(config.defaults.retry_delay_ms_base, 1_000);
        assert!(config.defaults.serialize_session_calls);
        assert!(config
            .defaults
            .retryable_error_patterns
            .iter()
            .any(|p| p == "timed out"));
        assert!(config.servers.is_empty());
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let err = parse_config_str("defaults: [unclosed").unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
    }

    #[test]
    fn test_find_config_path_walks_upward() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::create_dir_all(tmp.path().join(".toolgate")).unwrap();
        std::fs::write(tmp.path().join(CONFIG_RELATIVE_PATH), "servers: {}\n").unwrap();

        let found = find_config_path(&nested).unwrap();
        assert_eq!(found, tmp.path().join(CONFIG_RELATIVE_PATH));

        let config = load_config(&found).unwrap();
        assert!(config.servers.is_empty());
    }
}

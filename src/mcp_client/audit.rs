//! Audit log — optional one-line records of credential access and call outcomes.
//!
//! Disabled unless `TOOLGATE_AUDIT` is set. Lines use a stable `key=value`
//! layout so they can be grepped or parsed outside the process:
//!
//! ```text
//! [AUDIT] 2026-01-01T00:00:00.000Z call_error serverId=github toolName=create_issue success=false durationMs=412 error="connection reset"
//! ```
//!
//! Recording never fails; a broken sink is reported at debug level and dropped.

use std::fmt::Write as _;
use std::io::Write as _;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::config::env_flag;
use crate::config::AUDIT_ENV;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Longest error text (bytes) written to an audit line.
const MAX_ERROR_BYTES: usize = 200;

// ─── AuditEntry ──────────────────────────────────────────────────────────────

/// Lifecycle event recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    CredentialAccess,
    CallStart,
    CallSuccess,
    CallError,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventKind::CredentialAccess => "credential_access",
            AuditEventKind::CallStart => "call_start",
            AuditEventKind::CallSuccess => "call_success",
            AuditEventKind::CallError => "call_error",
        }
    }
}

/// A single audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditEventKind,
    pub server_id: String,
    pub tool_name: Option<String>,
    pub success: Option<bool>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl AuditEntry {
    pub fn new(kind: AuditEventKind, server_id: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            server_id: server_id.to_string(),
            tool_name: None,
            success: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn credential_access(server_id: &str) -> Self {
        Self::new(AuditEventKind::CredentialAccess, server_id)
    }

    pub fn call_start(server_id: &str, tool_name: &str) -> Self {
        Self::new(AuditEventKind::CallStart, server_id).with_tool(tool_name)
    }

    pub fn call_success(server_id: &str, tool_name: &str, duration_ms: u64) -> Self {
        let mut entry = Self::new(AuditEventKind::CallSuccess, server_id).with_tool(tool_name);
        entry.success = Some(true);
        entry.duration_ms = Some(duration_ms);
        entry
    }

    pub fn call_error(server_id: &str, tool_name: &str, duration_ms: u64, error: &str) -> Self {
        let mut entry = Self::new(AuditEventKind::CallError, server_id).with_tool(tool_name);
        entry.success = Some(false);
        entry.duration_ms = Some(duration_ms);
        entry.error = Some(error.to_string());
        entry
    }

    fn with_tool(mut self, tool_name: &str) -> Self {
        self.tool_name = Some(tool_name.to_string());
        self
    }

    /// Render the entry as a single audit line.
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "[AUDIT] {} {} serverId={}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.kind.as_str(),
            self.server_id
        );
        if let Some(tool) = &self.tool_name {
            let _ = write!(line, " toolName={tool}");
        }
        if let Some(success) = self.success {
            let _ = write!(line, " success={success}");
        }
        if let Some(ms) = self.duration_ms {
            let _ = write!(line, " durationMs={ms}");
        }
        if let Some(error) = &self.error {
            let _ = write!(line, " error=\"{}\"", sanitize_error(error));
        }
        line
    }
}

/// Truncate, flatten newlines and escape quotes so the error stays on one line.
fn sanitize_error(error: &str) -> String {
    let truncated = truncate_utf8(error, MAX_ERROR_BYTES);
    let mut out = String::with_capacity(truncated.len() + 3);
    for ch in truncated.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\n' | '\r' => out.push(' '),
            c => out.push(c),
        }
    }
    if truncated.len() < error.len() {
        out.push_str("...");
    }
    out
}

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ─── Sinks ───────────────────────────────────────────────────────────────────

/// Destination for rendered audit lines.
pub trait AuditSink: Send + Sync {
    fn write_line(&self, line: &str) -> std::io::Result<()>;
}

/// Writes audit lines to stderr, keeping stdout free for tool output.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl AuditSink for StderrSink {
    fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut stderr = std::io::stderr().lock();
        writeln!(stderr, "{line}")
    }
}

/// Keeps audit lines in memory. Used by tests and embedding applications.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the lines written so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    /// Lines for one event kind.
    pub fn lines_of(&self, kind: AuditEventKind) -> Vec<String> {
        let needle = format!(" {} ", kind.as_str());
        self.lines()
            .into_iter()
            .filter(|l| l.contains(&needle))
            .collect()
    }
}

impl AuditSink for MemorySink {
    fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut lines = self
            .lines
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        lines.push(line.to_string());
        Ok(())
    }
}

// ─── AuditLogger ─────────────────────────────────────────────────────────────

/// Records audit entries when enabled.
#[derive(Clone)]
pub struct AuditLogger {
    enabled: bool,
    sink: Arc<dyn AuditSink>,
}

impl AuditLogger {
    pub fn new(enabled: bool, sink: Arc<dyn AuditSink>) -> Self {
        Self { enabled, sink }
    }

    /// Enabled by `TOOLGATE_AUDIT`, writing to stderr.
    pub fn from_env() -> Self {
        Self::new(env_flag(AUDIT_ENV), Arc::new(StderrSink))
    }

    /// A logger that records nothing.
    pub fn disabled() -> Self {
        Self::new(false, Arc::new(StderrSink))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Record an entry. Never fails.
    pub fn record(&self, entry: AuditEntry) {
        if !self.enabled {
            return;
        }
        if let Err(e) = self.sink.write_line(&entry.to_line()) {
            tracing::debug!(error = %e, kind = entry.kind.as_str(), "dropped audit entry");
        }
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenSink;

    impl AuditSink for BrokenSink {
        fn write_line(&self, _line: &str) -> std::io::Result<()> {
            Err(std::io::Error::other("disk full"))
        }
    }

    #[test]
    fn test_line_format_full() {
        let entry = AuditEntry::call_error("github", "create_issue", 412, "connection reset");
        let line = entry.to_line();
        assert!(line.starts_with("[AUDIT] "));
        assert!(line.ends_with(
            " call_error serverId=github toolName=create_issue success=false durationMs=412 error=\"connection reset\""
        ));
    }

    #[test]
    fn test_line_format_minimal() {
        let line = AuditEntry::credential_access("github").to_line();
        assert!(line.ends_with(" credential_access serverId=github"));
        assert!(!line.contains("toolName"));
    }

    #[test]
    fn test_timestamp_is_iso_utc() {
        let line = AuditEntry::call_start("s", "t").to_line();
        let ts = line.split_whitespace().nth(1).unwrap();
        assert!(ts.ends_with('Z'));
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn test_error_truncated_and_escaped() {
        let long = format!("say \"hi\"\n{}", "é".repeat(300));
        let line = AuditEntry::call_error("s", "t", 1, &long).to_line();
        let error_part = line.split("error=\"").nth(1).unwrap();
        assert!(error_part.starts_with("say \\\"hi\\\" "));
        assert!(error_part.ends_with("...\""));
        assert!(!line.contains('\n'));
        assert!(error_part.len() < 220);
    }

    #[test]
    fn test_disabled_logger_records_nothing() {
        let sink = Arc::new(MemorySink::new());
        let logger = AuditLogger::new(false, sink.clone());
        logger.record(AuditEntry::call_start("s", "t"));
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn test_enabled_logger_records() {
        let sink = Arc::new(MemorySink::new());
        let logger = AuditLogger::new(true, sink.clone());
        logger.record(AuditEntry::call_start("s", "t"));
        logger.record(AuditEntry::call_success("s", "t", 5));
        assert_eq!(sink.lines().len(), 2);
        assert_eq!(sink.lines_of(AuditEventKind::CallSuccess).len(), 1);
    }

    #[test]
    fn test_broken_sink_never_panics() {
        let logger = AuditLogger::new(true, Arc::new(BrokenSink));
        logger.record(AuditEntry::call_start("s", "t"));
    }

    #[test]
    fn test_truncate_utf8_boundary() {
        assert_eq!(truncate_utf8("héllo", 2), "h");
        assert_eq!(truncate_utf8("abc", 10), "abc");
    }
}

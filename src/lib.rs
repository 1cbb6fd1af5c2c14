//! Toolgate — a single chokepoint for invoking tools on MCP servers.
//!
//! Servers are either spawned per call over stdio (ephemeral) or reached
//! through one shared HTTP session (persistent). Every call goes through the
//! same pipeline: credential injection, optional semantic routing, per-attempt
//! timeout with bounded retries, a response size check and an audit record.
//!
//! ```no_run
//! use toolgate::mcp_client::{CallOptions, McpClient, ToolInvoker};
//!
//! # async fn run() -> Result<(), toolgate::mcp_client::McpError> {
//! let client = McpClient::from_env(&std::env::current_dir().unwrap_or_default())?;
//! let result = client
//!     .call_tool(
//!         "github",
//!         "search_issues",
//!         serde_json::json!({ "q": "repo:acme/app is:open" }),
//!         CallOptions::default().with_timeout_ms(10_000),
//!     )
//!     .await?;
//! println!("{result}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod mcp_client;

use std::path::{Path, PathBuf};

/// Env var naming a log file. Logs go to stderr when unset.
pub const LOG_FILE_ENV: &str = "TOOLGATE_LOG_FILE";

/// Rotated log generations kept next to the log file.
const LOG_GENERATIONS: u32 = 3;

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` overrides the default filter (`toolgate=info,warn`). With
/// `TOOLGATE_LOG_FILE` set, the file is rotated (`.1` … `.3`) and opened
/// with a line-flushing writer; otherwise logs go to stderr so stdout stays
/// free for tool output.
pub fn init_tracing() -> std::io::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("toolgate=info,warn"));

    match std::env::var(LOG_FILE_ENV).ok().filter(|p| !p.trim().is_empty()) {
        Some(path) => {
            let log_path = PathBuf::from(config::expand_tilde(&path));
            if let Some(parent) = log_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            rotate_log_file(&log_path, LOG_GENERATIONS);
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)?;

            fmt::fmt()
                .with_env_filter(filter)
                .with_writer(FlushingWriter::new(log_file))
                .with_ansi(false)
                .with_target(true)
                .init();

            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                log_file = %log_path.display(),
                pid = std::process::id(),
                "=== toolgate starting ==="
            );
        }
        None => {
            fmt::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .init();
        }
    }
    Ok(())
}

/// Rotate log files: `toolgate.log` → `toolgate.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Keeps each log line on disk even if the process is killed mid-call.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

//! Transport factory — one handle per call attempt, two strategies.
//!
//! - **Ephemeral** servers get a fresh child process inside every
//!   round-trip; nothing outlives the attempt.
//! - **Persistent** servers share one session per server id, created on
//!   first use and kept for the life of the factory. Each session slot
//!   carries the scope the server is currently narrowed to
//!   ([`ActiveSessionState`]); a call whose routed scope differs issues one
//!   activation call first.
//!
//! A session that fails at transport level is evicted when the handle is
//! released, so the next attempt reconnects instead of reusing a session in
//! an unknown state. An attempt that timed out before sending anything (for
//! example while queued behind another caller) leaves the session alone.
//!
//! Each server has its own connect cell: a slow connect only holds up
//! callers of that server, and they wait no longer than their own deadline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::timeout_at;

use super::errors::McpError;
use super::lifecycle;
use super::registry::{EphemeralConfig, PersistentConfig, ServerDescriptor, TransportKind};
use super::reliability::Attempt;
use super::router::RoutingDecision;

// ─── Seams ───────────────────────────────────────────────────────────────────

/// Runs one call against a freshly spawned ephemeral server.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn run_once(
        &self,
        descriptor: &ServerDescriptor,
        config: &EphemeralConfig,
        env: &HashMap<String, String>,
        tool: &str,
        arguments: serde_json::Value,
        attempt: &Attempt,
    ) -> Result<serde_json::Value, McpError>;
}

/// Launches real child processes over stdio.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioLauncher;

#[async_trait]
impl ProcessLauncher for StdioLauncher {
    async fn run_once(
        &self,
        descriptor: &ServerDescriptor,
        config: &EphemeralConfig,
        env: &HashMap<String, String>,
        tool: &str,
        arguments: serde_json::Value,
        attempt: &Attempt,
    ) -> Result<serde_json::Value, McpError> {
        lifecycle::run_once(&descriptor.id, config, env, tool, arguments, attempt).await
    }
}

/// Opens an initialized session to a persistent server.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        config: &PersistentConfig,
        env: &HashMap<String, String>,
    ) -> Result<Arc<dyn SessionConnection>, McpError>;
}

/// An open session that can run tool calls.
#[async_trait]
pub trait SessionConnection: Send + Sync {
    async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError>;
}

// ─── Session State ───────────────────────────────────────────────────────────

/// The scope a persistent session is currently narrowed to.
#[derive(Debug, Default)]
pub struct ActiveSessionState {
    scope: std::sync::Mutex<Option<String>>,
}

impl ActiveSessionState {
    pub fn current(&self) -> Option<String> {
        self.scope.lock().ok().and_then(|s| s.clone())
    }

    /// Whether `scope` differs from the active one.
    pub fn needs_activation(&self, scope: &str) -> bool {
        self.current().as_deref() != Some(scope)
    }

    pub fn set(&self, scope: &str) {
        if let Ok(mut current) = self.scope.lock() {
            *current = Some(scope.to_string());
        }
    }
}

/// A live session with its scope state and call gate.
pub struct SessionSlot {
    connection: Arc<dyn SessionConnection>,
    state: ActiveSessionState,
    /// Held across activation and the dependent call when serializing.
    gate: Mutex<()>,
}

/// Session of one server, filled by the first successful connect.
type SessionCell = Arc<OnceCell<Arc<SessionSlot>>>;

// ─── TransportFactory ────────────────────────────────────────────────────────

/// Builds transport handles and owns the persistent sessions.
pub struct TransportFactory {
    launcher: Arc<dyn ProcessLauncher>,
    connector: Arc<dyn SessionConnector>,
    sessions: Mutex<HashMap<String, SessionCell>>,
    serialize_calls: bool,
}

impl TransportFactory {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        connector: Arc<dyn SessionConnector>,
        serialize_calls: bool,
    ) -> Self {
        Self {
            launcher,
            connector,
            sessions: Mutex::new(HashMap::new()),
            serialize_calls,
        }
    }

    /// Build the handle for one attempt.
    ///
    /// For persistent servers this connects on first use (within the
    /// attempt's deadline) and otherwise reuses the live session.
    pub async fn acquire<'a>(
        &'a self,
        descriptor: &'a ServerDescriptor,
        env: &'a HashMap<String, String>,
        decision: Option<&RoutingDecision>,
        attempt: &Attempt,
    ) -> Result<TransportHandle<'a>, McpError> {
        match &descriptor.transport {
            TransportKind::Ephemeral(config) => Ok(TransportHandle::Ephemeral {
                launcher: self.launcher.clone(),
                descriptor,
                config,
                env,
            }),
            TransportKind::Persistent(config) => {
                let slot = self.session(descriptor, config, env, attempt).await?;
                Ok(TransportHandle::Persistent {
                    factory: self,
                    descriptor,
                    config,
                    slot,
                    scope: decision.map(|d| d.selected_scope_path.clone()),
                    dispatched: AtomicBool::new(false),
                })
            }
        }
    }

    async fn session(
        &self,
        descriptor: &ServerDescriptor,
        config: &PersistentConfig,
        env: &HashMap<String, String>,
        attempt: &Attempt,
    ) -> Result<Arc<SessionSlot>, McpError> {
        let cell = {
            let mut sessions = self.sessions.lock().await;
            sessions.entry(descriptor.id.clone()).or_default().clone()
        };

        let connect = cell.get_or_try_init(|| async move {
            let connection = self.connector.connect(descriptor, config, env).await?;
            tracing::info!(server = %descriptor.id, url = %config.url, "persistent session connected");
            Ok::<_, McpError>(Arc::new(SessionSlot {
                connection,
                state: ActiveSessionState::default(),
                gate: Mutex::new(()),
            }))
        });

        let slot = timeout_at(attempt.deadline, connect)
            .await
            .map_err(|_| McpError::Timeout {
                tool: format!("{}.connect", descriptor.id),
                timeout_ms: attempt.timeout_ms(),
            })??;
        Ok(slot.clone())
    }

    /// Drop the session of `server_id` if it is still `slot`.
    async fn evict(&self, server_id: &str, slot: &Arc<SessionSlot>) {
        let mut sessions = self.sessions.lock().await;
        if sessions
            .get(server_id)
            .and_then(|cell| cell.get())
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            sessions.remove(server_id);
            tracing::info!(server = server_id, "evicted persistent session after transport failure");
        }
    }

    /// Scope the session of `server_id` is narrowed to, if connected.
    pub async fn active_scope(&self, server_id: &str) -> Option<String> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(server_id)
            .and_then(|cell| cell.get())
            .and_then(|slot| slot.state.current())
    }

    /// Number of live persistent sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }
}

impl std::fmt::Debug for TransportFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportFactory")
            .field("serialize_calls", &self.serialize_calls)
            .finish_non_exhaustive()
    }
}

// ─── TransportHandle ─────────────────────────────────────────────────────────

/// Transport for a single attempt. Call [`round_trip`](Self::round_trip)
/// once, then [`release`](Self::release) with its outcome.
pub enum TransportHandle<'a> {
    Ephemeral {
        launcher: Arc<dyn ProcessLauncher>,
        descriptor: &'a ServerDescriptor,
        config: &'a EphemeralConfig,
        env: &'a HashMap<String, String>,
    },
    Persistent {
        factory: &'a TransportFactory,
        descriptor: &'a ServerDescriptor,
        config: &'a PersistentConfig,
        slot: Arc<SessionSlot>,
        scope: Option<String>,
        /// Set once a request has been handed to the connection.
        dispatched: AtomicBool,
    },
}

impl TransportHandle<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportHandle::Ephemeral { .. } => "ephemeral",
            TransportHandle::Persistent { .. } => "persistent",
        }
    }

    /// Run the tool call, stopping at the attempt's deadline.
    pub async fn round_trip(
        &self,
        tool: &str,
        arguments: serde_json::Value,
        attempt: &Attempt,
    ) -> Result<serde_json::Value, McpError> {
        match self {
            TransportHandle::Ephemeral {
                launcher,
                descriptor,
                config,
                env,
            } => {
                launcher
                    .run_once(descriptor, config, env, tool, arguments, attempt)
                    .await
            }
            TransportHandle::Persistent {
                factory,
                descriptor,
                config,
                slot,
                scope,
                dispatched,
            } => {
                let call = async {
                    let _gate = if factory.serialize_calls {
                        Some(slot.gate.lock().await)
                    } else {
                        None
                    };

                    if let Some(scope) = scope {
                        if slot.state.needs_activation(scope) {
                            tracing::info!(
                                server = %descriptor.id,
                                scope = %scope,
                                previous = ?slot.state.current(),
                                "activating scope"
                            );
                            let mut args = serde_json::Map::new();
                            args.insert(
                                config.scope_argument.clone(),
                                serde_json::Value::String(scope.clone()),
                            );
                            dispatched.store(true, Ordering::SeqCst);
                            slot.connection
                                .call_tool(&config.activation_tool, serde_json::Value::Object(args))
                                .await?;
                            slot.state.set(scope);
                        }
                    }

                    dispatched.store(true, Ordering::SeqCst);
                    slot.connection.call_tool(tool, arguments).await
                };

                timeout_at(attempt.deadline, call)
                    .await
                    .unwrap_or_else(|_| {
                        Err(McpError::Timeout {
                            tool: format!("{}.{tool}", descriptor.id),
                            timeout_ms: attempt.timeout_ms(),
                        })
                    })
            }
        }
    }

    /// Release the transport after a round-trip.
    ///
    /// Ephemeral processes are already gone by now. A persistent session is
    /// kept unless a request was sent on it and the round-trip failed at
    /// transport level.
    pub async fn release(self, outcome: &Result<serde_json::Value, McpError>) {
        if let TransportHandle::Persistent {
            factory,
            descriptor,
            slot,
            dispatched,
            ..
        } = self
        {
            let Err(e) = outcome else { return };
            if !e.is_transport_failure() {
                return;
            }
            if dispatched.into_inner() {
                factory.evict(&descriptor.id, &slot).await;
            } else {
                tracing::debug!(
                    server = %descriptor.id,
                    error = %e,
                    "attempt failed before reaching the session, keeping it"
                );
            }
        }
    }
}

// ─── Test Doubles ────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    /// Shared record of what the fake session server saw.
    #[derive(Default)]
    pub struct FakeServerState {
        pub connects: AtomicU32,
        pub log: std::sync::Mutex<Vec<String>>,
        pub fail_calls: AtomicBool,
        pub call_delay_ms: AtomicU32,
    }

    impl FakeServerState {
        pub fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        pub fn activations(&self) -> usize {
            self.log().iter().filter(|l| l.starts_with("activate:")).count()
        }
    }

    pub struct FakeConnector(pub Arc<FakeServerState>);

    #[async_trait]
    impl SessionConnector for FakeConnector {
        async fn connect(
            &self,
            _descriptor: &ServerDescriptor,
            _config: &PersistentConfig,
            _env: &HashMap<String, String>,
        ) -> Result<Arc<dyn SessionConnection>, McpError> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeConnection(self.0.clone())))
        }
    }

    pub struct FakeConnection(pub Arc<FakeServerState>);

    #[async_trait]
    impl SessionConnection for FakeConnection {
        async fn call_tool(
            &self,
            tool: &str,
            arguments: serde_json::Value,
        ) -> Result<serde_json::Value, McpError> {
            if self.0.fail_calls.load(Ordering::SeqCst) {
                return Err(McpError::TransportError {
                    server: "code".into(),
                    reason: "connection reset".into(),
                });
            }
            let entry = if tool == "activate_project" {
                format!("activate:{}", arguments["project"].as_str().unwrap_or(""))
            } else {
                format!("call:{tool}:{}", arguments["want"].as_str().unwrap_or(""))
            };
            let delay = self.0.call_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            }
            self.0.log.lock().unwrap().push(entry);
            Ok(serde_json::json!({"content": [{"type": "text", "text": tool}]}))
        }
    }

    /// Launcher that fails with the queued errors, then succeeds.
    #[derive(Default)]
    pub struct FakeLauncher {
        pub launches: AtomicU32,
        pub failures: std::sync::Mutex<Vec<McpError>>,
        pub response: std::sync::Mutex<Option<serde_json::Value>>,
    }

    impl FakeLauncher {
        pub fn failing_with(errors: Vec<McpError>) -> Self {
            Self {
                failures: std::sync::Mutex::new(errors),
                ..Self::default()
            }
        }

        pub fn returning(value: serde_json::Value) -> Self {
            Self {
                response: std::sync::Mutex::new(Some(value)),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ProcessLauncher for FakeLauncher {
        async fn run_once(
            &self,
            _descriptor: &ServerDescriptor,
            _config: &EphemeralConfig,
            _env: &HashMap<String, String>,
            tool: &str,
            _arguments: serde_json::Value,
            _attempt: &Attempt,
        ) -> Result<serde_json::Value, McpError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.failures.lock().unwrap();
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
            Ok(self
                .response
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| serde_json::json!({"content": [{"type": "text", "text": tool}]})))
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

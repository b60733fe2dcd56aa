//! Session manager — owns the connections to every configured tool server.
//!
//! The manager starts lazily: the first `ensure_ready` (or tool call)
//! resolves configuration, connects to all servers concurrently and builds
//! the tool registry. Concurrent callers share a single initialization.
//! `cleanup` closes everything exactly once and retires the manager.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;

use super::config::{resolve_configuration, resolve_configuration_in};
use super::dispatch::{CleanupReport, Session};
use super::errors::{McpError, McpResult};
use super::instance::release_instance;
use super::lifecycle::{Connection, Connector, ProcessConnector};
use super::registry::ToolRegistry;
use super::types::{Configuration, McpToolDefinition, ServerSpec, ToolCallResult};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for tool call execution.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default bound on connecting to one server and listing its tools.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Produces the configuration for each initialization attempt.
pub type ConfigLoader = Arc<dyn Fn() -> McpResult<Configuration> + Send + Sync>;

// ─── State ───────────────────────────────────────────────────────────────────

/// Observable lifecycle state of a [`SessionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Internal state; a session exists exactly when ready.
enum Phase {
    Uninitialized,
    Initializing,
    Ready(Arc<Session>),
    Closing,
    Closed,
}

impl Phase {
    fn state(&self) -> SessionState {
        match self {
            Phase::Uninitialized => SessionState::Uninitialized,
            Phase::Initializing => SessionState::Initializing,
            Phase::Ready(_) => SessionState::Ready,
            Phase::Closing => SessionState::Closing,
            Phase::Closed => SessionState::Closed,
        }
    }
}

// ─── SessionManager ──────────────────────────────────────────────────────────

/// Lazily started, shared owner of all tool-server connections.
pub struct SessionManager {
    connector: Arc<dyn Connector>,
    load_config: ConfigLoader,
    call_timeout: Duration,
    startup_timeout: Duration,
    /// Serializes initialization and cleanup.
    lifecycle: tokio::sync::Mutex<()>,
    /// Held shared by in-flight calls and exclusively by cleanup while it
    /// closes connections.
    calls: tokio::sync::RwLock<()>,
    phase: Mutex<Phase>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    /// A manager that discovers configuration from the project root and
    /// launches real server processes.
    pub fn new() -> Self {
        Self::with_parts(
            Arc::new(ProcessConnector::default()),
            Arc::new(resolve_configuration),
        )
    }

    /// A manager that reads configuration from `root` instead of discovering it.
    pub fn for_project(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self::with_parts(
            Arc::new(ProcessConnector::default()),
            Arc::new(move || resolve_configuration_in(&root)),
        )
    }

    /// A manager with an explicit connector and configuration source.
    pub fn with_parts(connector: Arc<dyn Connector>, load_config: ConfigLoader) -> Self {
        Self {
            connector,
            load_config,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            lifecycle: tokio::sync::Mutex::new(()),
            calls: tokio::sync::RwLock::new(()),
            phase: Mutex::new(Phase::Uninitialized),
        }
    }

    /// Set the default tool call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the per-server startup timeout.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: Phase) {
        *self.lock_phase() = phase;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.lock_phase().state()
    }

    fn ready_snapshot(&self) -> Option<Arc<Session>> {
        match &*self.lock_phase() {
            Phase::Ready(session) => Some(session.clone()),
            _ => None,
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start every configured server if not already started.
    ///
    /// Idempotent once ready. Concurrent callers wait for one shared
    /// initialization. A failed attempt leaves the manager uninitialized
    /// so a later call retries from scratch.
    pub async fn ensure_ready(&self) -> McpResult<()> {
        self.ready_session().await.map(|_| ())
    }

    async fn ready_session(&self) -> McpResult<Arc<Session>> {
        if let Some(session) = self.ready_snapshot() {
            return Ok(session);
        }

        let _lifecycle = self.lifecycle.lock().await;

        {
            let phase = self.lock_phase();
            match &*phase {
                Phase::Ready(session) => return Ok(session.clone()),
                Phase::Closing | Phase::Closed => {
                    return Err(McpError::ManagerUnavailable {
                        state: phase.state(),
                    })
                }
                // Initializing here means an earlier attempt was abandoned
                Phase::Uninitialized | Phase::Initializing => {}
            }
        }

        self.set_phase(Phase::Initializing);
        match self.start_session().await {
            Ok(session) => {
                let session = Arc::new(session);
                self.set_phase(Phase::Ready(session.clone()));
                tracing::info!(
                    servers = session.server_names().len(),
                    tools = session.registry().len(),
                    "MCP session ready"
                );
                if session.registry().is_empty() {
                    tracing::warn!("no tools available from the configured servers");
                }
                Ok(session)
            }
            Err(e) => {
                self.set_phase(Phase::Uninitialized);
                tracing::error!(error = %e, "MCP session failed to start");
                Err(e)
            }
        }
    }

    /// Resolve configuration, connect to all servers and build the registry.
    async fn start_session(&self) -> McpResult<Session> {
        // Reads files and may set process environment from .env
        let load = self.load_config.clone();
        let config = tokio::task::spawn_blocking(move || load())
            .await
            .map_err(|e| McpError::ConfigurationInvalid {
                path: PathBuf::new(),
                reason: format!("configuration loader did not complete: {e}"),
            })??;
        tracing::info!(
            source = %config.source.display(),
            servers = config.len(),
            "starting MCP servers"
        );

        let results = join_all(config.servers().iter().map(|spec| self.start_server(spec))).await;

        let mut started: Vec<(Arc<dyn Connection>, Vec<McpToolDefinition>)> = Vec::new();
        let mut first_error: Option<McpError> = None;
        for (spec, result) in config.servers().iter().zip(results) {
            match result {
                Ok(pair) => started.push(pair),
                Err(e) => {
                    tracing::error!(server = %spec.name, error = %e, "server failed to start");
                    if first_error.is_none() {
                        first_error = Some(McpError::startup(&spec.name, &spec.unset_vars, e));
                    }
                }
            }
        }

        if let Some(err) = first_error {
            close_connections(started.iter().map(|(c, _)| c)).await;
            return Err(err);
        }

        let mut registry = ToolRegistry::new();
        for (connection, tools) in &started {
            if let Err(e) = registry.register_server_tools(connection.server_name(), tools.clone()) {
                close_connections(started.iter().map(|(c, _)| c)).await;
                return Err(e);
            }
        }

        let timeouts: HashMap<String, Duration> = config
            .servers()
            .iter()
            .filter_map(|spec| spec.timeout.map(|t| (spec.name.clone(), t)))
            .collect();
        let connections = started.into_iter().map(|(c, _)| c).collect();
        Ok(Session::new(connections, registry, timeouts))
    }

    /// Connect to one server and list its tools within the startup timeout.
    async fn start_server(
        &self,
        spec: &ServerSpec,
    ) -> McpResult<(Arc<dyn Connection>, Vec<McpToolDefinition>)> {
        let attempt = async {
            let connection = self.connector.connect(spec).await?;
            match connection.list_tools().await {
                Ok(tools) => {
                    tracing::debug!(server = %spec.name, tools = tools.len(), "server tools listed");
                    Ok((connection, tools))
                }
                Err(e) => {
                    let _ = connection.close().await;
                    Err(e)
                }
            }
        };

        match tokio::time::timeout(self.startup_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout {
                operation: format!("start server '{}'", spec.name),
                timeout_ms: self.startup_timeout.as_millis() as u64,
            }),
        }
    }

    /// Close every connection and retire the manager. Never fails.
    ///
    /// Only the first cleanup of a ready manager closes anything; later
    /// calls, and calls before initialization, return an empty report.
    /// New calls are refused once cleanup starts, and calls already in
    /// flight finish (bounded by their timeouts) before any connection
    /// closes. The process-wide instance slot is released either way.
    pub async fn cleanup(&self) -> CleanupReport {
        let _lifecycle = self.lifecycle.lock().await;

        let session = {
            let mut phase = self.lock_phase();
            match std::mem::replace(&mut *phase, Phase::Closing) {
                Phase::Ready(session) => Some(session),
                Phase::Closing | Phase::Closed => {
                    *phase = Phase::Closed;
                    None
                }
                Phase::Uninitialized | Phase::Initializing => {
                    *phase = Phase::Uninitialized;
                    None
                }
            }
        };

        let mut report = CleanupReport::default();
        if let Some(session) = session {
            let _drained = self.calls.write().await;
            report = session.close_all().await;
            self.set_phase(Phase::Closed);
            tracing::info!(
                closed = report.closed.len(),
                failures = report.failures.len(),
                "MCP session closed"
            );
        }

        release_instance(self);
        report
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Invoke `name` with `arguments`, starting the session if needed.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> McpResult<ToolCallResult> {
        self.dispatch(name, arguments, None).await
    }

    /// Like [`call_tool`](Self::call_tool) with an explicit timeout.
    pub async fn call_tool_with_timeout(
        &self,
        name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> McpResult<ToolCallResult> {
        self.dispatch(name, arguments, Some(timeout)).await
    }

    async fn dispatch(
        &self,
        name: &str,
        arguments: serde_json::Value,
        timeout: Option<Duration>,
    ) -> McpResult<ToolCallResult> {
        let session = self.ready_session().await?;
        let _in_flight = self.calls.read().await;

        // Cleanup may have begun while this call waited for the guard.
        let still_ready = matches!(
            &*self.lock_phase(),
            Phase::Ready(current) if Arc::ptr_eq(current, &session)
        );
        if !still_ready {
            return Err(McpError::ManagerUnavailable {
                state: self.state(),
            });
        }

        session
            .dispatch(name, arguments, timeout, self.call_timeout)
            .await
    }

    // ─── Introspection ───────────────────────────────────────────────────

    /// `(tool, server)` pairs of the ready session, sorted by tool name.
    pub fn tools(&self) -> Vec<(String, String)> {
        self.ready_snapshot()
            .map(|session| {
                session
                    .registry()
                    .entries()
                    .into_iter()
                    .map(|(tool, server)| (tool.to_string(), server.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Connected server names in configuration order.
    pub fn server_names(&self) -> Vec<String> {
        self.ready_snapshot()
            .map(|session| session.server_names().to_vec())
            .unwrap_or_default()
    }
}

/// Best-effort close of connections opened during a failed startup.
async fn close_connections<'a>(connections: impl Iterator<Item = &'a Arc<dyn Connection>>) {
    let closes = connections.map(|connection| async move {
        if let Err(e) = connection.close().await {
            tracing::warn!(
                server = connection.server_name(),
                error = %e,
                "failed to close connection after aborted startup"
            );
        }
    });
    join_all(closes).await;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! Tool dispatch over a ready session.
//!
//! A [`Session`] is the immutable snapshot a manager holds while ready:
//! one live connection per configured server plus the tool registry built
//! from their `tools/list` answers. Calls are routed by tool name and
//! bounded by a timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;

use super::errors::{McpError, McpResult};
use super::lifecycle::Connection;
use super::registry::ToolRegistry;
use super::types::ToolCallResult;

/// Outcome of closing every connection of a session.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Servers whose connection closed cleanly, in configuration order.
    pub closed: Vec<String>,
    /// Servers whose connection reported an error while closing.
    pub failures: Vec<(String, McpError)>,
}

impl CleanupReport {
    /// Whether every connection closed cleanly.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A ready set of connections and the registry that routes to them.
pub struct Session {
    /// Server names in configuration order.
    order: Vec<String>,
    connections: HashMap<String, Arc<dyn Connection>>,
    registry: ToolRegistry,
    /// Per-server default call timeouts.
    timeouts: HashMap<String, Duration>,
}

impl Session {
    /// Assemble a session from connections given in configuration order.
    pub fn new(
        connections: Vec<Arc<dyn Connection>>,
        registry: ToolRegistry,
        timeouts: HashMap<String, Duration>,
    ) -> Self {
        let order = connections
            .iter()
            .map(|c| c.server_name().to_string())
            .collect();
        let connections = connections
            .into_iter()
            .map(|c| (c.server_name().to_string(), c))
            .collect();
        Self {
            order,
            connections,
            registry,
            timeouts,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Server names in configuration order.
    pub fn server_names(&self) -> &[String] {
        &self.order
    }

    /// Route a call to the server providing `name`.
    ///
    /// The timeout is the first of `timeout`, the server's configured
    /// timeout, and `default_timeout`.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: serde_json::Value,
        timeout: Option<Duration>,
        default_timeout: Duration,
    ) -> McpResult<ToolCallResult> {
        let route = self.registry.resolve(name).ok_or_else(|| McpError::UnknownTool {
            name: name.to_string(),
            suggestions: self.registry.find_similar(name, 3),
        })?;

        let connection = self.connections.get(route.server).ok_or_else(|| {
            McpError::invocation(
                name,
                McpError::ConnectionClosed {
                    server: route.server.to_string(),
                },
            )
        })?;

        let timeout = timeout
            .or_else(|| self.timeouts.get(route.server).copied())
            .unwrap_or(default_timeout);

        tracing::debug!(
            tool = route.tool,
            server = route.server,
            timeout_ms = timeout.as_millis() as u64,
            "dispatching tool call"
        );

        let start = Instant::now();
        let outcome = tokio::time::timeout(timeout, connection.call_tool(route.tool, arguments)).await;
        let elapsed = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(result)) => {
                tracing::info!(
                    tool = route.tool,
                    server = route.server,
                    elapsed_ms = elapsed,
                    "tool call succeeded"
                );
                Ok(ToolCallResult {
                    tool_name: route.tool.to_string(),
                    server_name: route.server.to_string(),
                    result,
                    execution_time_ms: elapsed,
                })
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    tool = route.tool,
                    server = route.server,
                    error = %e,
                    "tool call failed"
                );
                Err(McpError::invocation(name, e))
            }
            Err(_) => {
                tracing::warn!(
                    tool = route.tool,
                    server = route.server,
                    timeout_ms = timeout.as_millis() as u64,
                    "tool call timed out"
                );
                Err(McpError::invocation(
                    name,
                    McpError::Timeout {
                        operation: format!("tools/call {}", route.tool),
                        timeout_ms: timeout.as_millis() as u64,
                    },
                ))
            }
        }
    }

    /// Close every connection concurrently, collecting failures.
    pub(crate) async fn close_all(&self) -> CleanupReport {
        let closes = self.order.iter().filter_map(|name| {
            let connection = self.connections.get(name)?;
            Some(async move { (name.clone(), connection.close().await) })
        });

        let mut report = CleanupReport::default();
        for (name, result) in join_all(closes).await {
            match result {
                Ok(()) => report.closed.push(name),
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "failed to close server connection");
                    report.failures.push((name, e));
                }
            }
        }
        report
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! MCP client runtime — shared sessions with external tool servers.
//!
//! This module handles:
//! - Resolving `.mcp.json` / `mcp_config.json` with `${VAR}` expansion
//! - Spawning stdio servers and dialing streamable HTTP servers
//! - JSON-RPC 2.0 communication and the MCP handshake
//! - Tool discovery and routing across all servers
//! - A lazily started, process-wide session manager with explicit cleanup

pub mod config;
pub mod dispatch;
pub mod env;
pub mod errors;
pub mod http;
pub mod instance;
pub mod lifecycle;
pub mod manager;
pub mod registry;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use config::{resolve_configuration, resolve_configuration_in};
pub use dispatch::CleanupReport;
pub use errors::{McpError, McpResult};
pub use instance::{call_mcp_tool, cleanup_instance, get_instance, get_or_init_instance, reset_instance};
pub use lifecycle::{Connection, Connector, ProcessConnector};
pub use manager::{SessionManager, SessionState};
pub use registry::ToolRegistry;
pub use types::{Configuration, McpToolDefinition, ServerSpec, ServerTransport, ToolCallResult};

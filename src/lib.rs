//! Shared-session runtime for MCP tool servers.
//!
//! Reads the project's MCP server configuration, starts every server once
//! per process, and routes tool calls to whichever server provides them.
//! [`call_mcp_tool`] is the entry point scripts and agents use;
//! [`cleanup_instance`] tears the shared session down.

pub mod mcp_client;

pub use mcp_client::{
    call_mcp_tool, cleanup_instance, get_instance, get_or_init_instance, reset_instance,
    CleanupReport, McpError, McpResult, SessionManager, SessionState, ToolCallResult,
};

/// Initialize the tracing subscriber with structured logs on stderr.
///
/// Stdout stays free for tool output. The filter comes from `RUST_LOG`,
/// defaulting to `mcp_runtime=info,warn`. Calling this twice is harmless.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_runtime=info,warn"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    match installed {
        Ok(()) => tracing::debug!(
            version = env!("CARGO_PKG_VERSION"),
            pid = std::process::id(),
            "tracing initialized"
        ),
        Err(_) => tracing::debug!("tracing subscriber already installed"),
    }
}

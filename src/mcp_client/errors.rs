//! MCP runtime error types.

use std::path::PathBuf;

use thiserror::Error;

use super::manager::SessionState;

/// Errors that can occur while resolving configuration, starting servers,
/// or dispatching tool calls.
#[derive(Debug, Error)]
pub enum McpError {
    // ─── Configuration ───────────────────────────────────────────────────

    /// Neither configuration document exists.
    #[error("no MCP configuration found (searched: {})", display_paths(searched))]
    ConfigurationMissing { searched: Vec<PathBuf> },

    /// The configuration document exists but could not be used.
    #[error("invalid MCP configuration in {}: {reason}", path.display())]
    ConfigurationInvalid { path: PathBuf, reason: String },

    /// Two servers expose a tool with the same name.
    #[error("tool name collision: '{tool}' is provided by servers {}", servers.join(", "))]
    ToolNameCollision { tool: String, servers: Vec<String> },

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// A configured server could not be started; the session did not become ready.
    #[error("server '{server_name}' failed to start: {cause}")]
    ServerStartupFailed {
        server_name: String,
        /// Variables the server's entry references that were not set.
        unset_vars: Vec<String>,
        #[source]
        cause: Box<McpError>,
    },

    /// The manager is closing or closed and cannot serve requests.
    #[error("session manager unavailable (state: {state})")]
    ManagerUnavailable { state: SessionState },

    // ─── Dispatch ────────────────────────────────────────────────────────

    /// No configured server provides the requested tool.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
        /// Similarly named tools that do exist.
        suggestions: Vec<String>,
    },

    /// The owning server failed to execute the tool.
    #[error("tool '{name}' failed: {cause}")]
    ToolInvocationFailed {
        name: String,
        #[source]
        cause: Box<McpError>,
    },

    // ─── Connection-level causes ─────────────────────────────────────────

    /// A server process failed to spawn.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// JSON-RPC communication error (malformed message, I/O error, HTTP status).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The tool ran but reported `isError: true`.
    #[error("tool reported an error: {message}")]
    ToolError { message: String },

    /// A request did not complete in time.
    #[error("'{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The connection was closed before or while the request was in flight.
    #[error("connection to server '{server}' is closed")]
    ConnectionClosed { server: String },
}

pub type McpResult<T> = Result<T, McpError>;

impl McpError {
    /// Wrap a connection-level error as a startup failure for `server_name`.
    pub fn startup(server_name: &str, unset_vars: &[String], cause: McpError) -> Self {
        McpError::ServerStartupFailed {
            server_name: server_name.to_string(),
            unset_vars: unset_vars.to_vec(),
            cause: Box::new(cause),
        }
    }

    /// Wrap a connection-level error as a failed invocation of `name`.
    pub fn invocation(name: &str, cause: McpError) -> Self {
        McpError::ToolInvocationFailed {
            name: name.to_string(),
            cause: Box::new(cause),
        }
    }

    /// Whether this error comes from configuration resolution.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            McpError::ConfigurationMissing { .. }
                | McpError::ConfigurationInvalid { .. }
                | McpError::ToolNameCollision { .. }
        )
    }

    /// Whether this error is scoped to a single tool call.
    pub fn is_call_error(&self) -> bool {
        matches!(
            self,
            McpError::UnknownTool { .. } | McpError::ToolInvocationFailed { .. }
        )
    }

    /// An actionable hint for the person running the command, if one applies.
    pub fn guidance(&self) -> Option<String> {
        match self {
            McpError::ConfigurationMissing { searched } => Some(format!(
                "create one of: {} (a JSON object of server name -> {{\"command\", \"args\", \"env\"}} \
                 or {{\"url\", \"headers\"}}), or set MCP_PROJECT_ROOT to the directory that holds it",
                display_paths(searched)
            )),
            McpError::ConfigurationInvalid { path, .. } => Some(format!(
                "fix the JSON in {}; every server entry needs a \"command\" or a \"url\"",
                path.display()
            )),
            McpError::ToolNameCollision { tool, .. } => Some(format!(
                "remove one of the servers providing '{tool}', or call tools as 'server__tool'"
            )),
            McpError::ServerStartupFailed {
                server_name,
                unset_vars,
                cause,
            } => {
                let detail = match cause.as_ref() {
                    McpError::SpawnFailed { .. } => "check that its command is installed and on PATH",
                    McpError::Timeout { .. } => {
                        "the server did not finish its handshake; check its logs"
                    }
                    _ => "check its command, URL, and credentials",
                };
                let secrets = if unset_vars.is_empty() {
                    "secrets referenced as ${VAR} must be exported or set in .env".to_string()
                } else {
                    format!(
                        "its configuration references unset variables ({}); export them or set them in .env",
                        unset_vars.join(", ")
                    )
                };
                Some(format!(
                    "server '{server_name}' is configured but could not start: {detail}; {secrets}"
                ))
            }
            McpError::UnknownTool { name, suggestions } if !suggestions.is_empty() => Some(format!(
                "no configured server provides '{name}'; did you mean {}?",
                suggestions
                    .iter()
                    .map(|s| format!("'{s}'"))
                    .collect::<Vec<_>>()
                    .join(" or ")
            )),
            McpError::UnknownTool { name, .. } => Some(format!(
                "no configured server provides '{name}'; run with --list to see available tools"
            )),
            _ => None,
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_missing_config_names_searched_paths() {
        let err = McpError::ConfigurationMissing {
            searched: vec![PathBuf::from("/p/.mcp.json"), PathBuf::from("/p/mcp_config.json")],
        };
        let msg = err.to_string();
        assert!(msg.contains("/p/.mcp.json"));
        assert!(msg.contains("/p/mcp_config.json"));
        assert!(err.guidance().unwrap().contains("MCP_PROJECT_ROOT"));
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_startup_failure_exposes_cause() {
        let err = McpError::startup(
            "perplexity",
            &[],
            McpError::SpawnFailed {
                name: "perplexity".into(),
                reason: "No such file or directory".into(),
            },
        );
        assert!(err.to_string().contains("perplexity"));
        let source = err.source().unwrap().to_string();
        assert!(source.contains("No such file"));
        assert!(err.guidance().unwrap().contains("PATH"));
        assert!(!err.is_call_error());
    }

    #[test]
    fn test_startup_guidance_names_unset_variables() {
        let err = McpError::startup(
            "perplexity",
            &["PERPLEXITY_API_KEY".to_string()],
            McpError::InitFailed {
                name: "perplexity".into(),
                reason: "server exited".into(),
            },
        );
        let hint = err.guidance().unwrap();
        assert!(hint.contains("PERPLEXITY_API_KEY"));
        assert!(hint.contains(".env"));
    }

    #[test]
    fn test_invocation_failure_is_call_error() {
        let err = McpError::invocation(
            "search",
            McpError::Timeout {
                operation: "tools/call search".into(),
                timeout_ms: 100,
            },
        );
        assert!(err.is_call_error());
        assert!(err.to_string().contains("100ms"));
    }

    #[test]
    fn test_unknown_tool_guidance_suggests() {
        let err = McpError::UnknownTool {
            name: "read_fil".into(),
            suggestions: vec!["read_file".into()],
        };
        assert_eq!(err.to_string(), "unknown tool: 'read_fil'");
        assert!(err.guidance().unwrap().contains("did you mean 'read_file'?"));

        let err = McpError::UnknownTool {
            name: "zzz".into(),
            suggestions: vec![],
        };
        assert!(err.guidance().unwrap().contains("--list"));
    }

    #[test]
    fn test_collision_message_lists_servers() {
        let err = McpError::ToolNameCollision {
            tool: "search".into(),
            servers: vec!["a".into(), "b".into()],
        };
        assert_eq!(
            err.to_string(),
            "tool name collision: 'search' is provided by servers a, b"
        );
    }
}

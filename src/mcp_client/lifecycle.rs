//! Server connection lifecycle.
//!
//! Opens connections to configured tool servers, performs the MCP
//! initialization handshake, and shuts them down. Stdio servers run as
//! child processes speaking JSON-RPC over stdin/stdout; HTTP servers are
//! reached over streamable HTTP.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;

use super::errors::{McpError, McpResult};
use super::http::HttpTransport;
use super::transport::{extract_result, RpcChannel, StdioTransport};
use super::types::{
    content_text, InitializeResult, ListToolsResult, McpToolDefinition, ServerSpec,
    ServerTransport, PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for the initialize handshake.
///
/// Set to 30s to accommodate servers launched through package runners
/// (`npx`, `uvx`) that may download on first start.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on `tools/list` pages fetched from one server.
const MAX_TOOL_PAGES: usize = 100;

// ─── Seams ───────────────────────────────────────────────────────────────────

/// An initialized session with one tool server.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Name of the server this connection belongs to.
    fn server_name(&self) -> &str;

    /// All tools the server exposes (every page of `tools/list`).
    async fn list_tools(&self) -> McpResult<Vec<McpToolDefinition>>;

    /// Invoke `name` and return the raw `tools/call` result.
    ///
    /// A result flagged `isError` is returned as `McpError::ToolError`.
    async fn call_tool(&self, name: &str, arguments: serde_json::Value)
        -> McpResult<serde_json::Value>;

    /// Release the connection. Calling it more than once is harmless.
    async fn close(&self) -> McpResult<()>;
}

/// Opens connections from server specs.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, spec: &ServerSpec) -> McpResult<Arc<dyn Connection>>;
}

/// Connector that launches stdio servers as child processes and dials HTTP
/// servers directly.
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    /// Bound on the initialize handshake.
    pub init_timeout: Duration,
}

impl Default for ProcessConnector {
    fn default() -> Self {
        Self {
            init_timeout: INIT_TIMEOUT,
        }
    }
}

#[async_trait]
impl Connector for ProcessConnector {
    async fn connect(&self, spec: &ServerSpec) -> McpResult<Arc<dyn Connection>> {
        let connection = match &spec.transport {
            ServerTransport::Stdio { .. } => spawn_server(spec, self.init_timeout).await?,
            ServerTransport::Http { url, headers } => {
                connect_http(&spec.name, url, headers, self.init_timeout).await?
            }
        };
        Ok(Arc::new(connection))
    }
}

// ─── ServerConnection ────────────────────────────────────────────────────────

/// A live, initialized MCP server connection.
pub struct ServerConnection {
    name: String,
    channel: Box<dyn RpcChannel>,
    /// The child process handle (stdio servers only).
    process: Mutex<Option<Child>>,
    closed: AtomicBool,
}

impl ServerConnection {
    pub(crate) fn new(
        name: &str,
        channel: Box<dyn RpcChannel>,
        process: Option<Child>,
    ) -> Self {
        Self {
            name: name.to_string(),
            channel,
            process: Mutex::new(process),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> McpResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(McpError::ConnectionClosed {
                server: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Wait for the child to exit after stdin closes, killing it on timeout.
    async fn stop_process(&self) -> McpResult<()> {
        let Some(mut child) = self.process.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.name, %status, "server process exited");
                Ok(())
            }
            _ => {
                tracing::warn!(server = %self.name, "server did not exit after stdin closed, killing");
                child.kill().await.map_err(|e| McpError::TransportError {
                    server: self.name.clone(),
                    reason: format!("failed to kill server process: {e}"),
                })
            }
        }
    }
}

#[async_trait]
impl Connection for ServerConnection {
    fn server_name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> McpResult<Vec<McpToolDefinition>> {
        self.ensure_open()?;

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let result = extract_result(self.channel.request("tools/list", params).await?)?;
            let page: ListToolsResult =
                serde_json::from_value(result).map_err(|e| McpError::TransportError {
                    server: self.name.clone(),
                    reason: format!("failed to parse tools/list response: {e}"),
                })?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        tracing::warn!(server = %self.name, pages = MAX_TOOL_PAGES, "tools/list pagination truncated");
        Ok(tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> McpResult<serde_json::Value> {
        self.ensure_open()?;

        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        let result = extract_result(self.channel.request("tools/call", Some(params)).await?)?;

        if result.get("isError").and_then(|v| v.as_bool()) == Some(true) {
            let message = content_text(&result);
            return Err(McpError::ToolError {
                message: if message.is_empty() {
                    "tool returned isError without content".into()
                } else {
                    message
                },
            });
        }
        Ok(result)
    }

    async fn close(&self) -> McpResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let channel_result = self.channel.close().await;
        let process_result = self.stop_process().await;
        channel_result.and(process_result)
    }
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// Perform the MCP initialization handshake.
async fn initialize(channel: &dyn RpcChannel, server_name: &str) -> McpResult<()> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    let response = channel.request("initialize", Some(params)).await?;
    let result = extract_result(response)?;

    let init_result: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::InitFailed {
            name: server_name.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    channel.notify("notifications/initialized", None).await?;

    let info = init_result.server_info.as_ref();
    tracing::debug!(
        server = server_name,
        protocol = init_result.protocol_version.as_deref().unwrap_or("unknown"),
        implementation = info.and_then(|i| i.name.as_deref()).unwrap_or("unknown"),
        version = info.and_then(|i| i.version.as_deref()).unwrap_or("unknown"),
        "handshake complete"
    );
    Ok(())
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn a stdio MCP server process and perform the initialization handshake.
pub async fn spawn_server(spec: &ServerSpec, init_timeout: Duration) -> McpResult<ServerConnection> {
    let name = spec.name.as_str();
    let ServerTransport::Stdio { command, args, cwd } = &spec.transport else {
        return Err(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "not a stdio server".into(),
        });
    };

    let mut cmd = Command::new(command);
    cmd.args(args);
    cmd.envs(&spec.env);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    // Wire stdio for JSON-RPC
    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    if !spec.unset_vars.is_empty() {
        tracing::warn!(
            server = name,
            vars = ?spec.unset_vars,
            "starting server with unset environment variables"
        );
    }

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: name.to_string(),
        reason: format!("{command}: {e}"),
    })?;

    let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;

    let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;

    // Extract stderr for diagnostic capture on failure
    let stderr_handle = child.stderr.take();

    let transport = StdioTransport::new(name, stdout, stdin);

    let outcome = tokio::time::timeout(init_timeout, initialize(&transport, name)).await;
    let failure = match outcome {
        Ok(Ok(())) => {
            if let Some(stderr) = stderr_handle {
                forward_stderr(name, stderr);
            }
            tracing::info!(server = name, pid = ?child.id(), "MCP server started");
            return Ok(ServerConnection::new(name, Box::new(transport), Some(child)));
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("initialization timed out after {}ms", init_timeout.as_millis()),
    };

    let _ = transport.close().await;
    let _ = child.kill().await;
    let stderr_ctx = read_stderr_on_failure(stderr_handle).await;
    if !stderr_ctx.is_empty() {
        tracing::warn!(
            server = name,
            stderr = %stderr_ctx,
            "server stderr captured on failure"
        );
    }

    Err(McpError::InitFailed {
        name: name.to_string(),
        reason: format!("{failure}{}", format_stderr_suffix(&stderr_ctx)),
    })
}

/// Dial a streamable HTTP server and perform the initialization handshake.
pub async fn connect_http(
    name: &str,
    url: &str,
    headers: &std::collections::BTreeMap<String, String>,
    init_timeout: Duration,
) -> McpResult<ServerConnection> {
    let transport = HttpTransport::new(name, url, headers)?;

    let outcome = tokio::time::timeout(init_timeout, initialize(&transport, name)).await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            return Err(McpError::InitFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })
        }
        Err(_) => {
            return Err(McpError::InitFailed {
                name: name.to_string(),
                reason: format!("initialization timed out after {}ms", init_timeout.as_millis()),
            })
        }
    };

    tracing::info!(server = name, url, "MCP server connected");
    Ok(ServerConnection::new(name, Box::new(transport), None))
}

/// Relay a running server's stderr to debug logs.
fn forward_stderr(server_name: &str, stderr: ChildStderr) {
    let server_name = server_name.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %server_name, "{line}");
        }
    });
}

/// Read any available stderr output from a failed server process.
///
/// Uses a short timeout to avoid blocking if stderr is held open. Truncates
/// to 2000 chars to keep log messages readable.
async fn read_stderr_on_failure(stderr_handle: Option<ChildStderr>) -> String {
    use tokio::io::AsyncReadExt;

    let Some(mut stderr) = stderr_handle else {
        return String::new();
    };

    let mut buf = Vec::new();
    let _ = tokio::time::timeout(Duration::from_millis(500), stderr.read_to_end(&mut buf)).await;

    let text = String::from_utf8_lossy(&buf);
    if text.chars().count() > 2000 {
        let mut truncated: String = text.chars().take(2000).collect();
        truncated.push_str("...(truncated)");
        truncated
    } else {
        text.into_owned()
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use crate::mcp_client::types::{JsonRpcError, JsonRpcResponse};

    /// Channel that replays canned results and records requests.
    #[derive(Default)]
    struct ScriptedChannel {
        responses: StdMutex<VecDeque<JsonRpcResponse>>,
        requests: Arc<StdMutex<Vec<(String, Option<serde_json::Value>)>>>,
        closes: Arc<StdMutex<usize>>,
    }

    impl ScriptedChannel {
        fn with_results(results: Vec<serde_json::Value>) -> Self {
            let channel = Self::default();
            {
                let mut queue = channel.responses.lock().unwrap();
                for (i, result) in results.into_iter().enumerate() {
                    queue.push_back(JsonRpcResponse {
                        id: i as u64,
                        result: Some(result),
                        error: None,
                    });
                }
            }
            channel
        }
    }

    #[async_trait]
    impl RpcChannel for ScriptedChannel {
        async fn request(
            &self,
            method: &str,
            params: Option<serde_json::Value>,
        ) -> McpResult<JsonRpcResponse> {
            self.requests
                .lock()
                .unwrap()
                .push((method.to_string(), params));
            Ok(self.responses.lock().unwrap().pop_front().unwrap_or(JsonRpcResponse {
                id: 0,
                result: None,
                error: Some(JsonRpcError {
                    code: -32603,
                    message: "script exhausted".into(),
                    data: None,
                }),
            }))
        }

        async fn notify(&self, _method: &str, _params: Option<serde_json::Value>) -> McpResult<()> {
            Ok(())
        }

        async fn close(&self) -> McpResult<()> {
            *self.closes.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn connection(channel: ScriptedChannel) -> ServerConnection {
        ServerConnection::new("scripted", Box::new(channel), None)
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor() {
        let channel = ScriptedChannel::with_results(vec![
            serde_json::json!({"tools": [{"name": "a"}], "nextCursor": "p2"}),
            serde_json::json!({"tools": [{"name": "b"}, {"name": "c"}]}),
        ]);
        let requests = channel.requests.clone();
        let conn = connection(channel);

        let tools = conn.list_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].1.is_none());
        assert_eq!(requests[1].1.as_ref().unwrap()["cursor"], "p2");
    }

    #[tokio::test]
    async fn test_call_tool_sends_name_and_arguments() {
        let channel = ScriptedChannel::with_results(vec![serde_json::json!({
            "content": [{"type": "text", "text": "ok"}]
        })]);
        let requests = channel.requests.clone();
        let conn = connection(channel);

        let result = conn
            .call_tool("search", serde_json::json!({"q": "rust"}))
            .await
            .unwrap();
        assert_eq!(content_text(&result), "ok");

        let requests = requests.lock().unwrap();
        assert_eq!(requests[0].0, "tools/call");
        let params = requests[0].1.as_ref().unwrap();
        assert_eq!(params["name"], "search");
        assert_eq!(params["arguments"]["q"], "rust");
    }

    #[tokio::test]
    async fn test_call_tool_is_error_becomes_tool_error() {
        let channel = ScriptedChannel::with_results(vec![serde_json::json!({
            "content": [{"type": "text", "text": "API key rejected"}],
            "isError": true
        })]);
        let conn = connection(channel);

        let err = conn.call_tool("search", serde_json::json!({})).await.unwrap_err();
        match err {
            McpError::ToolError { message } => assert_eq!(message, "API key rejected"),
            other => panic!("expected ToolError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let channel = ScriptedChannel::default();
        let closes = channel.closes.clone();
        let conn = connection(channel);

        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(*closes.lock().unwrap(), 1);

        let err = conn.call_tool("x", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn test_spawn_missing_command_fails() {
        let spec = ServerSpec::stdio("ghost", "definitely-not-a-real-mcp-server-binary", &[]);
        let err = spawn_server(&spec, Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::SpawnFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_exiting_process_fails_handshake() {
        let spec = ServerSpec::stdio(
            "quitter",
            "sh",
            &["-c", "echo 'missing API key' >&2; exit 1"],
        );
        let err = spawn_server(&spec, Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        match err {
            McpError::InitFailed { name, reason } => {
                assert_eq!(name, "quitter");
                assert!(reason.contains("missing API key"), "reason: {reason}");
            }
            other => panic!("expected InitFailed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_silent_process_times_out() {
        let spec = ServerSpec::stdio("sleeper", "sleep", &["30"]);
        let err = spawn_server(&spec, Duration::from_millis(200))
            .await
            .err()
            .unwrap();
        match err {
            McpError::InitFailed { reason, .. } => assert!(reason.contains("timed out")),
            other => panic!("expected InitFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_format_stderr_suffix() {
        assert_eq!(format_stderr_suffix(""), "");
        assert_eq!(format_stderr_suffix("  \n"), "");
        assert_eq!(format_stderr_suffix("boom\n"), " | stderr: boom");
    }
}

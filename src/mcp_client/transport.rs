//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with MCP server child processes:
//! - Writing line-delimited JSON-RPC requests to stdin
//! - A single background reader that routes stdout responses to waiting
//!   callers by request id, so concurrent calls share one pipe safely
//! - Answering server-initiated `ping` requests

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::errors::{McpError, McpResult};
use super::types::{error_codes, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Channel abstraction ─────────────────────────────────────────────────────

/// A request/response JSON-RPC channel to one server.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Send a request and wait for the response with the matching id.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> McpResult<JsonRpcResponse>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> McpResult<()>;

    /// Release the channel. In-flight requests fail with `ConnectionClosed`.
    async fn close(&self) -> McpResult<()>;
}

// ─── Transport ───────────────────────────────────────────────────────────────

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SharedWriter = Arc<Mutex<Option<BoxedWriter>>>;

/// Requests awaiting a response, keyed by id.
#[derive(Default)]
struct PendingRequests {
    waiters: HashMap<u64, oneshot::Sender<JsonRpcResponse>>,
    closed: bool,
}

type SharedPending = Arc<StdMutex<PendingRequests>>;

fn lock_pending(pending: &SharedPending) -> MutexGuard<'_, PendingRequests> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bi-directional JSON-RPC transport over a pair of byte streams
/// (a child process's stdout/stdin in production).
pub struct StdioTransport {
    server_name: String,
    writer: SharedWriter,
    pending: SharedPending,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Create a transport and start its background reader.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<R, W>(server_name: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: SharedWriter = Arc::new(Mutex::new(Some(Box::new(writer) as BoxedWriter)));
        let pending: SharedPending = Arc::new(StdMutex::new(PendingRequests::default()));

        let reader_task = tokio::spawn(read_loop(
            server_name.to_string(),
            BufReader::new(reader),
            pending.clone(),
            writer.clone(),
        ));

        Self {
            server_name: server_name.to_string(),
            writer,
            pending,
            reader_task: StdMutex::new(Some(reader_task)),
        }
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }

    fn closed_error(&self) -> McpError {
        McpError::ConnectionClosed {
            server: self.server_name.clone(),
        }
    }

    async fn write_line<T: serde::Serialize>(&self, message: &T) -> McpResult<()> {
        let mut json = serde_json::to_string(message)
            .map_err(|e| self.transport_error(format!("failed to serialize message: {e}")))?;
        json.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.closed_error())?;
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))
    }
}

/// Removes a pending entry when the waiting request is dropped (timeout or
/// cancellation) so late responses are discarded.
struct PendingGuard<'a> {
    pending: &'a SharedPending,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_pending(self.pending).waiters.remove(&self.id);
    }
}

#[async_trait]
impl RpcChannel for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> McpResult<JsonRpcResponse> {
        let id = next_request_id();
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = lock_pending(&self.pending);
            if pending.closed {
                return Err(self.closed_error());
            }
            pending.waiters.insert(id, tx);
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        self.write_line(&JsonRpcRequest::new(id, method, params)).await?;

        rx.await.map_err(|_| self.closed_error())
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> McpResult<()> {
        self.write_line(&JsonRpcNotification::new(method, params)).await
    }

    async fn close(&self) -> McpResult<()> {
        {
            let mut pending = lock_pending(&self.pending);
            pending.closed = true;
            pending.waiters.clear();
        }

        // Dropping the writer closes the child's stdin.
        let writer = self.writer.lock().await.take();
        let shutdown_result = match writer {
            Some(mut w) => w.shutdown().await,
            None => Ok(()),
        };

        if let Some(task) = self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }

        match shutdown_result {
            Ok(()) => Ok(()),
            // The child may already have exited and closed its end.
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
            Err(e) => Err(self.transport_error(format!("failed to close stdin: {e}"))),
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(task) = self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

// ─── Reader ──────────────────────────────────────────────────────────────────

/// Read stdout until EOF, routing every message.
async fn read_loop<R>(
    server_name: String,
    mut reader: BufReader<R>,
    pending: SharedPending,
    writer: SharedWriter,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(server = %server_name, error = %e, "failed to read from stdout");
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(message) => route_message(&server_name, message, &pending, &writer),
            // Not JSON: server log output on stdout
            Err(_) => tracing::trace!(server = %server_name, line = %trimmed, "skipping non-JSON line"),
        }
    }

    let mut state = lock_pending(&pending);
    state.closed = true;
    let abandoned = state.waiters.len();
    state.waiters.clear();
    drop(state);

    tracing::debug!(server = %server_name, abandoned, "stdio reader finished");
}

/// Deliver a response to its waiter, or answer a server-initiated request.
///
/// Answers are written from their own task; the reader never waits on the
/// writer, which a request may hold while stdin is full.
fn route_message(
    server_name: &str,
    message: serde_json::Value,
    pending: &SharedPending,
    writer: &SharedWriter,
) {
    if let Some(method) = message.get("method").and_then(|m| m.as_str()) {
        match message.get("id") {
            Some(id) if !id.is_null() => {
                let reply = if method == "ping" {
                    serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {}})
                } else {
                    serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {
                            "code": error_codes::METHOD_NOT_FOUND,
                            "message": format!("client does not support '{method}'"),
                        }
                    })
                };
                let writer = writer.clone();
                let server_name = server_name.to_string();
                tokio::spawn(async move {
                    if let Err(e) = write_raw(&writer, &reply).await {
                        tracing::debug!(server = %server_name, error = %e, "failed to answer server request");
                    }
                });
            }
            _ => tracing::debug!(server = %server_name, method, "server notification"),
        }
        return;
    }

    match serde_json::from_value::<JsonRpcResponse>(message) {
        Ok(response) => {
            let waiter = lock_pending(pending).waiters.remove(&response.id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => tracing::debug!(
                    server = %server_name,
                    id = response.id,
                    "response for unknown or abandoned request"
                ),
            }
        }
        Err(_) => tracing::debug!(server = %server_name, "ignoring unroutable message"),
    }
}

async fn write_raw(writer: &SharedWriter, message: &serde_json::Value) -> std::io::Result<()> {
    let mut line = message.to_string();
    line.push('\n');
    let mut guard = writer.lock().await;
    match guard.as_mut() {
        Some(w) => {
            w.write_all(line.as_bytes()).await?;
            w.flush().await
        }
        None => Ok(()),
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> McpResult<serde_json::Value> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

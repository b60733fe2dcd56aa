//! Streamable HTTP transport for remote MCP servers.
//!
//! Each JSON-RPC message is POSTed to the server URL. The server answers
//! with either a plain JSON body or an SSE stream (`data: …\n\n`) that
//! eventually carries the response. A session id handed out during
//! `initialize` is echoed on every later request and released with a
//! DELETE on close.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;

use super::errors::{McpError, McpResult};
use super::transport::{next_request_id, RpcChannel};
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Header carrying the server-assigned session id.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// JSON-RPC channel over MCP streamable HTTP.
pub struct HttpTransport {
    server_name: String,
    url: String,
    client: reqwest::Client,
    headers: HeaderMap,
    session_id: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl HttpTransport {
    /// Create a transport for `url`, sending `headers` on every request.
    pub fn new(server_name: &str, url: &str, headers: &BTreeMap<String, String>) -> McpResult<Self> {
        let mut header_map = HeaderMap::new();
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| McpError::InitFailed {
                name: server_name.to_string(),
                reason: format!("invalid header name '{key}': {e}"),
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| McpError::InitFailed {
                name: server_name.to_string(),
                reason: format!("invalid value for header '{key}': {e}"),
            })?;
            header_map.insert(name, value);
        }

        Ok(Self {
            server_name: server_name.to_string(),
            url: url.to_string(),
            client: reqwest::Client::new(),
            headers: header_map,
            session_id: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn post(&self, body: &serde_json::Value) -> McpResult<reqwest::Response> {
        if self.closed.load(Ordering::Acquire) {
            return Err(McpError::ConnectionClosed {
                server: self.server_name.clone(),
            });
        }

        let mut request = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, ACCEPT_BOTH)
            .header(CONTENT_TYPE, "application/json")
            .json(body);
        if let Some(id) = self.session_id() {
            request = request.header(SESSION_ID_HEADER, id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(format!("request to {} failed: {e}", self.url)))?;

        if let Some(id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(id.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.transport_error(format!(
                "HTTP {status}: {}",
                body.chars().take(500).collect::<String>()
            )));
        }
        Ok(response)
    }

    /// Read an SSE body until the event carrying response `id` arrives.
    ///
    /// Bytes are buffered until a complete event is available, so chunk
    /// boundaries may fall anywhere, including inside a UTF-8 character.
    async fn read_event_stream<S, B, E>(&self, stream: S, id: u64) -> McpResult<JsonRpcResponse>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: std::fmt::Display,
    {
        let mut stream = std::pin::pin!(stream);
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| self.transport_error(format!("failed to read event stream: {e}")))?;
            buffer.extend_from_slice(chunk.as_ref());

            while let Some(event) = take_event(&mut buffer) {
                if let Some(response) = parse_sse_event(&event, id) {
                    return Ok(response);
                }
            }
        }

        // Stream ended, check for any remaining buffer content
        let rest = String::from_utf8_lossy(&buffer).replace("\r\n", "\n");
        parse_sse_event(&rest, id).ok_or_else(|| {
            self.transport_error(format!("event stream ended without a response to request {id}"))
        })
    }
}

#[async_trait]
impl RpcChannel for HttpTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> McpResult<JsonRpcResponse> {
        let id = next_request_id();
        let body = serde_json::to_value(JsonRpcRequest::new(id, method, params))
            .map_err(|e| self.transport_error(format!("failed to serialize request: {e}")))?;

        let response = self.post(&body).await?;

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if is_event_stream {
            self.read_event_stream(response.bytes_stream(), id).await
        } else {
            response
                .json::<JsonRpcResponse>()
                .await
                .map_err(|e| self.transport_error(format!("invalid JSON-RPC response: {e}")))
        }
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> McpResult<()> {
        let body = serde_json::to_value(JsonRpcNotification::new(method, params))
            .map_err(|e| self.transport_error(format!("failed to serialize notification: {e}")))?;
        self.post(&body).await.map(|_| ())
    }

    async fn close(&self) -> McpResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(session_id) = self.session_id() else {
            return Ok(());
        };

        let response = self
            .client
            .delete(&self.url)
            .headers(self.headers.clone())
            .header(SESSION_ID_HEADER, session_id)
            .send()
            .await
            .map_err(|e| self.transport_error(format!("failed to end session: {e}")))?;

        match response.status() {
            // Servers may not support explicit session termination
            StatusCode::METHOD_NOT_ALLOWED => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(self.transport_error(format!("ending session returned HTTP {status}"))),
        }
    }
}

/// Remove the first complete event from `buffer` and decode it.
///
/// Events end at a blank line; `\r\n` line endings are normalized.
fn take_event(buffer: &mut Vec<u8>) -> Option<String> {
    let (end, separator_len) = [&b"\r\n\r\n"[..], &b"\n\n"[..]]
        .iter()
        .filter_map(|sep| {
            buffer
                .windows(sep.len())
                .position(|window| window == *sep)
                .map(|pos| (pos, sep.len()))
        })
        .min_by_key(|(pos, _)| *pos)?;

    let event: Vec<u8> = buffer.drain(..end + separator_len).collect();
    Some(String::from_utf8_lossy(&event[..end]).replace("\r\n", "\n"))
}

/// Parse one SSE event, returning it if it is the response to `id`.
///
/// Multiple `data:` lines are joined with newlines. Server requests and
/// notifications interleaved on the stream are skipped.
fn parse_sse_event(event: &str, id: u64) -> Option<JsonRpcResponse> {
    let data: Vec<&str> = event
        .lines()
        .filter_map(|line| line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")))
        .collect();
    if data.is_empty() {
        return None;
    }

    let value: serde_json::Value = serde_json::from_str(&data.join("\n")).ok()?;
    if value.get("method").is_some() {
        return None;
    }
    let response: JsonRpcResponse = serde_json::from_value(value).ok()?;
    (response.id == id).then_some(response)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

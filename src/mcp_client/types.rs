//! Shared types for the MCP runtime.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures, and the resolved
//! server configuration model.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (a request without an id).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    pub id: u64,
    pub result: Option<serde_json::Value>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Protocol revision sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Tool definition as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
    #[serde(default, alias = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

// ─── Server Configuration ────────────────────────────────────────────────────

/// How to reach one tool server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerTransport {
    /// Child process speaking line-delimited JSON-RPC over stdio.
    Stdio {
        command: String,
        args: Vec<String>,
        cwd: Option<PathBuf>,
    },
    /// Remote endpoint speaking MCP streamable HTTP.
    Http {
        url: String,
        headers: BTreeMap<String, String>,
    },
}

/// Resolved, immutable descriptor of one configured tool server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub name: String,
    pub transport: ServerTransport,
    /// Environment overlay applied on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Per-server default call timeout.
    pub timeout: Option<Duration>,
    /// Variables referenced without a default that were unset during expansion.
    pub unset_vars: Vec<String>,
}

impl ServerSpec {
    /// A stdio server spec with no env overlay.
    pub fn stdio(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            transport: ServerTransport::Stdio {
                command: command.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                cwd: None,
            },
            env: BTreeMap::new(),
            timeout: None,
            unset_vars: Vec::new(),
        }
    }
}

/// Ordered set of server specs parsed from exactly one configuration document.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    /// The document this configuration was read from.
    pub source: PathBuf,
    servers: Vec<ServerSpec>,
}

impl Configuration {
    /// Build a configuration, keeping the first spec for any repeated name.
    pub fn new(source: PathBuf, specs: Vec<ServerSpec>) -> Self {
        let mut servers: Vec<ServerSpec> = Vec::with_capacity(specs.len());
        for spec in specs {
            if servers.iter().any(|s| s.name == spec.name) {
                tracing::warn!(server = %spec.name, "duplicate server name ignored");
                continue;
            }
            servers.push(spec);
        }
        Self { source, servers }
    }

    /// Servers in document order.
    pub fn servers(&self) -> &[ServerSpec] {
        &self.servers
    }

    /// Server names in document order.
    pub fn server_names(&self) -> Vec<&str> {
        self.servers.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

// ─── Tool Call Result ────────────────────────────────────────────────────────

/// Result of a successful tool call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub tool_name: String,
    pub server_name: String,
    /// The raw MCP `tools/call` result object.
    pub result: serde_json::Value,
    pub execution_time_ms: u64,
}

impl ToolCallResult {
    /// Concatenated text of all `text` content blocks.
    pub fn text(&self) -> String {
        content_text(&self.result)
    }

    /// The most structured view of the result available.
    ///
    /// Prefers `structuredContent`, then text content parsed as JSON, then the
    /// text itself, then the raw result.
    pub fn structured(&self) -> serde_json::Value {
        if let Some(structured) = self.result.get("structuredContent") {
            if !structured.is_null() {
                return structured.clone();
            }
        }

        let text = self.text();
        if text.is_empty() {
            return self.result.clone();
        }
        serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
    }
}

/// Join the `text` blocks of an MCP `content` array with newlines.
pub fn content_text(result: &serde_json::Value) -> String {
    result
        .get("content")
        .and_then(|c| c.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

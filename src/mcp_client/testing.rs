//! In-memory connections for exercising the session manager without
//! spawning processes.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::errors::{McpError, McpResult};
use super::lifecycle::{Connection, Connector};
use super::types::{Configuration, McpToolDefinition, ServerSpec};

/// Behaviour of one fake server.
#[derive(Debug, Clone)]
pub(crate) struct FakeServer {
    pub name: String,
    tools: Vec<String>,
    delays: HashMap<String, Duration>,
    error_tools: HashSet<String>,
    fail_close: bool,
}

impl FakeServer {
    pub fn new(name: &str, tools: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            tools: tools.iter().map(|t| t.to_string()).collect(),
            delays: HashMap::new(),
            error_tools: HashSet::new(),
            fail_close: false,
        }
    }

    pub fn with_delay(mut self, tool: &str, delay: Duration) -> Self {
        self.delays.insert(tool.to_string(), delay);
        self
    }

    /// Calls to `tool` come back flagged `isError`.
    pub fn with_failing_tool(mut self, tool: &str) -> Self {
        self.error_tools.insert(tool.to_string());
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn tool_definitions(&self) -> Vec<McpToolDefinition> {
        self.tools
            .iter()
            .map(|name| McpToolDefinition {
                name: name.clone(),
                description: String::new(),
                input_schema: serde_json::json!({"type": "object"}),
            })
            .collect()
    }
}

/// Connection whose tools answer `"<server>:<tool>"`.
pub(crate) struct FakeConnection {
    server: FakeServer,
    calls: Mutex<Vec<(String, serde_json::Value)>>,
    closes: AtomicUsize,
}

impl FakeConnection {
    pub fn new(server: FakeServer) -> Self {
        Self {
            server,
            calls: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> Vec<(String, serde_json::Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn server_name(&self) -> &str {
        &self.server.name
    }

    async fn list_tools(&self) -> McpResult<Vec<McpToolDefinition>> {
        Ok(self.server.tool_definitions())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> McpResult<serde_json::Value> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments));

        if let Some(delay) = self.server.delays.get(name) {
            tokio::time::sleep(*delay).await;
        }
        if self.server.error_tools.contains(name) {
            return Err(McpError::ToolError {
                message: format!("{name} failed"),
            });
        }
        Ok(serde_json::json!({
            "content": [{"type": "text", "text": format!("{}:{name}", self.server.name)}]
        }))
    }

    async fn close(&self) -> McpResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.server.fail_close {
            return Err(McpError::TransportError {
                server: self.server.name.clone(),
                reason: "close failed".into(),
            });
        }
        Ok(())
    }
}

/// Connector handing out [`FakeConnection`]s and recording what it was asked.
#[derive(Default)]
pub(crate) struct FakeConnector {
    servers: Mutex<HashMap<String, FakeServer>>,
    failing: Mutex<HashSet<String>>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    specs: Mutex<Vec<ServerSpec>>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(servers: Vec<FakeServer>) -> Self {
        let connector = Self::default();
        {
            let mut map = connector.servers.lock().unwrap();
            for server in servers {
                map.insert(server.name.clone(), server);
            }
        }
        connector
    }

    /// Make connecting to `server` fail (or succeed again).
    pub fn set_failing(&self, server: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(server.to_string());
        } else {
            set.remove(server);
        }
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().unwrap().clone()
    }

    /// The connection most recently opened for `server`.
    pub fn connection(&self, server: &str) -> Arc<FakeConnection> {
        self.connections()
            .into_iter()
            .rev()
            .find(|c| c.server_name() == server)
            .unwrap()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn specs(&self) -> Vec<ServerSpec> {
        self.specs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, spec: &ServerSpec) -> McpResult<Arc<dyn Connection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.specs.lock().unwrap().push(spec.clone());
        tokio::task::yield_now().await;

        if self.failing.lock().unwrap().contains(&spec.name) {
            return Err(McpError::SpawnFailed {
                name: spec.name.clone(),
                reason: "No such file or directory".into(),
            });
        }

        let server = self
            .servers
            .lock()
            .unwrap()
            .get(&spec.name)
            .cloned()
            .unwrap_or_else(|| FakeServer::new(&spec.name, &[]));
        let connection = Arc::new(FakeConnection::new(server));
        self.connections.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}

/// A configuration of stdio specs named `names`, in order.
pub(crate) fn config_for(names: &[&str]) -> Configuration {
    Configuration::new(
        PathBuf::from("/project/.mcp.json"),
        names
            .iter()
            .map(|name| ServerSpec::stdio(name, "fake-server", &[]))
            .collect(),
    )
}

//! Tool registry — maps tool names to the server that provides them.
//!
//! Provides:
//! - Tool lookup by bare name (`perplexity_ask`)
//! - Qualified lookup (`perplexity__perplexity_ask`) as a fallback
//! - Collision detection across servers
//! - "Did you mean" suggestions for unknown names

use std::collections::HashMap;

use super::errors::{McpError, McpResult};
use super::types::McpToolDefinition;

/// Separator between server and tool in a qualified tool name.
pub const QUALIFIED_SEPARATOR: &str = "__";

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Aggregated tool registry across all servers of a session.
///
/// Bare tool names are unique: registering a name another server already
/// provides fails with `ToolNameCollision`.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    /// `tool_name → server_name`.
    tools: HashMap<String, String>,
}

/// Where a tool call should be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolRoute<'a> {
    pub server: &'a str,
    /// The tool's name as the server knows it.
    pub tool: &'a str,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the tools one server reported.
    ///
    /// A tool listed twice by the same server is kept once.
    pub fn register_server_tools(
        &mut self,
        server_name: &str,
        tools: Vec<McpToolDefinition>,
    ) -> McpResult<()> {
        for tool in tools {
            if let Some(owner) = self.tools.get(&tool.name) {
                if owner == server_name {
                    tracing::debug!(server = server_name, tool = %tool.name, "duplicate tool ignored");
                    continue;
                }
                return Err(McpError::ToolNameCollision {
                    tool: tool.name.clone(),
                    servers: vec![owner.clone(), server_name.to_string()],
                });
            }
            self.tools.insert(tool.name, server_name.to_string());
        }
        Ok(())
    }

    /// Resolve a bare or `server__tool` name to its route.
    pub fn resolve<'a>(&'a self, name: &str) -> Option<ToolRoute<'a>> {
        if let Some((tool, server)) = self.tools.get_key_value(name) {
            return Some(ToolRoute {
                server: server.as_str(),
                tool: tool.as_str(),
            });
        }

        name.match_indices(QUALIFIED_SEPARATOR).find_map(|(idx, _)| {
            let server = &name[..idx];
            let tool = &name[idx + QUALIFIED_SEPARATOR.len()..];
            match self.tools.get_key_value(tool) {
                Some((tool, owner)) if owner == server => Some(ToolRoute {
                    server: owner.as_str(),
                    tool: tool.as_str(),
                }),
                _ => None,
            }
        })
    }

    /// `(tool, server)` pairs sorted by tool name.
    pub fn entries(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<(&str, &str)> = self
            .tools
            .iter()
            .map(|(name, srv)| (name.as_str(), srv.as_str()))
            .collect();
        entries.sort_unstable();
        entries
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Find up to `max_results` tool names most similar to `name`.
    ///
    /// Qualified queries are compared by their tool part.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let query = name
            .rsplit_once(QUALIFIED_SEPARATOR)
            .map(|(_, tool)| tool)
            .unwrap_or(name);

        let mut scored: Vec<(&str, f64)> = self
            .tools
            .keys()
            .map(|tool| (tool.as_str(), similarity(query, tool)))
            .filter(|(_, score)| *score > 0.5) // Floor: don't suggest wildly different tools
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        scored.truncate(max_results);
        scored.into_iter().map(|(name, _)| name.to_string()).collect()
    }
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

/// Compute the Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    let n = b_bytes.len();

    // Use single-row DP
    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for (i, &ca) in a_bytes.iter().enumerate() {
        curr[0] = i + 1;
        for j in 1..=n {
            let cost = usize::from(ca != b_bytes[j - 1]);
            curr[j] = (prev[j] + 1) // deletion
                .min(curr[j - 1] + 1) // insertion
                .min(prev[j - 1] + cost); // substitution
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Normalized similarity between two strings (0.0 = completely different, 1.0 = identical).
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

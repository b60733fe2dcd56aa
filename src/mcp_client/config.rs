//! Tool-server configuration resolution.
//!
//! Finds the configuration document (`.mcp.json`, then `mcp_config.json`) in
//! the project root, loads the project `.env`, expands `${VAR}` references,
//! and produces an ordered [`Configuration`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::env::{expand_config_reporting, load_project_env};
use super::errors::{McpError, McpResult};
use super::types::{Configuration, ServerSpec, ServerTransport};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Preferred configuration document (tool convention).
pub const PRIMARY_CONFIG_FILE: &str = ".mcp.json";

/// Fallback configuration document (tracked in the repository).
pub const FALLBACK_CONFIG_FILE: &str = "mcp_config.json";

/// Overrides the project root used to locate configuration and `.env`.
pub const PROJECT_ROOT_ENV: &str = "MCP_PROJECT_ROOT";

// ─── Locating ────────────────────────────────────────────────────────────────

/// The project root: `MCP_PROJECT_ROOT` if set, else the current directory.
pub fn project_root() -> PathBuf {
    if let Some(root) = std::env::var_os(PROJECT_ROOT_ENV) {
        if !root.is_empty() {
            return PathBuf::from(root);
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Candidate documents in precedence order.
pub fn config_candidates(root: &Path) -> [PathBuf; 2] {
    [root.join(PRIMARY_CONFIG_FILE), root.join(FALLBACK_CONFIG_FILE)]
}

/// Return the first candidate document that exists.
pub fn find_config_path(root: &Path) -> McpResult<PathBuf> {
    let candidates = config_candidates(root);
    match candidates.iter().find(|p| p.is_file()) {
        Some(found) => Ok(found.clone()),
        None => Err(McpError::ConfigurationMissing {
            searched: candidates.to_vec(),
        }),
    }
}

// ─── Resolution ──────────────────────────────────────────────────────────────

/// Resolve the configuration for the default project root.
pub fn resolve_configuration() -> McpResult<Configuration> {
    resolve_configuration_in(&project_root())
}

/// Resolve the configuration rooted at `root`.
///
/// Loads `<root>/.env` first (never overriding existing variables), so its
/// values are visible to expansion.
pub fn resolve_configuration_in(root: &Path) -> McpResult<Configuration> {
    let loaded = load_project_env(root);
    if !loaded.is_empty() {
        tracing::info!(root = %root.display(), vars = ?loaded, "loaded project .env");
    }

    let path = find_config_path(root)?;
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
    let raw = std::fs::read_to_string(&path).map_err(|e| McpError::ConfigurationInvalid {
        path: path.clone(),
        reason: format!("failed to read: {e}"),
    })?;

    let config = parse_configuration(&raw, &path, &base_dir)?;

    tracing::info!(
        path = %path.display(),
        server_count = config.len(),
        servers = ?config.server_names(),
        "resolved MCP configuration"
    );
    if config.is_empty() {
        tracing::warn!(path = %path.display(), "configuration lists no servers");
    }
    Ok(config)
}

/// Parse and expand a configuration document.
///
/// Accepts `{"mcpServers": {...}}` or a bare mapping of server name to entry.
/// Relative `cwd` values resolve against `base_dir`.
pub fn parse_configuration(raw: &str, path: &Path, base_dir: &Path) -> McpResult<Configuration> {
    let invalid = |reason: String| McpError::ConfigurationInvalid {
        path: path.to_path_buf(),
        reason,
    };

    let document: Value =
        serde_json::from_str(raw).map_err(|e| invalid(format!("malformed JSON: {e}")))?;

    let Value::Object(mut top) = document else {
        return Err(invalid("top-level value must be an object".into()));
    };

    let servers = match top.remove("mcpServers") {
        Some(Value::Object(servers)) => servers,
        Some(_) => return Err(invalid("\"mcpServers\" must be an object".into())),
        None => top,
    };

    let mut specs = Vec::with_capacity(servers.len());
    for (name, entry) in servers {
        let mut unset = Vec::new();
        let expanded = expand_config_reporting(entry, &mut unset);
        let spec = build_server_spec(&name, expanded, unset, base_dir).map_err(invalid)?;

        if !spec.unset_vars.is_empty() {
            tracing::warn!(
                server = %name,
                unset = ?spec.unset_vars,
                "configuration references unset environment variables"
            );
        }
        specs.push(spec);
    }

    Ok(Configuration::new(path.to_path_buf(), specs))
}

// ─── Server entries ──────────────────────────────────────────────────────────

/// One server entry as written in the document (after expansion).
#[derive(Debug, Deserialize)]
struct RawServerEntry {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, Value>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default, alias = "timeoutMs")]
    timeout_ms: Option<u64>,
}

fn build_server_spec(
    name: &str,
    entry: Value,
    unset_vars: Vec<String>,
    base_dir: &Path,
) -> Result<ServerSpec, String> {
    if !entry.is_object() {
        return Err(format!("server '{name}' must be an object"));
    }
    let raw: RawServerEntry =
        serde_json::from_value(entry).map_err(|e| format!("server '{name}': {e}"))?;

    let mut env = BTreeMap::new();
    for (key, value) in raw.env {
        let value = match value {
            Value::String(s) => s,
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            _ => return Err(format!("server '{name}': env value for '{key}' must be a scalar")),
        };
        env.insert(key, value);
    }

    let kind = raw.kind.as_deref().map(str::to_ascii_lowercase);
    let transport = match (kind.as_deref(), raw.command, raw.url) {
        (Some("stdio") | None, Some(command), url) => {
            if url.is_some() {
                tracing::warn!(server = %name, "both command and url set, using command");
            }
            if command.trim().is_empty() {
                return Err(format!("server '{name}': command is empty"));
            }
            ServerTransport::Stdio {
                command,
                args: raw.args,
                cwd: raw.cwd.map(|cwd| resolve_cwd(&cwd, base_dir)),
            }
        }
        (Some("http" | "streamable-http" | "streamable_http") | None, None, Some(url)) => {
            if url.trim().is_empty() {
                return Err(format!("server '{name}': url is empty"));
            }
            ServerTransport::Http {
                url,
                headers: raw.headers,
            }
        }
        (Some("http" | "streamable-http" | "streamable_http"), Some(_), Some(url)) => {
            ServerTransport::Http {
                url,
                headers: raw.headers,
            }
        }
        (Some("stdio"), None, _) => {
            return Err(format!("server '{name}': stdio transport requires \"command\""))
        }
        (Some("http" | "streamable-http" | "streamable_http"), _, None) => {
            return Err(format!("server '{name}': http transport requires \"url\""))
        }
        (Some(other), _, _) => {
            return Err(format!("server '{name}': unsupported transport type '{other}'"))
        }
        (None, None, None) => {
            return Err(format!("server '{name}' needs either \"command\" or \"url\""))
        }
    };

    Ok(ServerSpec {
        name: name.to_string(),
        transport,
        env,
        timeout: raw.timeout_ms.map(Duration::from_millis),
        unset_vars,
    })
}

/// Expand a leading `~` and resolve relative paths against `base_dir`.
fn resolve_cwd(cwd: &str, base_dir: &Path) -> PathBuf {
    let expanded = expand_tilde(cwd);
    if expanded.is_absolute() {
        expanded
    } else {
        base_dir.join(expanded)
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(path.trim_start_matches('~').trim_start_matches('/'));
        }
    }
    PathBuf::from(path)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn parse(raw: &str) -> McpResult<Configuration> {
        parse_configuration(raw, Path::new("/proj/.mcp.json"), Path::new("/proj"))
    }

    fn spec_named<'a>(config: &'a Configuration, name: &str) -> &'a ServerSpec {
        config.servers().iter().find(|s| s.name == name).unwrap()
    }

    #[test]
    fn test_parse_mcp_servers_wrapper() {
        let config = parse(
            r#"{"mcpServers": {
                "perplexity": {"command": "npx", "args": ["-y", "server-perplexity-ask"]},
                "firecrawl": {"url": "https://mcp.example.com/mcp", "headers": {"X-Key": "k"}}
            }}"#,
        )
        .unwrap();

        assert_eq!(config.server_names(), vec!["perplexity", "firecrawl"]);
        match &spec_named(&config, "perplexity").transport {
            ServerTransport::Stdio { command, args, cwd } => {
                assert_eq!(command, "npx");
                assert_eq!(args, &vec!["-y".to_string(), "server-perplexity-ask".to_string()]);
                assert!(cwd.is_none());
            }
            other => panic!("unexpected transport {other:?}"),
        }
        match &spec_named(&config, "firecrawl").transport {
            ServerTransport::Http { url, headers } => {
                assert_eq!(url, "https://mcp.example.com/mcp");
                assert_eq!(headers["X-Key"], "k");
            }
            other => panic!("unexpected transport {other:?}"),
        }
    }

    #[test]
    fn test_parse_bare_mapping_preserves_order() {
        let config = parse(
            r#"{"zeta": {"command": "z"}, "alpha": {"command": "a"}, "mid": {"command": "m"}}"#,
        )
        .unwrap();
        assert_eq!(config.server_names(), vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_malformed_json_is_invalid() {
        let err = parse("{not json").unwrap_err();
        match err {
            McpError::ConfigurationInvalid { path, reason } => {
                assert_eq!(path, PathBuf::from("/proj/.mcp.json"));
                assert!(reason.contains("malformed JSON"));
            }
            other => panic!("expected ConfigurationInvalid, got {other:?}"),
        }
    }

    #[test]
    fn test_entry_without_command_or_url_is_invalid() {
        let err = parse(r#"{"broken": {"args": ["x"]}}"#).unwrap_err();
        assert!(err.to_string().contains("broken"));
        assert!(matches!(err, McpError::ConfigurationInvalid { .. }));
    }

    #[test]
    fn test_unsupported_transport_type() {
        let err = parse(r#"{"legacy": {"type": "sse", "url": "http://x"}}"#).unwrap_err();
        assert!(err.to_string().contains("unsupported transport type 'sse'"));
    }

    #[test]
    fn test_relative_cwd_resolves_against_base_dir() {
        let config = parse(r#"{"a": {"command": "run", "cwd": "servers/a"}}"#).unwrap();
        match &spec_named(&config, "a").transport {
            ServerTransport::Stdio { cwd, .. } => {
                assert_eq!(cwd.as_deref(), Some(Path::new("/proj/servers/a")));
            }
            other => panic!("unexpected transport {other:?}"),
        }
    }

    #[test]
    fn test_env_scalars_are_stringified_and_timeout_parsed() {
        let config = parse(
            r#"{"a": {"command": "run", "env": {"PORT": 8080, "DEBUG": true}, "timeout_ms": 1500}}"#,
        )
        .unwrap();
        let spec = spec_named(&config, "a");
        assert_eq!(spec.env["PORT"], "8080");
        assert_eq!(spec.env["DEBUG"], "true");
        assert_eq!(spec.timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    #[serial]
    fn test_unset_secret_expands_to_empty_string() {
        std::env::remove_var("__MCP_RT_TEST_SECRET__");
        let config =
            parse(r#"{"A": {"command": "run", "env": {"KEY": "${__MCP_RT_TEST_SECRET__}"}}}"#)
                .unwrap();
        let spec = spec_named(&config, "A");
        assert_eq!(spec.env["KEY"], "");
        assert_eq!(spec.unset_vars, vec!["__MCP_RT_TEST_SECRET__"]);
    }

    #[test]
    fn test_missing_config_lists_both_candidates() {
        let tmp = TempDir::new().unwrap();
        match find_config_path(tmp.path()).unwrap_err() {
            McpError::ConfigurationMissing { searched } => {
                assert_eq!(searched.len(), 2);
                assert!(searched[0].ends_with(".mcp.json"));
                assert!(searched[1].ends_with("mcp_config.json"));
            }
            other => panic!("expected ConfigurationMissing, got {other:?}"),
        }
    }

    #[test]
    fn test_primary_document_wins_over_fallback() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(".mcp.json"), r#"{"primary": {"command": "p"}}"#).unwrap();
        std::fs::write(
            tmp.path().join("mcp_config.json"),
            r#"{"fallback": {"command": "f"}}"#,
        )
        .unwrap();

        let config = resolve_configuration_in(tmp.path()).unwrap();
        assert_eq!(config.server_names(), vec!["primary"]);
        assert!(config.source.ends_with(".mcp.json"));
    }

    #[test]
    fn test_fallback_document_used_when_primary_absent() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("mcp_config.json"),
            r#"{"mcpServers": {"fallback": {"command": "f"}}}"#,
        )
        .unwrap();

        let config = resolve_configuration_in(tmp.path()).unwrap();
        assert_eq!(config.server_names(), vec!["fallback"]);
    }

    #[test]
    #[serial]
    fn test_dotenv_feeds_expansion_without_overriding() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(".env"),
            "__MCP_RT_TEST_DOTENV_KEY__=from_file\n__MCP_RT_TEST_PRESET__=from_file\n",
        )
        .unwrap();
        std::fs::write(
            tmp.path().join(".mcp.json"),
            r#"{"a": {"command": "run", "env": {
                "K1": "${__MCP_RT_TEST_DOTENV_KEY__}",
                "K2": "${__MCP_RT_TEST_PRESET__}"
            }}}"#,
        )
        .unwrap();
        std::env::remove_var("__MCP_RT_TEST_DOTENV_KEY__");
        std::env::set_var("__MCP_RT_TEST_PRESET__", "from_process");

        let config = resolve_configuration_in(tmp.path()).unwrap();
        let spec = spec_named(&config, "a");
        assert_eq!(spec.env["K1"], "from_file");
        assert_eq!(spec.env["K2"], "from_process");

        std::env::remove_var("__MCP_RT_TEST_DOTENV_KEY__");
        std::env::remove_var("__MCP_RT_TEST_PRESET__");
    }

    #[test]
    #[serial]
    fn test_project_root_env_override() {
        std::env::set_var(PROJECT_ROOT_ENV, "/some/where");
        assert_eq!(project_root(), PathBuf::from("/some/where"));
        std::env::remove_var(PROJECT_ROOT_ENV);
        assert_eq!(project_root(), std::env::current_dir().unwrap());
    }
}

//! `mcp-call` — invoke one tool on the configured MCP servers.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use mcp_runtime::mcp_client::{get_instance, get_or_init_instance, McpError, SessionManager};

#[derive(Parser, Debug)]
#[command(name = "mcp-call", version, about = "Invoke a tool on the configured MCP servers")]
struct Cli {
    /// Tool name, bare (`perplexity_ask`) or qualified (`perplexity__perplexity_ask`)
    #[arg(required_unless_present = "list")]
    tool: Option<String>,

    /// Tool arguments as a JSON object
    #[arg(long, default_value = "{}")]
    args: String,

    /// Call timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Directory holding .mcp.json / mcp_config.json
    #[arg(long, env = "MCP_PROJECT_ROOT")]
    root: Option<PathBuf>,

    /// List available tools and the servers providing them
    #[arg(long)]
    list: bool,

    /// Print the raw MCP result instead of its structured content
    #[arg(long)]
    raw: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    mcp_runtime::init_tracing(cli.log_json);

    let manager = match &cli.root {
        Some(root) => {
            let root = root.clone();
            get_or_init_instance(move || SessionManager::for_project(root))
        }
        None => get_instance(),
    };

    let outcome = run(&cli, &manager).await;

    let report = manager.cleanup().await;
    for (server, e) in &report.failures {
        tracing::warn!(server = %server, error = %e, "server did not shut down cleanly");
    }

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            match e.downcast_ref::<McpError>() {
                Some(mcp_err) => {
                    if let Some(hint) = mcp_err.guidance() {
                        eprintln!("hint: {hint}");
                    }
                    ExitCode::from(exit_code(mcp_err))
                }
                None => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(cli: &Cli, manager: &SessionManager) -> anyhow::Result<()> {
    if cli.list {
        manager.ensure_ready().await?;
        for (tool, server) in manager.tools() {
            println!("{tool}\t{server}");
        }
        return Ok(());
    }

    let tool = cli.tool.as_deref().context("a tool name is required")?;
    let arguments: serde_json::Value =
        serde_json::from_str(&cli.args).context("--args is not valid JSON")?;
    anyhow::ensure!(arguments.is_object(), "--args must be a JSON object");

    let result = match cli.timeout_ms {
        Some(ms) => {
            manager
                .call_tool_with_timeout(tool, arguments, Duration::from_millis(ms))
                .await?
        }
        None => manager.call_tool(tool, arguments).await?,
    };

    let output = if cli.raw {
        result.result.clone()
    } else {
        result.structured()
    };
    match output {
        serde_json::Value::String(text) => println!("{text}"),
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }
    Ok(())
}

/// 1 = configuration, 2 = startup, 3 = tool call.
fn exit_code(err: &McpError) -> u8 {
    match err {
        e if e.is_configuration_error() => 1,
        McpError::ServerStartupFailed { .. } | McpError::ManagerUnavailable { .. } => 2,
        _ => 3,
    }
}

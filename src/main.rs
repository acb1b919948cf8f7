//! `mcp-router` binary: loads the configuration, brings up auto-start
//! servers, runs health checks, and shuts everything down on a signal.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;

use mcp_router::config::{find_config_path, load_config};
use mcp_router::{logging, McpRouter};

/// Local router for stdio and HTTP MCP servers
#[derive(Parser)]
#[command(name = "mcp-router")]
#[command(about = "Supervises local MCP servers and routes JSON-RPC calls to them")]
struct Args {
    /// Config file (defaults to $MCP_ROUTER_CONFIG, then the platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr (overrides `router.log_file`)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Validate the configuration, print the server list and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = find_config_path(args.config.as_deref())?;
    let config = load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let log_file = args
        .log_file
        .clone()
        .or_else(|| config.router.log_file.as_deref().map(PathBuf::from))
        .map(|path| resolve_log_path(&path));
    logging::init_tracing(log_file.as_deref(), args.json_logs)
        .context("initializing logging")?;

    let router = McpRouter::from_config(config).context("building router")?;
    tracing::info!(
        config = %config_path.display(),
        servers = router.registry().len(),
        "configuration loaded"
    );

    if args.check {
        println!("{}", serde_json::to_string_pretty(&router.list_servers())?);
        return Ok(());
    }

    let failures = router.start_all().await;
    if !failures.is_empty() {
        tracing::warn!(failed = failures.len(), "some servers failed to start");
    }
    router.start_health_checks();

    wait_for_shutdown().await?;

    tracing::info!("shutting down");
    router.shutdown_all().await;
    Ok(())
}

/// Bare file names go to the platform log directory.
fn resolve_log_path(path: &Path) -> PathBuf {
    if path.components().count() == 1 {
        mcp_router::log_dir().join(path)
    } else {
        path.to_path_buf()
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("waiting for Ctrl-C")?,
        _ = terminate.recv() => tracing::info!("received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")
}

//! MCP server over standard input/output
//!
//! Logs go to stderr; stdout carries only line-framed JSON-RPC.

use chatstack::api::AppState;
use chatstack::config::AppConfig;
use chatstack::mcp::stdio;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match std::env::var("CHATSTACK_CONFIG") {
        Ok(path) => AppConfig::from_file(&path)?,
        Err(_) => AppConfig::default(),
    };
    config.validate()?;

    let state = AppState::new(&config).await?;
    stdio::serve(state.mcp_server()).await?;
    Ok(())
}

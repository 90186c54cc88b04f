//! Service entrypoint: REST API plus the MCP HTTP/SSE transport

use chatstack::api::{self, AppState};
use chatstack::config::AppConfig;
use chatstack::mcp::http::{self, McpHttpState};
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    config.validate()?;

    let state = AppState::new(&config).await?;
    info!(version = chatstack::VERSION, "chatstack starting");

    let mcp_state = McpHttpState::new(state.mcp_server(), config.mcp_http.clone());

    let api_host = config.api.host.clone();
    let api_port = config.api.port;

    tokio::select! {
        result = api::serve(state, &api_host, api_port) => result?,
        result = http::serve(mcp_state) => result?,
    }

    Ok(())
}

fn load_config() -> anyhow::Result<AppConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CHATSTACK_CONFIG").ok());

    match path {
        Some(path) if Path::new(&path).exists() => {
            info!(path = %path, "Loading configuration file");
            AppConfig::from_file(&path)
        }
        Some(path) => Err(anyhow::anyhow!("config file not found: {path}")),
        None => Ok(AppConfig::default()),
    }
}

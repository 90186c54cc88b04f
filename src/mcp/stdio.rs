//! Line-framed MCP transport over standard input/output
//!
//! One JSON object per line in each direction; the loop runs until
//! end-of-input. Notifications produce no output line.

use super::McpServer;
use crate::error::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

/// Serve MCP over stdio until stdin closes.
pub async fn serve(server: Arc<McpServer>) -> Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    info!("MCP stdio transport ready");

    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        if let Some(response) = server.handle_line(&line).await {
            stdout.write_all(response.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
    }

    debug!("MCP stdio transport closed");
    Ok(())
}

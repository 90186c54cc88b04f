//! Retrieval-augmented chat service library
//!
//! A retrieval-augmented chat service that integrates:
//! - Document ingestion (PDF, DOCX, Markdown, plain text) with chunking
//!   and embedding generation
//! - Pluggable vector stores (Qdrant over gRPC, MongoDB vector search,
//!   in-memory) behind one capability surface
//! - Chat orchestration across four provider families with retrieval
//!   context, tool calling, and persistent conversations
//! - An embedded SQLite metadata store with encrypted settings
//! - An MCP server over stdio and HTTP/SSE
//!
//! # Example
//!
//! ```rust,no_run
//! use chatstack::api::AppState;
//! use chatstack::config::AppConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::default();
//!     config.validate()?;
//!
//!     let state = AppState::new(&config).await?;
//!     chatstack::api::serve(state, &config.api.host, config.api.port).await?;
//!     Ok(())
//! }
//! ```

pub mod analytics;
pub mod api;
pub mod chat;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod mcp;
pub mod ollama;
pub mod realtime;
pub mod tools;
pub mod vector;

// Re-export main types
pub use analytics::AnalyticsService;
pub use api::AppState;
pub use chat::{ChatOrchestrator, ChatReply, ChatRequest};
pub use config::{AppConfig, EmbeddingProvider, VectorStoreProvider};
pub use db::{Database, SettingsStore};
pub use embedding::EmbeddingClient;
pub use error::{AppError, Result};
pub use ingest::{IngestSource, IngestionOutcome, IngestionPipeline, TokenEstimator};
pub use llm::{ChatModel, KernelFactory, ProviderKind};
pub use mcp::McpServer;
pub use realtime::RealtimeHub;
pub use tools::ToolRegistry;
pub use vector::{VectorPoint, VectorStore};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with(char::is_numeric));
    }
}

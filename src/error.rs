//! Error handling for the chat service

use thiserror::Error;

/// Result type alias for the chat service
pub type Result<T> = std::result::Result<T, AppError>;

/// Main error type for the chat service
#[derive(Error, Debug)]
pub enum AppError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Vector store error: {0}")]
    Vector(#[from] VectorError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("MCP error: {0}")]
    Mcp(#[from] McpError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing configuration: {0}")]
    ConfigMissing(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Agent tool loop exceeded {max_iterations} iterations")]
    AgentIterationCap { max_iterations: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

/// Errors from chat and embedding providers
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Provider unreachable after retries: {0}")]
    ProviderUnavailable(String),

    #[error("Provider returned an error: {0}")]
    ProviderFailed(String),

    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Rate limited")]
    RateLimited,

    #[error("Timeout: operation took too long")]
    Timeout,
}

/// Errors from vector store backends
#[derive(Error, Debug)]
pub enum VectorError {
    #[error("Vector store unreachable: {0}")]
    BackendUnavailable(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Invalid embedding dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Search failed: {0}")]
    SearchFailed(String),

    #[error("Upsert failed: {0}")]
    UpsertFailed(String),
}

/// Document parse failures carried as values by the parser layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Corrupt input: {0}")]
    CorruptInput(String),

    #[error("Document is empty")]
    Empty,

    #[error("No text remained after walking the document")]
    EmptyDocument,

    #[error("Document too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },
}

/// Errors on the MCP surface
#[derive(Error, Debug)]
pub enum McpError {
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl AppError {
    /// Check if the error is worth retrying at the client layer
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Llm(LlmError::Timeout)
                | AppError::Llm(LlmError::ConnectionFailed(_))
                | AppError::Llm(LlmError::RateLimited)
                | AppError::Vector(VectorError::BackendUnavailable(_))
                | AppError::Http(_)
        )
    }

    /// Error kind name used for usage metrics and JSON error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) | AppError::Mcp(McpError::ResourceNotFound(_)) => "NotFound",
            AppError::Validation(_) | AppError::Mcp(McpError::InvalidParameters(_)) => {
                "ValidationFailed"
            }
            AppError::Llm(LlmError::ProviderUnavailable(_))
            | AppError::Llm(LlmError::ConnectionFailed(_))
            | AppError::Llm(LlmError::Timeout) => "ProviderUnavailable",
            AppError::Llm(_) => "ProviderFailed",
            AppError::Vector(_) => "BackendUnavailable",
            AppError::Cancelled => "Cancelled",
            AppError::AgentIterationCap { .. } => "AgentIterationCap",
            AppError::ConfigMissing(_) => "ConfigMissing",
            _ => "Internal",
        }
    }

    /// HTTP status for the REST surface
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            "NotFound" => 404,
            "ValidationFailed" => 400,
            "ProviderUnavailable" | "ProviderFailed" => 502,
            "BackendUnavailable" => 503,
            "Cancelled" => 499,
            "AgentIterationCap" => 422,
            "ConfigMissing" => 424,
            _ => 500,
        }
    }

    /// Error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            AppError::Llm(_) => "llm",
            AppError::Vector(_) => "vector",
            AppError::Parse(_) => "parse",
            AppError::Mcp(_) => "mcp",
            AppError::Config(_) | AppError::ConfigMissing(_) => "config",
            AppError::Validation(_) => "validation",
            AppError::NotFound(_) => "not_found",
            AppError::Cancelled => "cancelled",
            AppError::AgentIterationCap { .. } => "agent",
            AppError::Io(_) => "io",
            AppError::Serialization(_) => "serialization",
            AppError::Http(_) => "http",
            AppError::Database(_) => "database",
            AppError::Generic(_) => "generic",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let timeout_error = AppError::Llm(LlmError::Timeout);
        assert!(timeout_error.is_retryable());

        let config_error = AppError::Config("invalid config".to_string());
        assert!(!config_error.is_retryable());
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(AppError::NotFound("x".into()).kind(), "NotFound");
        assert_eq!(AppError::NotFound("x".into()).http_status(), 404);

        let cap = AppError::AgentIterationCap { max_iterations: 5 };
        assert_eq!(cap.kind(), "AgentIterationCap");
        assert_eq!(cap.http_status(), 422);

        let missing = AppError::ConfigMissing("OPENAI_API_KEY".into());
        assert_eq!(missing.kind(), "ConfigMissing");
        assert_eq!(missing.http_status(), 424);

        let upstream = AppError::Llm(LlmError::ProviderFailed("boom".into()));
        assert_eq!(upstream.kind(), "ProviderFailed");
        assert_eq!(upstream.http_status(), 502);
    }

    #[test]
    fn test_parse_empty_variants_are_distinct() {
        // A parser that produced nothing and a chunker walk that produced
        // nothing are separate conditions
        assert_ne!(ParseError::Empty, ParseError::EmptyDocument);
        assert_ne!(
            ParseError::Empty.to_string(),
            ParseError::EmptyDocument.to_string()
        );
    }

    #[test]
    fn test_error_category() {
        let llm_error = AppError::Llm(LlmError::Timeout);
        assert_eq!(llm_error.category(), "llm");

        let vector_error = AppError::Vector(VectorError::SearchFailed("down".into()));
        assert_eq!(vector_error.category(), "vector");
    }
}

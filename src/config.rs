//! Configuration management for the chat service

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration for the chat service
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Metadata store configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Vector store configuration
    #[serde(default)]
    pub vector_store: VectorStoreConfig,

    /// Embedding client configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Local model server (Ollama) configuration
    #[serde(default)]
    pub ollama: OllamaConfig,

    /// Chat provider dispatch configuration
    #[serde(default)]
    pub chat: ChatConfig,

    /// REST API bind configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// MCP HTTP/SSE transport configuration
    #[serde(default)]
    pub mcp_http: McpHttpConfig,

    /// Realtime hub configuration
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

/// Metadata store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// Passphrase used to derive the key for encrypted settings
    #[serde(default = "default_settings_passphrase")]
    pub settings_passphrase: String,
}

fn default_database_path() -> PathBuf {
    // Containers mount persistent state under /app/data
    if Path::new("/app").is_dir() {
        PathBuf::from("/app/data/knowledge.db")
    } else {
        PathBuf::from("data/knowledge.db")
    }
}

fn default_settings_passphrase() -> String {
    std::env::var("CHATSTACK_SETTINGS_KEY").unwrap_or_else(|_| "chatstack-local".to_string())
}

/// Which vector store backend to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorStoreProvider {
    Qdrant,
    MongoDB,
    InMemory,
}

impl Default for VectorStoreProvider {
    fn default() -> Self {
        Self::Qdrant
    }
}

/// Vector store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    /// Backend selection
    #[serde(default)]
    pub provider: VectorStoreProvider,

    /// Qdrant connection settings
    #[serde(default)]
    pub qdrant: QdrantConfig,

    /// MongoDB connection settings
    #[serde(default)]
    pub mongo: MongoConfig,

    /// Search timeout in seconds
    #[serde(default = "default_search_timeout")]
    pub search_timeout_secs: u64,
}

/// Qdrant connection settings; the data port speaks gRPC, the health port REST
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QdrantConfig {
    #[serde(default = "default_qdrant_host")]
    pub host: String,

    /// gRPC data port
    #[serde(default = "default_qdrant_port")]
    pub port: u16,

    /// REST port used for health probes
    #[serde(default = "default_qdrant_health_port")]
    pub health_port: u16,

    #[serde(default)]
    pub api_key: Option<String>,
}

/// MongoDB connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoConfig {
    #[serde(default = "default_mongo_uri")]
    pub connection_string: String,

    #[serde(default = "default_mongo_database")]
    pub database: String,

    /// Seconds to wait for a vector search index to report Ready
    #[serde(default = "default_mongo_index_wait")]
    pub index_ready_timeout_secs: u64,
}

fn default_qdrant_host() -> String {
    "localhost".to_string()
}

fn default_qdrant_port() -> u16 {
    6334
}

fn default_qdrant_health_port() -> u16 {
    6333
}

fn default_mongo_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_mongo_database() -> String {
    "knowledge".to_string()
}

fn default_mongo_index_wait() -> u64 {
    120
}

fn default_search_timeout() -> u64 {
    10
}

/// Which embedding provider is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbeddingProvider {
    Ollama,
    OpenAi,
}

impl Default for EmbeddingProvider {
    fn default() -> Self {
        Self::Ollama
    }
}

/// Embedding client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider selection
    #[serde(default)]
    pub provider: EmbeddingProvider,

    /// Model served by Ollama
    #[serde(default = "default_ollama_embedding_model")]
    pub ollama_model: String,

    /// Hosted embedding model
    #[serde(default = "default_openai_embedding_model")]
    pub openai_model: String,

    /// Output dimension of the configured model
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Texts per request
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,

    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    /// Retry attempts on transient failures
    #[serde(default = "default_embedding_attempts")]
    pub max_attempts: u32,
}

fn default_ollama_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_openai_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimension() -> usize {
    768
}

fn default_embedding_batch_size() -> usize {
    16
}

fn default_embedding_timeout() -> u64 {
    30
}

fn default_embedding_attempts() -> u32 {
    4
}

/// Local model server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Ollama server URL
    #[serde(default = "default_ollama_url")]
    pub base_url: String,

    /// Default chat model when the request names none
    #[serde(default = "default_ollama_chat_model")]
    pub default_model: String,
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_chat_model() -> String {
    "llama3.2".to_string()
}

/// Chat provider dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Provider completion timeout in seconds
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_secs: u64,

    /// Maximum tokens requested from providers
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_provider_timeout() -> u64 {
    120
}

fn default_max_tokens() -> u32 {
    4096
}

/// REST API bind configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8080
}

/// MCP HTTP/SSE transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpHttpConfig {
    #[serde(default = "default_api_host")]
    pub host: String,

    #[serde(default = "default_mcp_port")]
    pub port: u16,

    /// Idle session timeout in minutes
    #[serde(default = "default_session_timeout")]
    pub session_timeout_minutes: u64,

    /// Cross-origin policy; installed before routing
    #[serde(default)]
    pub cors: CorsConfig,

    /// Optional bearer-token validation
    #[serde(default)]
    pub oauth: OAuthConfig,
}

fn default_mcp_port() -> u16 {
    8090
}

fn default_session_timeout() -> u64 {
    30
}

/// Cross-origin allow-list
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub allowed_origins: Vec<String>,

    #[serde(default)]
    pub allow_credentials: bool,
}

/// Bearer-token validation against an external authorization server
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OAuthConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub authorization_server_url: Option<String>,

    #[serde(default)]
    pub required_scopes: Vec<String>,
}

/// Realtime hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Outbound queue bound per subscriber; a full queue drops the connection
    #[serde(default = "default_realtime_queue")]
    pub max_queue: usize,
}

fn default_realtime_queue() -> usize {
    256
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            settings_passphrase: default_settings_passphrase(),
        }
    }
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            provider: VectorStoreProvider::default(),
            qdrant: QdrantConfig::default(),
            mongo: MongoConfig::default(),
            search_timeout_secs: default_search_timeout(),
        }
    }
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            host: default_qdrant_host(),
            port: default_qdrant_port(),
            health_port: default_qdrant_health_port(),
            api_key: None,
        }
    }
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            connection_string: default_mongo_uri(),
            database: default_mongo_database(),
            index_ready_timeout_secs: default_mongo_index_wait(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::default(),
            ollama_model: default_ollama_embedding_model(),
            openai_model: default_openai_embedding_model(),
            dimension: default_embedding_dimension(),
            batch_size: default_embedding_batch_size(),
            timeout_secs: default_embedding_timeout(),
            max_attempts: default_embedding_attempts(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            default_model: default_ollama_chat_model(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider_timeout_secs: default_provider_timeout(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

impl Default for McpHttpConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_mcp_port(),
            session_timeout_minutes: default_session_timeout(),
            cors: CorsConfig::default(),
            oauth: OAuthConfig::default(),
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            max_queue: default_realtime_queue(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let config = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yml::from_str(&content)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") => toml::to_string(self)?,
            Some("yaml") | Some("yml") => serde_yml::to_string(self)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.ollama.base_url.starts_with("http") {
            return Err(anyhow::anyhow!(
                "Invalid Ollama URL: {}",
                self.ollama.base_url
            ));
        }

        if self.embedding.dimension == 0 {
            return Err(anyhow::anyhow!(
                "Embedding dimension must be greater than 0"
            ));
        }

        if self.embedding.batch_size == 0 {
            return Err(anyhow::anyhow!("Embedding batch size must be at least 1"));
        }

        if self.vector_store.provider == VectorStoreProvider::MongoDB
            && !self.vector_store.mongo.connection_string.starts_with("mongodb")
        {
            return Err(anyhow::anyhow!(
                "Invalid MongoDB connection string: {}",
                self.vector_store.mongo.connection_string
            ));
        }

        if self.mcp_http.oauth.enabled && self.mcp_http.oauth.authorization_server_url.is_none() {
            return Err(anyhow::anyhow!(
                "OAuth is enabled but no authorization server URL is configured"
            ));
        }

        Ok(())
    }

    /// Qdrant gRPC endpoint
    pub fn qdrant_grpc_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.vector_store.qdrant.host, self.vector_store.qdrant.port
        )
    }

    /// Qdrant REST endpoint used by health probes
    pub fn qdrant_health_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.vector_store.qdrant.host, self.vector_store.qdrant.health_port
        )
    }
}

/// Environment variable holding the API key for a provider, if any
pub fn api_key_env_var(provider: &str) -> Option<&'static str> {
    match provider {
        "OpenAi" => Some("OPENAI_API_KEY"),
        "Anthropic" => Some("ANTHROPIC_API_KEY"),
        "Google" => Some("GEMINI_API_KEY"),
        _ => None,
    }
}

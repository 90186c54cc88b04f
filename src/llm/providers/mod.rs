//! Chat provider implementations
//!
//! Concrete handles for the four provider families.

pub mod anthropic;
pub mod base;
pub mod google;
pub mod ollama;
pub mod openai;

// Re-export commonly used types
pub use anthropic::AnthropicProvider;
pub use base::HttpProviderClient;
pub use google::GoogleProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

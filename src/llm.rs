//! Chat provider types and the per-provider kernel capability

pub mod factory;
pub mod providers;

use crate::error::Result;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

pub use factory::KernelFactory;

/// Supported chat provider families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Google,
    Ollama,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "OpenAi",
            Self::Anthropic => "Anthropic",
            Self::Google => "Google",
            Self::Ollama => "Ollama",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "OpenAi" | "openai" | "OpenAI" => Some(Self::OpenAi),
            "Anthropic" | "anthropic" => Some(Self::Anthropic),
            "Google" | "google" | "Gemini" => Some(Self::Google),
            "Ollama" | "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "system" => Self::System,
            "assistant" => Self::Assistant,
            "tool" => Self::Tool,
            _ => Self::User,
        }
    }
}

/// A message in a provider conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,

    /// Tool invocations requested by the assistant, if any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// For tool-role messages: which call this result answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// A tool the provider may invoke
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// One tool invocation requested by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Result of a completion
#[derive(Debug, Clone)]
pub struct Completion {
    pub reply: String,
    pub model: String,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub tool_calls: Vec<ToolCall>,
}

/// One streaming increment; `done` carries final token usage when the
/// provider reports it
#[derive(Debug, Clone, Default)]
pub struct StreamDelta {
    pub text: String,
    pub done: bool,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

impl StreamDelta {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn finished(prompt_tokens: Option<u32>, completion_tokens: Option<u32>) -> Self {
        Self {
            done: true,
            prompt_tokens,
            completion_tokens,
            ..Default::default()
        }
    }
}

/// Finite, non-restartable sequence of streaming deltas
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta>> + Send>>;

/// Per-provider execution settings, read from the settings store when a
/// handle is created
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub max_tokens: u32,
    pub stop_sequences: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            stop_sequences: Vec::new(),
            timeout_secs: 120,
        }
    }
}

/// A chat handle for one provider+model pair
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn provider(&self) -> ProviderKind;

    fn model(&self) -> &str;

    /// Whether the handle can accept a tool set. For the local model server
    /// this is probed from model metadata and cached per model.
    async fn supports_tools(&self) -> bool;

    /// Single-shot completion.
    async fn complete(
        &self,
        history: &[ChatMessage],
        temperature: f32,
        tools: &[ToolSpec],
    ) -> Result<Completion>;

    /// Lazy sequence of text deltas. Providers without native streaming
    /// fall back to a single-shot completion and synthesize one final delta.
    async fn complete_streaming(
        &self,
        history: &[ChatMessage],
        temperature: f32,
    ) -> Result<DeltaStream>;
}

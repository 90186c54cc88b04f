//! Anthropic provider implementation
//!
//! Anthropic uses a different message format than OpenAI: the system prompt
//! travels out-of-band, tool invocations are `tool_use` content blocks, and
//! tool results go back as `tool_result` blocks on a user message.

use crate::error::{LlmError, Result};
use crate::llm::providers::base::{sse_data, HttpProviderClient};
use crate::llm::{
    ChatMessage, ChatModel, Completion, DeltaStream, ExecutionSettings, ProviderKind, Role,
    StreamDelta, ToolCall, ToolSpec,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: HttpProviderClient,
    api_key: String,
    base_url: String,
    model: String,
    settings: ExecutionSettings,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: Option<String>,
    content: Vec<ContentBlock>,
    usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: Option<StreamEventDelta>,
    #[serde(default)]
    message: Option<StreamEventMessage>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
struct StreamEventDelta {
    #[serde(rename = "type")]
    delta_type: Option<String>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamEventMessage {
    usage: Option<UsageInfo>,
}

impl AnthropicProvider {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        model: String,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            client: HttpProviderClient::new(settings.timeout_secs),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            model,
            settings,
        }
    }

    fn url(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }

    fn headers(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("x-api-key", self.api_key.as_str()),
            ("anthropic-version", ANTHROPIC_VERSION),
        ]
    }

    /// Fold the history into Anthropic's shape: system extracted, tool
    /// results as `tool_result` blocks on user messages.
    fn request_body(
        &self,
        history: &[ChatMessage],
        temperature: f32,
        tools: &[ToolSpec],
        stream: bool,
    ) -> serde_json::Value {
        let system = history
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let mut messages = Vec::new();
        for message in history.iter().filter(|m| m.role != Role::System) {
            match message.role {
                Role::Assistant if !message.tool_calls.is_empty() => {
                    let mut blocks = Vec::new();
                    if !message.content.is_empty() {
                        blocks.push(json!({"type": "text", "text": message.content}));
                    }
                    for call in &message.tool_calls {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": call.arguments,
                        }));
                    }
                    messages.push(json!({"role": "assistant", "content": blocks}));
                }
                Role::Tool => {
                    messages.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": message.tool_call_id,
                            "content": message.content,
                        }]
                    }));
                }
                Role::Assistant => {
                    messages.push(json!({"role": "assistant", "content": message.content}));
                }
                _ => {
                    messages.push(json!({"role": "user", "content": message.content}));
                }
            }
        }

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.settings.max_tokens,
            "temperature": temperature,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if !self.settings.stop_sequences.is_empty() {
            body["stop_sequences"] = json!(self.settings.stop_sequences);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools
                .iter()
                .map(|tool| json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.input_schema,
                }))
                .collect::<Vec<_>>());
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }
}

#[async_trait]
impl ChatModel for AnthropicProvider {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn supports_tools(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        history: &[ChatMessage],
        temperature: f32,
        tools: &[ToolSpec],
    ) -> Result<Completion> {
        debug!(model = %self.model, messages = history.len(), "Anthropic completion");

        let body = self.request_body(history, temperature, tools, false);
        let response: MessagesResponse = self
            .client
            .post_json(&self.url(), &body, self.headers())
            .await?;

        if response.content.is_empty() {
            return Err(LlmError::InvalidResponse("no content in response".to_string()).into());
        }

        let mut reply = String::new();
        let mut tool_calls = Vec::new();
        for block in response.content {
            match block {
                ContentBlock::Text { text } => {
                    if !reply.is_empty() {
                        reply.push('\n');
                    }
                    reply.push_str(&text);
                }
                ContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall {
                        id,
                        name,
                        arguments: input,
                    });
                }
            }
        }

        Ok(Completion {
            reply,
            model: response.model.unwrap_or_else(|| self.model.clone()),
            prompt_tokens: response.usage.as_ref().and_then(|u| u.input_tokens),
            completion_tokens: response.usage.as_ref().and_then(|u| u.output_tokens),
            tool_calls,
        })
    }

    async fn complete_streaming(
        &self,
        history: &[ChatMessage],
        temperature: f32,
    ) -> Result<DeltaStream> {
        let body = self.request_body(history, temperature, &[], true);
        let mut lines = self
            .client
            .post_lines(&self.url(), &body, self.headers())
            .await?;

        let stream = async_stream::try_stream! {
            use futures::StreamExt;

            let mut prompt_tokens = None;
            let mut completion_tokens = None;

            while let Some(line) = lines.next().await {
                let line = line?;
                let Some(data) = sse_data(&line) else { continue };
                let event: StreamEvent = match serde_json::from_str(data) {
                    Ok(event) => event,
                    Err(_) => continue,
                };

                match event.event_type.as_str() {
                    "message_start" => {
                        if let Some(usage) = event.message.and_then(|m| m.usage) {
                            prompt_tokens = usage.input_tokens;
                        }
                    }
                    "content_block_delta" => {
                        if let Some(delta) = event.delta {
                            if delta.delta_type.as_deref() == Some("text_delta") {
                                if let Some(text) = delta.text {
                                    if !text.is_empty() {
                                        yield StreamDelta::text(text);
                                    }
                                }
                            }
                        }
                    }
                    "message_delta" => {
                        if let Some(usage) = event.usage {
                            completion_tokens = usage.output_tokens;
                        }
                    }
                    "message_stop" => break,
                    _ => {}
                }
            }

            yield StreamDelta::finished(prompt_tokens, completion_tokens);
        };

        Ok(Box::pin(stream))
    }
}

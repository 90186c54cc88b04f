//! Local model server (Ollama) provider implementation
//!
//! Chat goes through `/api/chat` with NDJSON streaming. Whether a model can
//! accept tools is probed once from `/api/show` metadata and cached for the
//! lifetime of the handle (handles themselves are cached per model).

use crate::error::{LlmError, Result};
use crate::llm::providers::base::HttpProviderClient;
use crate::llm::{
    ChatMessage, ChatModel, Completion, DeltaStream, ExecutionSettings, ProviderKind,
    StreamDelta, ToolCall, ToolSpec,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct OllamaProvider {
    client: HttpProviderClient,
    base_url: String,
    model: String,
    settings: ExecutionSettings,
    tool_support: OnceCell<bool>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: Option<String>,
    message: Option<ResponseMessage>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StreamLine {
    message: Option<ResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ShowResponse {
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    template: Option<String>,
}

impl OllamaProvider {
    pub fn new(base_url: String, model: String, settings: ExecutionSettings) -> Self {
        Self {
            client: HttpProviderClient::new(settings.timeout_secs),
            base_url,
            model,
            settings,
            tool_support: OnceCell::new(),
        }
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/api/{}", self.base_url.trim_end_matches('/'), endpoint)
    }

    fn request_body(
        &self,
        history: &[ChatMessage],
        temperature: f32,
        tools: &[ToolSpec],
        stream: bool,
    ) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = history
            .iter()
            .map(|message| {
                let mut wire = json!({
                    "role": message.role.as_str(),
                    "content": message.content,
                });
                if !message.tool_calls.is_empty() {
                    wire["tool_calls"] = json!(message
                        .tool_calls
                        .iter()
                        .map(|call| json!({
                            "function": {"name": call.name, "arguments": call.arguments}
                        }))
                        .collect::<Vec<_>>());
                }
                wire
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
            "options": {
                "temperature": temperature,
                "num_predict": self.settings.max_tokens,
            },
        });
        if !self.settings.stop_sequences.is_empty() {
            body["options"]["stop"] = json!(self.settings.stop_sequences);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools
                .iter()
                .map(|tool| json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                }))
                .collect::<Vec<_>>());
        }
        body
    }

    async fn probe_tool_support(&self) -> bool {
        let body = json!({ "model": self.model });
        let response: Result<ShowResponse> = self
            .client
            .post_json(&self.api_url("show"), &body, vec![])
            .await;

        match response {
            Ok(show) => {
                show.capabilities.iter().any(|c| c == "tools")
                    || show
                        .template
                        .as_deref()
                        .is_some_and(|t| t.contains(".Tools"))
            }
            Err(e) => {
                warn!(model = %self.model, error = %e, "Tool-support probe failed; assuming none");
                false
            }
        }
    }
}

fn parse_tool_calls(calls: Vec<WireToolCall>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .map(|call| ToolCall {
            id: Uuid::new_v4().to_string(),
            name: call.function.name,
            arguments: call.function.arguments,
        })
        .collect()
}

#[async_trait]
impl ChatModel for OllamaProvider {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn supports_tools(&self) -> bool {
        *self
            .tool_support
            .get_or_init(|| self.probe_tool_support())
            .await
    }

    async fn complete(
        &self,
        history: &[ChatMessage],
        temperature: f32,
        tools: &[ToolSpec],
    ) -> Result<Completion> {
        debug!(model = %self.model, messages = history.len(), "Ollama completion");

        let body = self.request_body(history, temperature, tools, false);
        let response: ChatResponse = self
            .client
            .post_json(&self.api_url("chat"), &body, vec![])
            .await?;

        let message = response
            .message
            .ok_or_else(|| LlmError::InvalidResponse("no message in response".to_string()))?;

        Ok(Completion {
            reply: message.content,
            model: response.model.unwrap_or_else(|| self.model.clone()),
            prompt_tokens: response.prompt_eval_count,
            completion_tokens: response.eval_count,
            tool_calls: parse_tool_calls(message.tool_calls),
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
            .post_lines(&self.api_url("chat"), &body, vec![])
            .await?;

        let stream = async_stream::try_stream! {
            use futures::StreamExt;

            let mut prompt_tokens = None;
            let mut completion_tokens = None;

            while let Some(line) = lines.next().await {
                let line = line?;
                let chunk: StreamLine = match serde_json::from_str(&line) {
                    Ok(chunk) => chunk,
                    Err(_) => continue,
                };

                if let Some(message) = &chunk.message {
                    if !message.content.is_empty() {
                        yield StreamDelta::text(message.content.clone());
                    }
                }
                if chunk.done {
                    prompt_tokens = chunk.prompt_eval_count;
                    completion_tokens = chunk.eval_count;
                    break;
                }
            }

            yield StreamDelta::finished(prompt_tokens, completion_tokens);
        };

        Ok(Box::pin(stream))
    }
}

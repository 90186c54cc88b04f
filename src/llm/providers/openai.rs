//! OpenAI-compatible provider family
//!
//! Speaks `/v1/chat/completions` with function calling and SSE streaming.
//! Any endpoint exposing the same surface works through this handle by
//! overriding the base URL.

use crate::error::{LlmError, Result};
use crate::llm::providers::base::{sse_data, HttpProviderClient};
use crate::llm::{
    ChatMessage, ChatModel, Completion, DeltaStream, ExecutionSettings, ProviderKind, StreamDelta,
    ToolCall, ToolSpec,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

pub struct OpenAiProvider {
    client: HttpProviderClient,
    api_key: String,
    base_url: String,
    model: String,
    settings: ExecutionSettings,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    /// JSON-encoded argument object
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: Option<String>,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDeltaBody,
}

#[derive(Debug, Deserialize)]
struct StreamDeltaBody {
    content: Option<String>,
}

impl OpenAiProvider {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        model: String,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            client: HttpProviderClient::new(settings.timeout_secs),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".to_string()),
            model,
            settings,
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    fn wire_messages(history: &[ChatMessage]) -> Vec<WireMessage> {
        history
            .iter()
            .map(|message| {
                let tool_calls = (!message.tool_calls.is_empty()).then(|| {
                    message
                        .tool_calls
                        .iter()
                        .map(|call| WireToolCall {
                            id: call.id.clone(),
                            call_type: "function".to_string(),
                            function: WireFunction {
                                name: call.name.clone(),
                                arguments: call.arguments.to_string(),
                            },
                        })
                        .collect()
                });

                WireMessage {
                    role: message.role.as_str(),
                    content: (!message.content.is_empty() || message.tool_calls.is_empty())
                        .then(|| message.content.clone()),
                    tool_calls,
                    tool_call_id: message.tool_call_id.clone(),
                }
            })
            .collect()
    }

    fn request_body(
        &self,
        history: &[ChatMessage],
        temperature: f32,
        tools: &[ToolSpec],
        stream: bool,
    ) -> serde_json::Value {
        let mut body = json!({
            "model": self.model,
            "messages": Self::wire_messages(history),
            "temperature": temperature,
            "max_tokens": self.settings.max_tokens,
        });

        if !self.settings.stop_sequences.is_empty() {
            body["stop"] = json!(self.settings.stop_sequences);
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
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }
}

fn parse_tool_calls(calls: Vec<WireToolCall>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .map(|call| ToolCall {
            id: call.id,
            name: call.function.name,
            arguments: serde_json::from_str(&call.function.arguments)
                .unwrap_or(serde_json::Value::Null),
        })
        .collect()
}

#[async_trait]
impl ChatModel for OpenAiProvider {
    fn provider(&self) -> ProviderKind {
        ProviderKind::OpenAi
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
        debug!(model = %self.model, messages = history.len(), "OpenAI completion");

        let body = self.request_body(history, temperature, tools, false);
        let auth = self.auth_header();
        let response: ChatResponse = self
            .client
            .post_json(&self.url(), &body, vec![("Authorization", auth.as_str())])
            .await?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("no choices in response".to_string()))?;

        Ok(Completion {
            reply: choice.message.content.unwrap_or_default(),
            model: response.model.unwrap_or_else(|| self.model.clone()),
            prompt_tokens: response.usage.as_ref().and_then(|u| u.prompt_tokens),
            completion_tokens: response.usage.as_ref().and_then(|u| u.completion_tokens),
            tool_calls: parse_tool_calls(choice.message.tool_calls),
        })
    }

    async fn complete_streaming(
        &self,
        history: &[ChatMessage],
        temperature: f32,
    ) -> Result<DeltaStream> {
        let body = self.request_body(history, temperature, &[], true);
        let auth = self.auth_header();
        let mut lines = self
            .client
            .post_lines(&self.url(), &body, vec![("Authorization", auth.as_str())])
            .await?;

        let stream = async_stream::try_stream! {
            use futures::StreamExt;

            let mut prompt_tokens = None;
            let mut completion_tokens = None;

            while let Some(line) = lines.next().await {
                let line = line?;
                let Some(data) = sse_data(&line) else { continue };
                if data == "[DONE]" {
                    break;
                }

                let chunk: StreamChunk = match serde_json::from_str(data) {
                    Ok(chunk) => chunk,
                    Err(_) => continue,
                };

                if let Some(usage) = &chunk.usage {
                    prompt_tokens = usage.prompt_tokens;
                    completion_tokens = usage.completion_tokens;
                }
                if let Some(choice) = chunk.choices.first() {
                    if let Some(content) = &choice.delta.content {
                        if !content.is_empty() {
                            yield StreamDelta::text(content.clone());
                        }
                    }
                }
            }

            yield StreamDelta::finished(prompt_tokens, completion_tokens);
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(base_url: String) -> OpenAiProvider {
        OpenAiProvider::new(
            "sk-test".to_string(),
            Some(base_url),
            "gpt-4o-mini".to_string(),
            ExecutionSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_complete_parses_reply_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "gpt-4o-mini"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "gpt-4o-mini",
                "choices": [{"message": {"content": "hello there"}}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 3}
            })))
            .mount(&server)
            .await;

        let completion = provider(server.uri())
            .complete(&[ChatMessage::user("hi")], 0.7, &[])
            .await
            .unwrap();

        assert_eq!(completion.reply, "hello there");
        assert_eq!(completion.prompt_tokens, Some(12));
        assert_eq!(completion.completion_tokens, Some(3));
        assert!(completion.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn test_complete_parses_tool_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call-1",
                        "type": "function",
                        "function": {"name": "search_knowledge", "arguments": "{\"query\":\"B\"}"}
                    }]
                }}]
            })))
            .mount(&server)
            .await;

        let completion = provider(server.uri())
            .complete(
                &[ChatMessage::user("hi")],
                0.7,
                &[ToolSpec {
                    name: "search_knowledge".into(),
                    description: "search".into(),
                    input_schema: json!({"type": "object"}),
                }],
            )
            .await
            .unwrap();

        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].name, "search_knowledge");
        assert_eq!(completion.tool_calls[0].arguments["query"], "B");
    }

    #[tokio::test]
    async fn test_streaming_yields_deltas_then_done() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}\n",
            "data: [DONE]\n"
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let deltas: Vec<StreamDelta> = provider(server.uri())
            .complete_streaming(&[ChatMessage::user("hi")], 0.7)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        let text: String = deltas.iter().map(|d| d.text.as_str()).collect();
        assert_eq!(text, "Hello");
        let last = deltas.last().unwrap();
        assert!(last.done);
        assert_eq!(last.prompt_tokens, Some(5));
        assert_eq!(last.completion_tokens, Some(2));
    }

    #[tokio::test]
    async fn test_upstream_error_maps_to_provider_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .mount(&server)
            .await;

        let err = provider(server.uri())
            .complete(&[ChatMessage::user("hi")], 0.7, &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ProviderFailed");
    }
}

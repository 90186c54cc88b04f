//! Google Gemini provider implementation
//!
//! Gemini is dispatched single-shot via `generateContent`; the streaming
//! surface synthesizes one final delta from the completed reply.

use crate::error::{LlmError, Result};
use crate::llm::providers::base::HttpProviderClient;
use crate::llm::{
    ChatMessage, ChatModel, Completion, DeltaStream, ExecutionSettings, ProviderKind, Role,
    StreamDelta, ToolCall, ToolSpec,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

pub struct GoogleProvider {
    client: HttpProviderClient,
    api_key: String,
    base_url: String,
    model: String,
    settings: ExecutionSettings,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
    #[serde(rename = "functionCall")]
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u32>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u32>,
}

impl GoogleProvider {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        model: String,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            client: HttpProviderClient::new(settings.timeout_secs),
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string()),
            model,
            settings,
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url.trim_end_matches('/'),
            self.model,
            self.api_key
        )
    }

    /// Gemini wants alternating user/model contents with the system prompt
    /// as a separate instruction.
    fn request_body(
        &self,
        history: &[ChatMessage],
        temperature: f32,
        tools: &[ToolSpec],
    ) -> serde_json::Value {
        let system = history
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let contents: Vec<serde_json::Value> = history
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|message| {
                let role = match message.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                json!({"role": role, "parts": [{"text": message.content}]})
            })
            .collect();

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": temperature,
                "maxOutputTokens": self.settings.max_tokens,
            },
        });
        if !system.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        if !self.settings.stop_sequences.is_empty() {
            body["generationConfig"]["stopSequences"] = json!(self.settings.stop_sequences);
        }
        if !tools.is_empty() {
            body["tools"] = json!([{
                "functionDeclarations": tools
                    .iter()
                    .map(|tool| json!({
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }))
                    .collect::<Vec<_>>()
            }]);
        }
        body
    }
}

#[async_trait]
impl ChatModel for GoogleProvider {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Google
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
        debug!(model = %self.model, messages = history.len(), "Gemini completion");

        let body = self.request_body(history, temperature, tools);
        let response: GenerateResponse = self.client.post_json(&self.url(), &body, vec![]).await?;

        let candidate = response
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("no candidates in response".to_string()))?;

        let mut reply = String::new();
        let mut tool_calls = Vec::new();
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(text) = part.text {
                reply.push_str(&text);
            }
            if let Some(call) = part.function_call {
                tool_calls.push(ToolCall {
                    id: Uuid::new_v4().to_string(),
                    name: call.name,
                    arguments: call.args,
                });
            }
        }

        Ok(Completion {
            reply,
            model: self.model.clone(),
            prompt_tokens: response
                .usage_metadata
                .as_ref()
                .and_then(|u| u.prompt_token_count),
            completion_tokens: response
                .usage_metadata
                .as_ref()
                .and_then(|u| u.candidates_token_count),
            tool_calls,
        })
    }

    /// No native streaming path is used; fall back to a single-shot
    /// completion and synthesize one final delta.
    async fn complete_streaming(
        &self,
        history: &[ChatMessage],
        temperature: f32,
    ) -> Result<DeltaStream> {
        let completion = self.complete(history, temperature, &[]).await?;

        let stream = async_stream::try_stream! {
            if !completion.reply.is_empty() {
                yield StreamDelta::text(completion.reply.clone());
            }
            yield StreamDelta::finished(completion.prompt_tokens, completion.completion_tokens);
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(base_url: String) -> GoogleProvider {
        GoogleProvider::new(
            "g-key".to_string(),
            Some(base_url),
            "gemini-2.0-flash".to_string(),
            ExecutionSettings::default(),
        )
    }

    #[test]
    fn test_roles_map_to_user_and_model() {
        let provider = provider("http://localhost".to_string());
        let body = provider.request_body(
            &[
                ChatMessage::system("short answers"),
                ChatMessage::user("q"),
                ChatMessage::assistant("a"),
            ],
            0.2,
            &[],
        );

        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "short answers");
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
    }

    #[tokio::test]
    async fn test_complete_parses_candidates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
            .and(query_param("key", "g-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [{"text": "bonjour"}]}}],
                "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 2}
            })))
            .mount(&server)
            .await;

        let completion = provider(server.uri())
            .complete(&[ChatMessage::user("hi")], 0.7, &[])
            .await
            .unwrap();

        assert_eq!(completion.reply, "bonjour");
        assert_eq!(completion.prompt_tokens, Some(7));
        assert_eq!(completion.completion_tokens, Some(2));
    }

    #[tokio::test]
    async fn test_streaming_synthesizes_single_final_delta() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [{"text": "whole reply"}]}}],
                "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2}
            })))
            .mount(&server)
            .await;

        let deltas: Vec<StreamDelta> = provider(server.uri())
            .complete_streaming(&[ChatMessage::user("hi")], 0.7)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].text, "whole reply");
        assert!(deltas[1].done);
    }

    #[tokio::test]
    async fn test_function_call_parts_become_tool_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [
                    {"functionCall": {"name": "search_knowledge", "args": {"query": "B"}}}
                ]}}]
            })))
            .mount(&server)
            .await;

        let completion = provider(server.uri())
            .complete(&[ChatMessage::user("hi")], 0.7, &[])
            .await
            .unwrap();

        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].name, "search_knowledge");
    }
}

//! Chat orchestration: retrieval, provider dispatch, persistence, metrics

pub mod agent;

use crate::analytics::AnalyticsService;
use crate::db::conversations::conversation_marker;
use crate::db::{Database, UsageMetric};
use crate::embedding::EmbeddingClient;
use crate::error::{AppError, Result};
use crate::ingest::TokenEstimator;
use crate::llm::{ChatMessage, DeltaStream, KernelFactory, ProviderKind, Role, StreamDelta};
use crate::tools::ToolRegistry;
use crate::vector::VectorStore;
use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One chat turn request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub knowledge_id: Option<String>,
    pub message: String,
    /// Negative values mean "use the server default"
    pub temperature: Option<f32>,
    pub strip_markdown: bool,
    pub use_extended_instructions: bool,
    pub conversation_id: Option<String>,
    pub provider: ProviderKind,
    pub model: Option<String>,
    pub use_agent: bool,
}

/// One chat turn reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatReply {
    pub conversation_id: String,
    pub reply: String,
}

/// A streaming turn: the conversation id plus the delta sequence
pub struct StreamingReply {
    pub conversation_id: String,
    pub stream: DeltaStream,
}

/// Turn handler; owns conversation/message and usage-metric writes
pub struct ChatOrchestrator {
    db: Database,
    factory: Arc<KernelFactory>,
    embedder: Arc<dyn EmbeddingClient>,
    vectors: Arc<dyn VectorStore>,
    tools: Arc<ToolRegistry>,
    analytics: Arc<AnalyticsService>,
    tokens: TokenEstimator,
    conversation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ChatOrchestrator {
    pub fn new(
        db: Database,
        factory: Arc<KernelFactory>,
        embedder: Arc<dyn EmbeddingClient>,
        vectors: Arc<dyn VectorStore>,
        tools: Arc<ToolRegistry>,
        analytics: Arc<AnalyticsService>,
        tokens: TokenEstimator,
    ) -> Self {
        Self {
            db,
            factory,
            embedder,
            vectors,
            tools,
            analytics,
            tokens,
            conversation_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Handle one turn end to end.
    pub async fn ask(&self, request: ChatRequest) -> Result<ChatReply> {
        let handle = match self
            .factory
            .handle(request.provider, request.model.as_deref())
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                // No assistant message is persisted, but the failed turn is
                // still accounted for. The metric carries no conversation id
                // since no conversation was touched.
                let mut metric = UsageMetric::start(
                    None,
                    request.provider.as_str(),
                    request.model.as_deref().unwrap_or("unknown"),
                );
                metric.success = false;
                metric.error_kind = Some(e.kind().to_string());
                self.analytics.record_best_effort(&metric).await;
                return Err(e);
            }
        };

        let temperature = self.resolve_temperature(request.temperature).await?;
        let conversation_id = self
            .resolve_conversation(&request, handle.model(), temperature)
            .await?;

        // Two concurrent turns for one conversation never interleave writes
        let lock = self.conversation_lock(&conversation_id).await;
        let _guard = lock.lock().await;

        let messages = self.assemble(&request, &conversation_id).await?;

        let started = Instant::now();
        let mut metric = UsageMetric::start(
            Some(conversation_id.clone()),
            request.provider.as_str(),
            handle.model(),
        );

        let use_agent = request.use_agent && handle.supports_tools().await;
        let dispatch = if use_agent {
            let max_iterations = self
                .db
                .settings()
                .get_i64("AgentMaxIterations", 5)
                .await?
                .max(1) as u32;

            let outcome = agent::run_tool_loop(
                &handle,
                &self.tools,
                messages.clone(),
                temperature,
                max_iterations,
            )
            .await;

            match outcome {
                Ok(outcome) if outcome.capped => {
                    metric.success = false;
                    metric.error_kind = Some("AgentIterationCap".to_string());
                    metric.prompt_tokens = outcome.prompt_tokens as i64;
                    metric.completion_tokens = outcome.completion_tokens as i64;
                    metric.response_time_ms = started.elapsed().as_millis() as i64;

                    // Persist the partial reply with a note, then surface
                    // the cap to the caller.
                    let partial = if outcome.reply.is_empty() {
                        "Tool iteration limit reached before an answer was produced.".to_string()
                    } else {
                        format!(
                            "{}\n\n[Tool iteration limit reached; this answer may be incomplete.]",
                            outcome.reply
                        )
                    };
                    self.persist_turn(&conversation_id, &request.message, &partial)
                        .await?;
                    self.analytics.record_best_effort(&metric).await;
                    return Err(agent::iteration_cap_error(max_iterations));
                }
                other => other.map(|outcome| (outcome.reply, Some(outcome.prompt_tokens), Some(outcome.completion_tokens))),
            }
        } else {
            handle
                .complete(&messages, temperature, &[])
                .await
                .map(|c| (c.reply, c.prompt_tokens, c.completion_tokens))
        };

        let (reply, prompt_tokens, completion_tokens) = match dispatch {
            Ok(result) => result,
            Err(e) => {
                metric.success = false;
                metric.error_kind = Some(e.kind().to_string());
                metric.response_time_ms = started.elapsed().as_millis() as i64;
                self.analytics.record_best_effort(&metric).await;
                return Err(e);
            }
        };

        let reply = if request.strip_markdown {
            strip_markdown(&reply)
        } else {
            reply
        };

        self.persist_turn(&conversation_id, &request.message, &reply)
            .await?;
        self.db
            .conversations()
            .update_provider(&conversation_id, request.provider.as_str(), handle.model())
            .await?;

        metric.prompt_tokens = prompt_tokens
            .map(|t| t as i64)
            .unwrap_or_else(|| self.estimate_tokens(&messages) as i64);
        metric.completion_tokens = completion_tokens
            .map(|t| t as i64)
            .unwrap_or_else(|| self.tokens.count(&reply) as i64);
        metric.response_time_ms = started.elapsed().as_millis() as i64;
        self.analytics.record_best_effort(&metric).await;

        info!(
            conversation_id = %conversation_id,
            provider = %request.provider,
            elapsed_ms = metric.response_time_ms,
            "Chat turn complete"
        );

        Ok(ChatReply {
            conversation_id,
            reply,
        })
    }

    /// Streaming variant: deltas are forwarded in provider order; the
    /// accumulated reply is persisted when the stream finishes, and a metric
    /// is recorded whether it finishes, fails mid-stream, or is cancelled.
    pub async fn ask_streaming(&self, request: ChatRequest) -> Result<StreamingReply> {
        let handle = self
            .factory
            .handle(request.provider, request.model.as_deref())
            .await?;
        let temperature = self.resolve_temperature(request.temperature).await?;
        let conversation_id = self
            .resolve_conversation(&request, handle.model(), temperature)
            .await?;

        let lock = self.conversation_lock(&conversation_id).await;
        let guard = lock.lock_owned().await;

        let messages = self.assemble(&request, &conversation_id).await?;
        let mut provider_stream = handle.complete_streaming(&messages, temperature).await?;

        let db = self.db.clone();
        let analytics = self.analytics.clone();
        let tokens = self.tokens.clone();
        let strip = request.strip_markdown;
        let user_message = request.message.clone();
        let provider = request.provider;
        let model = handle.model().to_string();
        let stream_conversation_id = conversation_id.clone();

        let stream = async_stream::stream! {
            use futures::StreamExt;

            let _guard = guard;
            let started = Instant::now();
            let mut accumulated = String::new();
            // If the caller drops the stream mid-turn, the guard records a
            // cancelled metric and nothing further is written.
            let mut cancel_guard = CancelGuard {
                analytics: analytics.clone(),
                metric: Some(UsageMetric::start(
                    Some(stream_conversation_id.clone()),
                    provider.as_str(),
                    &model,
                )),
            };
            let mut failed: Option<AppError> = None;

            let mut reported_prompt_tokens: Option<u32> = None;
            let mut reported_completion_tokens: Option<u32> = None;

            while let Some(delta) = provider_stream.next().await {
                match delta {
                    Ok(delta) => {
                        if delta.done {
                            reported_prompt_tokens = delta.prompt_tokens;
                            reported_completion_tokens = delta.completion_tokens;
                            break;
                        }
                        accumulated.push_str(&delta.text);
                        yield Ok(delta);
                    }
                    Err(e) => {
                        // Mid-stream failure truncates the reply; the
                        // partial content is still persisted below.
                        failed = Some(e);
                        break;
                    }
                }
            }

            if let Some(mut metric) = cancel_guard.metric.take() {
                let reply = if strip { strip_markdown(&accumulated) } else { accumulated.clone() };
                if let Err(e) = persist_turn_with(&db, &stream_conversation_id, &user_message, &reply, &tokens).await {
                    warn!(error = %e, "Failed to persist streamed turn");
                }

                metric.prompt_tokens = reported_prompt_tokens
                    .map(|t| t as i64)
                    .unwrap_or_else(|| tokens.count(&user_message) as i64);
                metric.completion_tokens = reported_completion_tokens
                    .map(|t| t as i64)
                    .unwrap_or_else(|| tokens.count(&reply) as i64);
                metric.response_time_ms = started.elapsed().as_millis() as i64;

                match failed {
                    Some(e) => {
                        metric.success = false;
                        metric.error_kind = Some(e.kind().to_string());
                        analytics.record_best_effort(&metric).await;
                        yield Err(e);
                    }
                    None => {
                        analytics.record_best_effort(&metric).await;
                        yield Ok(StreamDelta::finished(
                            Some(metric.prompt_tokens as u32),
                            Some(metric.completion_tokens as u32),
                        ));
                    }
                }
            }
        };

        Ok(StreamingReply {
            conversation_id,
            stream: Box::pin(stream),
        })
    }

    /// Coerce negative temperatures to the server default.
    async fn resolve_temperature(&self, requested: Option<f32>) -> Result<f32> {
        match requested {
            Some(t) if t >= 0.0 => Ok(t),
            _ => self.db.settings().get_f32("Temperature", 0.7).await,
        }
    }

    async fn resolve_conversation(
        &self,
        request: &ChatRequest,
        model: &str,
        temperature: f32,
    ) -> Result<String> {
        match &request.conversation_id {
            Some(id) => {
                self.db.conversations().require(id).await?;
                Ok(id.clone())
            }
            None => {
                let id = self
                    .db
                    .conversations()
                    .create(
                        request.provider.as_str(),
                        model,
                        request.knowledge_id.as_deref(),
                        temperature,
                    )
                    .await?;

                // The stored system message carries the base prompt and the
                // conversation marker; per-turn retrieval context is not
                // persisted.
                let base = self.base_prompt(request.use_extended_instructions).await?;
                let system = format!("{base}\n{}", conversation_marker(&id));
                self.db
                    .conversations()
                    .append_message(&id, "system", &system, None)
                    .await?;
                Ok(id)
            }
        }
    }

    async fn base_prompt(&self, extended: bool) -> Result<String> {
        let name = if extended {
            "SystemPromptWithCoding"
        } else {
            "SystemPrompt"
        };
        self.db
            .settings()
            .get_or(name, "You are a helpful assistant.")
            .await
    }

    /// Build the provider message list: fresh system prompt (with retrieval
    /// context), the sliding window, then the new user message.
    async fn assemble(
        &self,
        request: &ChatRequest,
        conversation_id: &str,
    ) -> Result<Vec<ChatMessage>> {
        let base = self.base_prompt(request.use_extended_instructions).await?;
        let mut system = format!("{base}\n{}", conversation_marker(conversation_id));

        if let Some(knowledge_id) = &request.knowledge_id {
            match self.retrieve(knowledge_id, &request.message).await {
                Ok(Some(block)) => {
                    system.push_str("\n\nKnowledge context:\n");
                    system.push_str(&block);
                }
                Ok(None) => {
                    system.push_str(
                        "\n\nNo relevant context was found in the knowledge base for this question.",
                    );
                }
                Err(e) => {
                    // Retrieval failures downgrade to an empty context
                    warn!(knowledge_id = %knowledge_id, error = %e, "Retrieval failed; continuing without context");
                    system.push_str(
                        "\n\nNo relevant context was found in the knowledge base for this question.",
                    );
                }
            }
        }

        let max_turns = self.db.settings().get_i64("ChatMaxTurns", 10).await?.max(1) as usize;
        let window = self
            .db
            .conversations()
            .load_history(conversation_id, max_turns)
            .await?;

        let mut messages = vec![ChatMessage::system(system)];
        for stored in window.iter().filter(|m| m.role != "system") {
            messages.push(ChatMessage::new(
                Role::parse(&stored.role),
                stored.content.clone(),
            ));
        }
        messages.push(ChatMessage::user(request.message.clone()));
        Ok(messages)
    }

    /// Embed the question and fetch the retrieval block, hits formatted as
    /// `(fileName, score, text)` and separated by the configured delimiter.
    async fn retrieve(&self, knowledge_id: &str, message: &str) -> Result<Option<String>> {
        let collection = self.db.knowledge().resolve_collection(knowledge_id).await?;

        let k = self.db.settings().get_i64("Retrieval.K", 8).await?.max(1) as usize;
        let min_score = self.db.settings().get_f32("Retrieval.MinScore", 0.6).await?;
        let delimiter = self
            .db
            .settings()
            .get_or("ContextDelimiter", "\n---\n")
            .await?;

        let vectors = self.embedder.embed(&[message.to_string()]).await?;
        let query = vectors
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Validation("empty embedding response".into()))?;

        let hits = self
            .vectors
            .search(&collection.name, &query, k, Some(min_score))
            .await?;

        if hits.is_empty() {
            return Ok(None);
        }

        debug!(collection = %collection.name, hits = hits.len(), "Retrieved context");
        let block = hits
            .iter()
            .map(|hit| {
                format!(
                    "({}, {:.3}, {})",
                    hit.payload.file_name, hit.score, hit.payload.text
                )
            })
            .collect::<Vec<_>>()
            .join(&delimiter);
        Ok(Some(block))
    }

    async fn persist_turn(&self, conversation_id: &str, user: &str, assistant: &str) -> Result<()> {
        persist_turn_with(&self.db, conversation_id, user, assistant, &self.tokens).await
    }

    fn estimate_tokens(&self, messages: &[ChatMessage]) -> usize {
        messages.iter().map(|m| self.tokens.count(&m.content)).sum()
    }

    async fn conversation_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.conversation_locks.lock().await;
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Records a cancelled-turn metric if the streaming turn is dropped before
/// it completes; completion paths take the metric out first.
struct CancelGuard {
    analytics: Arc<AnalyticsService>,
    metric: Option<UsageMetric>,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(mut metric) = self.metric.take() {
            metric.success = false;
            metric.error_kind = Some("Cancelled".to_string());
            let analytics = self.analytics.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    analytics.record_best_effort(&metric).await;
                });
            }
        }
    }
}

async fn persist_turn_with(
    db: &Database,
    conversation_id: &str,
    user: &str,
    assistant: &str,
    tokens: &TokenEstimator,
) -> Result<()> {
    let conversations = db.conversations();
    conversations
        .append_message(
            conversation_id,
            "user",
            user,
            Some(tokens.count(user) as i64),
        )
        .await?;
    conversations
        .append_message(
            conversation_id,
            "assistant",
            assistant,
            Some(tokens.count(assistant) as i64),
        )
        .await?;
    Ok(())
}

/// Strip markdown formatting from a reply, preserving code fences verbatim.
pub fn strip_markdown(input: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let mut output = String::new();
    let mut in_code = false;

    for event in Parser::new_ext(input, options) {
        match event {
            Event::Start(Tag::CodeBlock(kind)) => {
                in_code = true;
                let language = match kind {
                    CodeBlockKind::Fenced(lang) => lang.to_string(),
                    CodeBlockKind::Indented => String::new(),
                };
                output.push_str(&format!("```{language}\n"));
            }
            Event::End(TagEnd::CodeBlock) => {
                in_code = false;
                if !output.ends_with('\n') {
                    output.push('\n');
                }
                output.push_str("```\n");
            }
            Event::Start(Tag::Item) => output.push_str("- "),
            Event::Text(text) => output.push_str(&text),
            Event::Code(code) => output.push_str(&code),
            Event::SoftBreak | Event::HardBreak => output.push('\n'),
            Event::End(TagEnd::Paragraph)
            | Event::End(TagEnd::Heading(_))
            | Event::End(TagEnd::Item) => {
                if !in_code {
                    output.push('\n');
                }
            }
            _ => {}
        }
    }

    output.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::realtime::RealtimeHub;
    use crate::vector::{InMemoryVectorStore, VectorPayload, VectorPoint};
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::json;
    use sha2::{Digest, Sha256};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct HashEmbedder;

    impl HashEmbedder {
        fn vector_for(text: &str) -> Vec<f32> {
            let digest = Sha256::digest(text.as_bytes());
            (0..8).map(|i| digest[i] as f32 / 255.0).collect()
        }
    }

    #[async_trait]
    impl EmbeddingClient for HashEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| Self::vector_for(t)).collect())
        }

        fn dimension(&self) -> usize {
            8
        }

        fn model(&self) -> &str {
            "hash-embedder"
        }
    }

    async fn orchestrator(ollama_url: &str) -> (ChatOrchestrator, Database, Arc<InMemoryVectorStore>) {
        let db = Database::open_in_memory("pass").await.unwrap();
        db.settings().set("Ollama.BaseUrl", ollama_url).await.unwrap();

        let vectors = Arc::new(InMemoryVectorStore::new());
        let hub = Arc::new(RealtimeHub::new(16));
        let analytics = Arc::new(AnalyticsService::new(db.clone(), hub));
        let embedder: Arc<dyn EmbeddingClient> = Arc::new(HashEmbedder);
        let factory = Arc::new(KernelFactory::new(AppConfig::default(), db.clone()));
        let tools = Arc::new(ToolRegistry::new(
            db.clone(),
            vectors.clone(),
            embedder.clone(),
            analytics.clone(),
        ));

        let orchestrator = ChatOrchestrator::new(
            db.clone(),
            factory,
            embedder,
            vectors.clone(),
            tools,
            analytics,
            TokenEstimator::new("whitespace-test"),
        );
        (orchestrator, db, vectors)
    }

    fn request(message: &str) -> ChatRequest {
        ChatRequest {
            knowledge_id: None,
            message: message.to_string(),
            temperature: Some(-1.0),
            strip_markdown: false,
            use_extended_instructions: false,
            conversation_id: None,
            provider: ProviderKind::Ollama,
            model: Some("llama3.2".to_string()),
            use_agent: false,
        }
    }

    fn mock_reply(reply: &str) -> serde_json::Value {
        json!({
            "model": "llama3.2",
            "message": {"role": "assistant", "content": reply},
            "prompt_eval_count": 9,
            "eval_count": 3,
            "done": true
        })
    }

    #[tokio::test]
    async fn test_turn_persists_messages_and_metric() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_reply("hello back")))
            .mount(&server)
            .await;

        let (orchestrator, db, _) = orchestrator(&server.uri()).await;
        let reply = orchestrator.ask(request("hello")).await.unwrap();
        assert_eq!(reply.reply, "hello back");

        let messages = db.conversations().messages(&reply.conversation_id).await.unwrap();
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant"]);
        let indices: Vec<i64> = messages.iter().map(|m| m.message_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(messages[0].content.contains(&conversation_marker(&reply.conversation_id)));

        let metrics = db.metrics().for_conversation(&reply.conversation_id).await.unwrap();
        assert_eq!(metrics.len(), 1);
        assert!(metrics[0].success);
        assert_eq!(metrics[0].prompt_tokens, 9);
    }

    #[tokio::test]
    async fn test_second_turn_reuses_conversation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_reply("again")))
            .mount(&server)
            .await;

        let (orchestrator, db, _) = orchestrator(&server.uri()).await;
        let first = orchestrator.ask(request("first")).await.unwrap();

        let mut second_request = request("second");
        second_request.conversation_id = Some(first.conversation_id.clone());
        let second = orchestrator.ask(second_request).await.unwrap();
        assert_eq!(second.conversation_id, first.conversation_id);

        let messages = db.conversations().messages(&first.conversation_id).await.unwrap();
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user", "assistant"]);
        let indices: Vec<i64> = messages.iter().map(|m| m.message_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_retrieval_block_reaches_provider() {
        let server = MockServer::start().await;
        // Echo assertion happens on the mock: the system prompt must carry
        // the retrieved chunk text.
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(wiremock::matchers::body_string_contains("heading B content"))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_reply("with context")))
            .mount(&server)
            .await;

        let (orchestrator, db, vectors) = orchestrator(&server.uri()).await;

        let collection = db
            .knowledge()
            .ensure_collection("docs-x", "hash-embedder", "InMemory")
            .await
            .unwrap();
        vectors.ensure_collection("docs-x", 8).await.unwrap();
        vectors
            .upsert(
                "docs-x",
                vec![VectorPoint {
                    id: "k1".into(),
                    vector: HashEmbedder::vector_for("Explain B"),
                    payload: VectorPayload {
                        collection_id: collection.id,
                        document_id: "d1".into(),
                        file_name: "guide.md".into(),
                        chunk_order: 0,
                        text: "heading B content".into(),
                        token_count: 3,
                    },
                }],
            )
            .await
            .unwrap();

        let mut req = request("Explain B");
        req.knowledge_id = Some("docs-x".to_string());
        let reply = orchestrator.ask(req).await.unwrap();
        assert_eq!(reply.reply, "with context");
    }

    #[tokio::test]
    async fn test_retrieval_failure_downgrades_to_empty_context() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(wiremock::matchers::body_string_contains("No relevant context"))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_reply("no context")))
            .mount(&server)
            .await;

        let (orchestrator, db, _) = orchestrator(&server.uri()).await;
        // Collection row exists but the vector collection does not
        db.knowledge()
            .ensure_collection("ghost", "hash-embedder", "InMemory")
            .await
            .unwrap();

        let mut req = request("anything");
        req.knowledge_id = Some("ghost".to_string());
        let reply = orchestrator.ask(req).await.unwrap();
        assert_eq!(reply.reply, "no context");
    }

    #[tokio::test]
    async fn test_provider_failure_records_failed_metric() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(400).set_body_string("model exploded"))
            .mount(&server)
            .await;

        let (orchestrator, db, _) = orchestrator(&server.uri()).await;
        let err = orchestrator.ask(request("boom")).await.unwrap_err();
        assert_eq!(err.kind(), "ProviderFailed");

        let aggregates = db.metrics().aggregates(1).await.unwrap();
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_streaming_persists_accumulated_reply() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"lo\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"\"},\"done\":true,\"prompt_eval_count\":4,\"eval_count\":2}\n"
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let (orchestrator, db, _) = orchestrator(&server.uri()).await;
        let streaming = orchestrator.ask_streaming(request("hi")).await.unwrap();

        let mut text = String::new();
        let mut stream = streaming.stream;
        while let Some(delta) = stream.next().await {
            let delta = delta.unwrap();
            text.push_str(&delta.text);
        }
        assert_eq!(text, "Hello");

        let messages = db
            .conversations()
            .messages(&streaming.conversation_id)
            .await
            .unwrap();
        let assistant = messages.iter().find(|m| m.role == "assistant").unwrap();
        assert_eq!(assistant.content, "Hello");

        let metrics = db
            .metrics()
            .for_conversation(&streaming.conversation_id)
            .await
            .unwrap();
        assert_eq!(metrics.len(), 1);
        assert!(metrics[0].success);
        assert_eq!(metrics[0].prompt_tokens, 4);
    }

    #[tokio::test]
    async fn test_dropped_stream_records_cancelled_metric() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"one\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"two\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"\"},\"done\":true}\n"
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let (orchestrator, db, _) = orchestrator(&server.uri()).await;
        let streaming = orchestrator.ask_streaming(request("hi")).await.unwrap();
        let conversation_id = streaming.conversation_id.clone();

        // Read one delta, then walk away
        let mut stream = streaming.stream;
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.text, "one");
        drop(stream);

        // The drop guard records asynchronously
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let metrics = db.metrics().for_conversation(&conversation_id).await.unwrap();
        assert_eq!(metrics.len(), 1);
        assert!(!metrics[0].success);
        assert_eq!(metrics[0].error_kind.as_deref(), Some("Cancelled"));
    }

    #[test]
    fn test_strip_markdown_preserves_code_fences() {
        let input = "# Title\n\nSome **bold** text.\n\n```rust\nfn main() {}\n```\n\n- item one\n";
        let stripped = strip_markdown(input);

        assert!(!stripped.contains('#'));
        assert!(!stripped.contains("**"));
        assert!(stripped.contains("Title"));
        assert!(stripped.contains("Some bold text."));
        assert!(stripped.contains("```rust\nfn main() {}\n```"));
        assert!(stripped.contains("- item one"));
    }
}

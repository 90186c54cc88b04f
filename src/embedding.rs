//! Embedding generation with batching and capped retry
//!
//! One provider is active per process, selected at startup. Both
//! implementations batch inputs and retry transient network failures with
//! capped exponential backoff before surfacing the provider as unavailable.

use crate::config::{EmbeddingConfig, EmbeddingProvider, OllamaConfig};
use crate::error::{AppError, LlmError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Capability surface: texts in, fixed-dimension vectors out
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed a sequence of texts; output order matches input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Output dimension of the configured model
    fn dimension(&self) -> usize;

    /// Model identifier
    fn model(&self) -> &str;
}

/// Select the active embedder from configuration.
pub fn build_embedding_client(
    config: &EmbeddingConfig,
    ollama: &OllamaConfig,
    openai_api_key: Option<String>,
) -> Result<Arc<dyn EmbeddingClient>> {
    match config.provider {
        EmbeddingProvider::Ollama => Ok(Arc::new(OllamaEmbedder::new(
            config.clone(),
            ollama.base_url.clone(),
        ))),
        EmbeddingProvider::OpenAi => {
            let api_key = openai_api_key
                .ok_or_else(|| AppError::ConfigMissing("OPENAI_API_KEY".to_string()))?;
            Ok(Arc::new(OpenAiEmbedder::new(config.clone(), api_key, None)))
        }
    }
}

fn build_http_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .expect("Failed to create HTTP client")
}

/// Run one batch call with capped exponential backoff. Only transient
/// failures are retried; after the attempt cap the provider is reported
/// unavailable.
async fn with_retries<F, Fut>(max_attempts: u32, base_delay: Duration, mut call: F) -> Result<Vec<Vec<f32>>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Vec<Vec<f32>>>>,
{
    let mut last_error: Option<AppError> = None;

    for attempt in 0..max_attempts {
        match call().await {
            Ok(vectors) => {
                if attempt > 0 {
                    debug!(attempt, "Embedding succeeded after retry");
                }
                return Ok(vectors);
            }
            Err(e) if e.is_retryable() => {
                warn!(attempt = attempt + 1, error = %e, "Transient embedding failure");
                last_error = Some(e);
                if attempt + 1 < max_attempts {
                    tokio::time::sleep(base_delay * 2u32.pow(attempt)).await;
                }
            }
            Err(e) => return Err(e),
        }
    }

    let detail = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no attempts made".to_string());
    Err(LlmError::ProviderUnavailable(detail).into())
}

fn check_dimensions(vectors: &[Vec<f32>], expected: usize) -> Result<()> {
    for vector in vectors {
        if vector.len() != expected {
            return Err(LlmError::InvalidResponse(format!(
                "embedding dimension {} does not match configured {}",
                vector.len(),
                expected
            ))
            .into());
        }
    }
    Ok(())
}

/// Local model server embedder
pub struct OllamaEmbedder {
    client: reqwest::Client,
    config: EmbeddingConfig,
    base_url: String,
    retry_base: Duration,
}

#[derive(Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    pub fn new(config: EmbeddingConfig, base_url: String) -> Self {
        let client = build_http_client(config.timeout_secs);
        Self {
            client,
            config,
            base_url,
            retry_base: Duration::from_millis(250),
        }
    }

    #[cfg(test)]
    fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.base_url.trim_end_matches('/'));
        let request = OllamaEmbedRequest {
            model: &self.config.ollama_model,
            input: batch,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Llm(LlmError::ConnectionFailed(e.to_string())))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                429 => LlmError::RateLimited.into(),
                500..=599 => LlmError::ConnectionFailed(format!("HTTP {status}: {body}")).into(),
                _ => LlmError::EmbeddingFailed(format!("HTTP {status}: {body}")).into(),
            });
        }

        let payload: OllamaEmbedResponse = response
            .json()
            .await
            .map_err(|e| AppError::Llm(LlmError::InvalidResponse(e.to_string())))?;
        Ok(payload.embeddings)
    }
}

#[async_trait]
impl EmbeddingClient for OllamaEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.config.batch_size.max(1)) {
            let batch_vectors = with_retries(self.config.max_attempts, self.retry_base, || {
                self.embed_batch(batch)
            })
            .await?;
            check_dimensions(&batch_vectors, self.config.dimension)?;
            vectors.extend(batch_vectors);
        }

        debug!(count = vectors.len(), model = %self.config.ollama_model, "Embedded texts");
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn model(&self) -> &str {
        &self.config.ollama_model
    }
}

/// Hosted embedding model over an OpenAI-style endpoint
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    config: EmbeddingConfig,
    api_key: String,
    base_url: String,
    retry_base: Duration,
}

#[derive(Serialize)]
struct OpenAiEmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OpenAiEmbedResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    embedding: Vec<f32>,
    index: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: EmbeddingConfig, api_key: String, base_url: Option<String>) -> Self {
        let client = build_http_client(config.timeout_secs);
        Self {
            client,
            config,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".to_string()),
            retry_base: Duration::from_millis(250),
        }
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'));
        let request = OpenAiEmbedRequest {
            model: &self.config.openai_model,
            input: batch,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Llm(LlmError::ConnectionFailed(e.to_string())))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 => LlmError::Unauthorized.into(),
                429 => LlmError::RateLimited.into(),
                500..=599 => LlmError::ConnectionFailed(format!("HTTP {status}: {body}")).into(),
                _ => LlmError::EmbeddingFailed(format!("HTTP {status}: {body}")).into(),
            });
        }

        let payload: OpenAiEmbedResponse = response
            .json()
            .await
            .map_err(|e| AppError::Llm(LlmError::InvalidResponse(e.to_string())))?;

        let mut data = payload.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.config.batch_size.max(1)) {
            let batch_vectors = with_retries(self.config.max_attempts, self.retry_base, || {
                self.embed_batch(batch)
            })
            .await?;
            check_dimensions(&batch_vectors, self.config.dimension)?;
            vectors.extend(batch_vectors);
        }

        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn model(&self) -> &str {
        &self.config.openai_model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(dimension: usize, batch_size: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            dimension,
            batch_size,
            max_attempts: 4,
            timeout_secs: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ollama_embed_batches() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "embeddings": [[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]]
            })))
            .expect(2)
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(test_config(3, 2), server.uri());
        let texts: Vec<String> = (0..4).map(|i| format!("text {i}")).collect();
        let vectors = embedder.embed(&texts).await.unwrap();

        assert_eq!(vectors.len(), 4);
        assert_eq!(vectors[0].len(), 3);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "embeddings": [[1.0, 0.0]]
            })))
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(test_config(2, 16), server.uri())
            .with_retry_base(Duration::from_millis(1));
        let vectors = embedder.embed(&["hello".to_string()]).await.unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0]]);
    }

    #[tokio::test]
    async fn test_unavailable_after_retry_cap() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(503))
            .expect(4)
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(test_config(2, 16), server.uri())
            .with_retry_base(Duration::from_millis(1));
        let err = embedder.embed(&["hello".to_string()]).await.unwrap_err();
        assert_eq!(err.kind(), "ProviderUnavailable");
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_not_retried() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .and(body_partial_json(json!({"model": "nomic-embed-text"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "embeddings": [[0.1, 0.2, 0.3]]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(test_config(2, 16), server.uri());
        let err = embedder.embed(&["hello".to_string()]).await.unwrap_err();
        assert_eq!(err.kind(), "ProviderFailed");
    }

    #[tokio::test]
    async fn test_openai_embedder_orders_by_index() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"embedding": [0.0, 1.0], "index": 1},
                    {"embedding": [1.0, 0.0], "index": 0}
                ]
            })))
            .mount(&server)
            .await;

        let embedder = OpenAiEmbedder::new(
            test_config(2, 16),
            "sk-test".to_string(),
            Some(server.uri()),
        );
        let vectors = embedder
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors[0], vec![1.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_missing_openai_key_is_config_missing() {
        let err = build_embedding_client(
            &EmbeddingConfig {
                provider: EmbeddingProvider::OpenAi,
                ..Default::default()
            },
            &OllamaConfig::default(),
            None,
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), "ConfigMissing");
    }
}

//! Base HTTP provider implementation
//!
//! Provides common HTTP client functionality for the cloud and local chat
//! providers, including a line-framed body stream for SSE and NDJSON
//! responses.

use crate::error::{AppError, LlmError, Result};
use futures::{Stream, StreamExt};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, error};

/// Lines from a streaming response body
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Base HTTP client for chat providers
pub struct HttpProviderClient {
    client: Client,
    timeout: Duration,
}

impl HttpProviderClient {
    /// Create a new HTTP provider client
    pub fn new(timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Execute a POST request with JSON body
    pub async fn post_json<T: Serialize, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        headers: Vec<(&str, &str)>,
    ) -> Result<R> {
        debug!("Making POST request to: {}", url);

        let mut request = self.client.post(url).json(body);
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| LlmError::Timeout)?
            .map_err(|e| LlmError::ConnectionFailed(e.to_string()))?;

        self.handle_response(response).await
    }

    /// Execute a GET request
    pub async fn get<R: DeserializeOwned>(
        &self,
        url: &str,
        headers: Vec<(&str, &str)>,
    ) -> Result<R> {
        debug!("Making GET request to: {}", url);

        let mut request = self.client.get(url);
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| LlmError::Timeout)?
            .map_err(|e| LlmError::ConnectionFailed(e.to_string()))?;

        self.handle_response(response).await
    }

    /// Execute a POST request and return the body as a stream of non-empty
    /// lines. Works for both SSE (`data: …`) and NDJSON bodies; the overall
    /// timeout is not applied so long generations can finish.
    pub async fn post_lines<T: Serialize>(
        &self,
        url: &str,
        body: &T,
        headers: Vec<(&str, &str)>,
    ) -> Result<LineStream> {
        debug!("Opening streaming POST to: {}", url);

        let mut request = self.client.post(url).json(body);
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| LlmError::ConnectionFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| format!("HTTP {} error", status));
            error!("Streaming API error ({}): {}", status, error_text);
            return Err(map_status(status.as_u16(), error_text).into());
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk
                    .map_err(|e| AppError::Llm(LlmError::ConnectionFailed(e.to_string())))?;
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line).trim().to_string();
                    if !line.is_empty() {
                        yield line;
                    }
                }
            }

            if !buffer.is_empty() {
                let line = String::from_utf8_lossy(&buffer).trim().to_string();
                if !line.is_empty() {
                    yield line;
                }
            }
        };

        Ok(Box::pin(stream))
    }

    /// Handle HTTP response and deserialize
    async fn handle_response<R: DeserializeOwned>(&self, response: Response) -> Result<R> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| format!("HTTP {} error", status));

            error!("API error ({}): {}", status, error_text);
            return Err(map_status(status.as_u16(), error_text).into());
        }

        response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()).into())
    }
}

fn map_status(status: u16, error_text: String) -> LlmError {
    match status {
        401 | 403 => LlmError::Unauthorized,
        404 => LlmError::ModelNotFound(error_text),
        429 => LlmError::RateLimited,
        500..=599 => LlmError::ConnectionFailed(error_text),
        _ => LlmError::ProviderFailed(error_text),
    }
}

/// Strip the `data: ` prefix of an SSE line; `None` for non-data lines.
pub fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_sse_data_prefix() {
        assert_eq!(sse_data("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(sse_data("data:[DONE]"), Some("[DONE]"));
        assert_eq!(sse_data("event: ping"), None);
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(map_status(401, String::new()), LlmError::Unauthorized));
        assert!(matches!(map_status(429, String::new()), LlmError::RateLimited));
        assert!(matches!(map_status(500, String::new()), LlmError::ConnectionFailed(_)));
        assert!(matches!(map_status(400, String::new()), LlmError::ProviderFailed(_)));
    }

    #[tokio::test]
    async fn test_post_lines_splits_on_newlines() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/stream"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("line one\nline two\n\nline three"),
            )
            .mount(&server)
            .await;

        let client = HttpProviderClient::new(5);
        let lines: Vec<String> = client
            .post_lines(&format!("{}/stream", server.uri()), &json!({}), vec![])
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(lines, vec!["line one", "line two", "line three"]);
    }

    #[tokio::test]
    async fn test_post_lines_maps_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/stream"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = HttpProviderClient::new(5);
        let err = client
            .post_lines(&format!("{}/stream", server.uri()), &json!({}), vec![])
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::Llm(LlmError::Unauthorized)));
    }
}

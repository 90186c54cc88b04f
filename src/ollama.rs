//! Local model server management: list, pull with progress, uninstall
//!
//! Pull progress aggregates across all layers of a model download and is
//! emitted at whole-percent steps of overall progress.

use crate::error::{AppError, LlmError, Result};
use crate::llm::providers::HttpProviderClient;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::pin::Pin;
use tracing::debug;

/// A locally installed model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalModel {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub modified_at: Option<String>,
}

/// Aggregated download progress across all layers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PullProgress {
    pub digest: String,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub percent: f64,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<LocalModel>,
}

#[derive(Deserialize)]
struct PullLine {
    #[serde(default)]
    status: String,
    #[serde(default)]
    digest: Option<String>,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    completed: Option<u64>,
}

/// Client for the local model server's management endpoints
pub struct OllamaManager {
    client: HttpProviderClient,
    http: reqwest::Client,
    base_url: String,
}

impl OllamaManager {
    pub fn new(base_url: String) -> Self {
        Self {
            client: HttpProviderClient::new(30),
            http: reqwest::Client::new(),
            base_url,
        }
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/api/{}", self.base_url.trim_end_matches('/'), endpoint)
    }

    pub async fn list_models(&self) -> Result<Vec<LocalModel>> {
        let response: TagsResponse = self.client.get(&self.api_url("tags"), vec![]).await?;
        Ok(response.models)
    }

    /// Start a model pull and stream aggregated progress. An event is
    /// emitted whenever overall progress advances by at least one percent,
    /// plus a final event at completion.
    pub async fn pull_model(
        &self,
        name: &str,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<PullProgress>> + Send>>> {
        let body = json!({ "model": name, "stream": true });
        let mut lines = self
            .client
            .post_lines(&self.api_url("pull"), &body, vec![])
            .await?;

        let model_name = name.to_string();
        let stream = async_stream::try_stream! {
            use futures::StreamExt;

            let mut layers: HashMap<String, (u64, u64)> = HashMap::new();
            let mut last_emitted = -1.0f64;
            let mut current_digest = String::new();

            while let Some(line) = lines.next().await {
                let line = line?;
                let update: PullLine = match serde_json::from_str(&line) {
                    Ok(update) => update,
                    Err(_) => continue,
                };

                if let Some(digest) = &update.digest {
                    current_digest = digest.clone();
                    let entry = layers.entry(digest.clone()).or_insert((0, 0));
                    if let Some(total) = update.total {
                        entry.1 = total;
                    }
                    if let Some(completed) = update.completed {
                        entry.0 = completed;
                    }
                }

                let downloaded: u64 = layers.values().map(|(c, _)| c).sum();
                let total: u64 = layers.values().map(|(_, t)| t).sum();
                let percent = if total > 0 {
                    (downloaded as f64 / total as f64) * 100.0
                } else {
                    0.0
                };

                let finished = update.status == "success";
                if finished || percent - last_emitted >= 1.0 {
                    last_emitted = percent;
                    yield PullProgress {
                        digest: current_digest.clone(),
                        bytes_downloaded: downloaded,
                        total_bytes: total,
                        percent: if finished { 100.0 } else { percent },
                    };
                }

                if finished {
                    debug!(model = %model_name, "Model pull complete");
                    break;
                }
            }
        };

        Ok(Box::pin(stream))
    }

    pub async fn delete_model(&self, name: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.api_url("delete"))
            .json(&json!({ "model": name }))
            .send()
            .await
            .map_err(|e| AppError::Llm(LlmError::ConnectionFailed(e.to_string())))?;

        match response.status().as_u16() {
            200..=299 => Ok(()),
            404 => Err(AppError::NotFound(format!("model {name}"))),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(LlmError::ProviderFailed(format!("HTTP {status}: {body}")).into())
            }
        }
    }
}

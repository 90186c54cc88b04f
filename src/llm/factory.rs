//! Provider kernel factory with a per-process handle cache

use crate::config::{api_key_env_var, AppConfig};
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::llm::providers::{AnthropicProvider, GoogleProvider, OllamaProvider, OpenAiProvider};
use crate::llm::{ChatModel, ExecutionSettings, ProviderKind};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Produces chat handles per provider family; handles are cached for the
/// process lifetime keyed by provider+model and never mutated in place.
pub struct KernelFactory {
    config: AppConfig,
    db: Database,
    cache: Mutex<HashMap<(ProviderKind, String), Arc<dyn ChatModel>>>,
}

impl KernelFactory {
    pub fn new(config: AppConfig, db: Database) -> Self {
        Self {
            config,
            db,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the handle for a provider, creating and caching it on first
    /// use. Execution settings and keys are read at creation time.
    pub async fn handle(
        &self,
        provider: ProviderKind,
        model: Option<&str>,
    ) -> Result<Arc<dyn ChatModel>> {
        let model = self.resolve_model(provider, model).await?;

        {
            let cache = self.cache.lock().await;
            if let Some(handle) = cache.get(&(provider, model.clone())) {
                return Ok(handle.clone());
            }
        }

        let handle = self.build(provider, &model).await?;

        let mut cache = self.cache.lock().await;
        let entry = cache
            .entry((provider, model.clone()))
            .or_insert_with(|| handle.clone());
        debug!(provider = %provider, model = %model, "Cached provider handle");
        Ok(entry.clone())
    }

    async fn resolve_model(&self, provider: ProviderKind, model: Option<&str>) -> Result<String> {
        if let Some(model) = model {
            if !model.trim().is_empty() {
                return Ok(model.trim().to_string());
            }
        }

        let settings = self.db.settings();
        let setting_name = format!("{provider}.DefaultModel");
        let fallback = match provider {
            ProviderKind::OpenAi => "gpt-4o-mini".to_string(),
            ProviderKind::Anthropic => "claude-3-5-sonnet-latest".to_string(),
            ProviderKind::Google => "gemini-2.0-flash".to_string(),
            ProviderKind::Ollama => self.config.ollama.default_model.clone(),
        };
        settings.get_or(&setting_name, &fallback).await
    }

    async fn build(&self, provider: ProviderKind, model: &str) -> Result<Arc<dyn ChatModel>> {
        let settings = self.execution_settings(provider).await?;
        let base_url = self
            .db
            .settings()
            .get(&format!("{provider}.BaseUrl"))
            .await?;

        let handle: Arc<dyn ChatModel> = match provider {
            ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(
                self.api_key(provider).await?,
                base_url,
                model.to_string(),
                settings,
            )),
            ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(
                self.api_key(provider).await?,
                base_url,
                model.to_string(),
                settings,
            )),
            ProviderKind::Google => Arc::new(GoogleProvider::new(
                self.api_key(provider).await?,
                base_url,
                model.to_string(),
                settings,
            )),
            ProviderKind::Ollama => Arc::new(OllamaProvider::new(
                base_url.unwrap_or_else(|| self.config.ollama.base_url.clone()),
                model.to_string(),
                settings,
            )),
        };

        Ok(handle)
    }

    /// Environment variables win over encrypted settings.
    async fn api_key(&self, provider: ProviderKind) -> Result<String> {
        let env_var = api_key_env_var(provider.as_str());

        if let Some(var) = env_var {
            if let Ok(key) = std::env::var(var) {
                if !key.is_empty() {
                    return Ok(key);
                }
            }
        }

        let setting_name = format!("{provider}.ApiKey");
        if let Some(key) = self.db.settings().get_encrypted(&setting_name).await? {
            return Ok(key);
        }

        Err(AppError::ConfigMissing(
            env_var.unwrap_or("provider API key").to_string(),
        ))
    }

    async fn execution_settings(&self, provider: ProviderKind) -> Result<ExecutionSettings> {
        let settings = self.db.settings();
        let max_tokens = settings
            .get_i64(
                &format!("{provider}.MaxTokens"),
                self.config.chat.max_tokens as i64,
            )
            .await? as u32;
        let stop_sequences = settings
            .get(&format!("{provider}.StopSequences"))
            .await?
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(ExecutionSettings {
            max_tokens,
            stop_sequences,
            timeout_secs: self.config.chat.provider_timeout_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    async fn factory() -> KernelFactory {
        let db = Database::open_in_memory("pass").await.unwrap();
        KernelFactory::new(AppConfig::default(), db)
    }

    #[tokio::test]
    #[serial]
    async fn test_handles_are_cached_per_provider_and_model() {
        let factory = factory().await;

        let a = factory
            .handle(ProviderKind::Ollama, Some("llama3.2"))
            .await
            .unwrap();
        let b = factory
            .handle(ProviderKind::Ollama, Some("llama3.2"))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = factory
            .handle(ProviderKind::Ollama, Some("qwen2.5"))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    #[serial]
    async fn test_missing_api_key_is_config_missing() {
        let factory = factory().await;
        std::env::remove_var("OPENAI_API_KEY");

        let err = factory
            .handle(ProviderKind::OpenAi, Some("gpt-4o-mini"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "ConfigMissing");
    }

    #[tokio::test]
    #[serial]
    async fn test_encrypted_setting_supplies_key() {
        let db = Database::open_in_memory("pass").await.unwrap();
        db.settings()
            .set_encrypted("OpenAi.ApiKey", "sk-from-settings", "Providers")
            .await
            .unwrap();
        let factory = KernelFactory::new(AppConfig::default(), db);
        std::env::remove_var("OPENAI_API_KEY");

        let handle = factory
            .handle(ProviderKind::OpenAi, Some("gpt-4o-mini"))
            .await
            .unwrap();
        assert_eq!(handle.provider(), ProviderKind::OpenAi);
        assert_eq!(handle.model(), "gpt-4o-mini");
    }

    #[tokio::test]
    #[serial]
    async fn test_env_var_wins_over_settings() {
        let db = Database::open_in_memory("pass").await.unwrap();
        db.settings()
            .set_encrypted("OpenAi.ApiKey", "sk-from-settings", "Providers")
            .await
            .unwrap();
        let factory = KernelFactory::new(AppConfig::default(), db);

        std::env::set_var("OPENAI_API_KEY", "sk-from-env");
        let key = factory.api_key(ProviderKind::OpenAi).await.unwrap();
        std::env::remove_var("OPENAI_API_KEY");
        assert_eq!(key, "sk-from-env");
    }

    #[tokio::test]
    #[serial]
    async fn test_default_model_resolution() {
        let factory = factory().await;
        let handle = factory.handle(ProviderKind::Ollama, None).await.unwrap();
        assert_eq!(handle.model(), "llama3.2");
    }
}

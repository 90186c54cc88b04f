//! Usage metric writes and aggregation queries

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

/// One recorded chat turn, successful or not
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageMetric {
    pub conversation_id: Option<String>,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub response_time_ms: i64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error_kind: Option<String>,
}

impl UsageMetric {
    pub fn start(conversation_id: Option<String>, provider: &str, model: &str) -> Self {
        Self {
            conversation_id,
            provider: provider.to_string(),
            model: model.to_string(),
            prompt_tokens: 0,
            completion_tokens: 0,
            response_time_ms: 0,
            timestamp: Utc::now(),
            success: true,
            error_kind: None,
        }
    }
}

/// Aggregated usage grouped by provider, model, and day
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageAggregate {
    pub provider: String,
    pub model: String,
    pub day: String,
    pub turns: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub avg_response_time_ms: f64,
    pub success_rate: f64,
}

/// Per-model rollup used by the model read models
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUsage {
    pub provider: String,
    pub model: String,
    pub turns: i64,
    pub total_tokens: i64,
    pub avg_response_time_ms: f64,
    pub success_rate: f64,
}

/// Repository over `usage_metrics`
#[derive(Clone)]
pub struct MetricsStore {
    pool: SqlitePool,
}

impl MetricsStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Write one metric row. Called for every completed turn.
    pub async fn record(&self, metric: &UsageMetric) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_metrics
                (conversation_id, provider, model, prompt_tokens, completion_tokens,
                 response_time_ms, timestamp, success, error_kind)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&metric.conversation_id)
        .bind(&metric.provider)
        .bind(&metric.model)
        .bind(metric.prompt_tokens)
        .bind(metric.completion_tokens)
        .bind(metric.response_time_ms)
        .bind(metric.timestamp.to_rfc3339())
        .bind(metric.success as i64)
        .bind(&metric.error_kind)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Daily aggregates for the last `days` days.
    pub async fn aggregates(&self, days: i64) -> Result<Vec<UsageAggregate>> {
        let cutoff = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();

        let rows = sqlx::query(
            r#"
            SELECT provider, model, substr(timestamp, 1, 10) AS day,
                   COUNT(*) AS turns,
                   SUM(prompt_tokens) AS prompt_tokens,
                   SUM(completion_tokens) AS completion_tokens,
                   AVG(response_time_ms) AS avg_response_time_ms,
                   AVG(CAST(success AS REAL)) AS success_rate
            FROM usage_metrics
            WHERE timestamp >= ?1
            GROUP BY provider, model, day
            ORDER BY day DESC, provider, model
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| UsageAggregate {
                provider: row.get("provider"),
                model: row.get("model"),
                day: row.get("day"),
                turns: row.get("turns"),
                prompt_tokens: row.get::<Option<i64>, _>("prompt_tokens").unwrap_or(0),
                completion_tokens: row.get::<Option<i64>, _>("completion_tokens").unwrap_or(0),
                avg_response_time_ms: row
                    .get::<Option<f64>, _>("avg_response_time_ms")
                    .unwrap_or(0.0),
                success_rate: row.get::<Option<f64>, _>("success_rate").unwrap_or(0.0),
            })
            .collect())
    }

    /// Per-model rollup ordered by usage, most used first.
    pub async fn model_usage(&self) -> Result<Vec<ModelUsage>> {
        let rows = sqlx::query(
            r#"
            SELECT provider, model,
                   COUNT(*) AS turns,
                   SUM(prompt_tokens + completion_tokens) AS total_tokens,
                   AVG(response_time_ms) AS avg_response_time_ms,
                   AVG(CAST(success AS REAL)) AS success_rate
            FROM usage_metrics
            GROUP BY provider, model
            ORDER BY turns DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ModelUsage {
                provider: row.get("provider"),
                model: row.get("model"),
                turns: row.get("turns"),
                total_tokens: row.get::<Option<i64>, _>("total_tokens").unwrap_or(0),
                avg_response_time_ms: row
                    .get::<Option<f64>, _>("avg_response_time_ms")
                    .unwrap_or(0.0),
                success_rate: row.get::<Option<f64>, _>("success_rate").unwrap_or(0.0),
            })
            .collect())
    }

    /// Rollup for a single model across providers.
    pub async fn model_performance(&self, model: &str) -> Result<Option<ModelUsage>> {
        let all = self.model_usage().await?;
        Ok(all.into_iter().find(|m| m.model == model))
    }

    /// Metrics recorded for one conversation, oldest first.
    pub async fn for_conversation(&self, conversation_id: &str) -> Result<Vec<UsageMetric>> {
        let rows = sqlx::query(
            "SELECT * FROM usage_metrics WHERE conversation_id = ?1 ORDER BY timestamp ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let timestamp: String = row.get("timestamp");
                let success: i64 = row.get("success");
                Ok(UsageMetric {
                    conversation_id: row.get("conversation_id"),
                    provider: row.get("provider"),
                    model: row.get("model"),
                    prompt_tokens: row.get("prompt_tokens"),
                    completion_tokens: row.get("completion_tokens"),
                    response_time_ms: row.get("response_time_ms"),
                    timestamp: DateTime::parse_from_rfc3339(&timestamp)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    success: success != 0,
                    error_kind: row.get("error_kind"),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn test_record_and_aggregate() {
        let db = Database::open_in_memory("pass").await.unwrap();
        let metrics = db.metrics();

        let mut m = UsageMetric::start(Some("c1".into()), "OpenAi", "gpt-4o");
        m.prompt_tokens = 100;
        m.completion_tokens = 40;
        m.response_time_ms = 900;
        metrics.record(&m).await.unwrap();

        let mut failed = UsageMetric::start(Some("c1".into()), "OpenAi", "gpt-4o");
        failed.success = false;
        failed.error_kind = Some("ProviderFailed".into());
        metrics.record(&failed).await.unwrap();

        let aggregates = metrics.aggregates(7).await.unwrap();
        assert_eq!(aggregates.len(), 1);
        let agg = &aggregates[0];
        assert_eq!(agg.turns, 2);
        assert_eq!(agg.prompt_tokens, 100);
        assert!((agg.success_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_model_usage_orders_by_turns() {
        let db = Database::open_in_memory("pass").await.unwrap();
        let metrics = db.metrics();

        for _ in 0..3 {
            metrics
                .record(&UsageMetric::start(None, "Ollama", "llama3.2"))
                .await
                .unwrap();
        }
        metrics
            .record(&UsageMetric::start(None, "Anthropic", "claude-3-haiku"))
            .await
            .unwrap();

        let usage = metrics.model_usage().await.unwrap();
        assert_eq!(usage[0].model, "llama3.2");
        assert_eq!(usage[0].turns, 3);

        let perf = metrics.model_performance("claude-3-haiku").await.unwrap();
        assert_eq!(perf.unwrap().turns, 1);
    }

    #[tokio::test]
    async fn test_metrics_carry_both_providers() {
        let db = Database::open_in_memory("pass").await.unwrap();
        let metrics = db.metrics();

        metrics
            .record(&UsageMetric::start(Some("c1".into()), "OpenAi", "gpt-4o"))
            .await
            .unwrap();
        metrics
            .record(&UsageMetric::start(Some("c1".into()), "Google", "gemini-2.0-flash"))
            .await
            .unwrap();

        let rows = metrics.for_conversation("c1").await.unwrap();
        let providers: Vec<&str> = rows.iter().map(|m| m.provider.as_str()).collect();
        assert_eq!(providers, vec!["OpenAi", "Google"]);
    }
}

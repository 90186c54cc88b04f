//! Usage analytics: write path, cached read model, change notifications

use crate::db::metrics::{ModelUsage, UsageAggregate};
use crate::db::{Database, UsageMetric};
use crate::error::Result;
use crate::realtime::RealtimeHub;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const DEFAULT_WINDOW_DAYS: i64 = 30;

struct CachedAggregates {
    computed_at: Instant,
    aggregates: Vec<UsageAggregate>,
}

/// Read model over usage metrics with a short-TTL cache. New metrics and
/// recomputed aggregates notify the realtime hub.
pub struct AnalyticsService {
    db: Database,
    hub: Arc<RealtimeHub>,
    cache: Mutex<Option<CachedAggregates>>,
}

impl AnalyticsService {
    pub fn new(db: Database, hub: Arc<RealtimeHub>) -> Self {
        Self {
            db,
            hub,
            cache: Mutex::new(None),
        }
    }

    /// Record one turn's metric. Failures here are logged by callers and
    /// never fail the turn.
    pub async fn record(&self, metric: &UsageMetric) -> Result<()> {
        self.db.metrics().record(metric).await?;

        self.hub
            .publish(json!({
                "type": "metric-recorded",
                "provider": metric.provider,
                "model": metric.model,
                "success": metric.success,
            }))
            .await;
        Ok(())
    }

    /// Daily aggregates, cached with the configured TTL.
    pub async fn aggregates(&self) -> Result<Vec<UsageAggregate>> {
        let ttl = self
            .db
            .settings()
            .get_i64("AnalyticsCacheTtlSeconds", 30)
            .await
            .unwrap_or(30)
            .max(0) as u64;

        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.as_ref() {
                if cached.computed_at.elapsed() < Duration::from_secs(ttl) {
                    return Ok(cached.aggregates.clone());
                }
            }
        }

        let aggregates = self.db.metrics().aggregates(DEFAULT_WINDOW_DAYS).await?;
        debug!(groups = aggregates.len(), "Recomputed usage aggregates");

        *self.cache.lock().await = Some(CachedAggregates {
            computed_at: Instant::now(),
            aggregates: aggregates.clone(),
        });

        self.hub
            .publish(json!({ "type": "analytics-updated", "groups": aggregates.len() }))
            .await;

        Ok(aggregates)
    }

    pub async fn model_usage(&self) -> Result<Vec<ModelUsage>> {
        self.db.metrics().model_usage().await
    }

    pub async fn model_performance(&self, model: &str) -> Result<Option<ModelUsage>> {
        self.db.metrics().model_performance(model).await
    }

    /// Record a metric without surfacing errors; used at the end of a turn.
    pub async fn record_best_effort(&self, metric: &UsageMetric) {
        if let Err(e) = self.record(metric).await {
            warn!(error = %e, "Failed to record usage metric");
        }
    }
}

//! Vector store capability surface and backend selection
//!
//! Two production backends (Qdrant over gRPC, MongoDB with vector search)
//! plus an in-memory backend for tests and ephemeral runs. All backends
//! implement identical semantics: cosine similarity, results in descending
//! score order, inclusive `min_score` filtering, idempotent collection
//! create/delete, and id-overwrite upsert.

pub mod memory;
pub mod mongo;
pub mod qdrant;

use crate::config::{AppConfig, VectorStoreProvider};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use memory::InMemoryVectorStore;
pub use mongo::MongoVectorStore;
pub use qdrant::QdrantVectorStore;

/// Payload stored alongside every vector point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorPayload {
    pub collection_id: String,
    pub document_id: String,
    pub file_name: String,
    pub chunk_order: i64,
    pub text: String,
    pub token_count: i64,
}

/// A point to upsert; the id is the chunk id and overwrites on conflict
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: VectorPayload,
}

/// A search hit
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: VectorPayload,
}

/// Capability surface satisfied by every backend
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the collection if missing, with cosine metric; idempotent.
    async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<()>;

    /// Names of collections currently present.
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Delete a collection; succeeds when it does not exist.
    async fn delete_collection(&self, name: &str) -> Result<()>;

    /// Insert or overwrite points by id.
    async fn upsert(&self, name: &str, points: Vec<VectorPoint>) -> Result<()>;

    /// Top-k by descending cosine similarity; hits below `min_score` are
    /// filtered out when it is supplied (a hit exactly at the threshold is
    /// kept).
    async fn search(
        &self,
        name: &str,
        query: &[f32],
        k: usize,
        min_score: Option<f32>,
    ) -> Result<Vec<ScoredPoint>>;

    /// Remove specific points by id.
    async fn delete_points(&self, name: &str, ids: &[String]) -> Result<()>;

    /// Remove every point belonging to a document.
    async fn delete_by_document(&self, name: &str, document_id: &str) -> Result<()>;

    /// Reachability probe.
    async fn health(&self) -> bool {
        true
    }

    /// Backend tag persisted on collection rows.
    fn kind(&self) -> &'static str;
}

/// Select and connect the configured backend.
pub async fn build_vector_store(config: &AppConfig) -> Result<Arc<dyn VectorStore>> {
    match config.vector_store.provider {
        VectorStoreProvider::Qdrant => Ok(Arc::new(QdrantVectorStore::connect(config)?)),
        VectorStoreProvider::MongoDB => Ok(Arc::new(MongoVectorStore::connect(config).await?)),
        VectorStoreProvider::InMemory => Ok(Arc::new(InMemoryVectorStore::new())),
    }
}

/// Apply the shared ordering and threshold semantics to raw hits.
pub(crate) fn finalize_hits(
    mut hits: Vec<ScoredPoint>,
    k: usize,
    min_score: Option<f32>,
) -> Vec<ScoredPoint> {
    if let Some(min) = min_score {
        hits.retain(|hit| hit.score >= min);
    }
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(k);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, score: f32) -> ScoredPoint {
        ScoredPoint {
            id: id.to_string(),
            score,
            payload: VectorPayload {
                collection_id: "c".into(),
                document_id: "d".into(),
                file_name: "f.md".into(),
                chunk_order: 0,
                text: "t".into(),
                token_count: 1,
            },
        }
    }

    #[test]
    fn test_min_score_boundary_is_inclusive() {
        let hits = vec![hit("low", 0.599), hit("edge", 0.600), hit("high", 0.9)];
        let kept = finalize_hits(hits, 10, Some(0.6));
        let ids: Vec<&str> = kept.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "edge"]);
    }

    #[test]
    fn test_hits_ordered_descending_and_truncated() {
        let hits = vec![hit("a", 0.2), hit("b", 0.8), hit("c", 0.5)];
        let kept = finalize_hits(hits, 2, None);
        let ids: Vec<&str> = kept.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }
}

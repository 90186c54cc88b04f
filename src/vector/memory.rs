//! In-memory vector store backend: exact cosine scan

use super::{finalize_hits, ScoredPoint, VectorPoint, VectorStore};
use crate::error::{Result, VectorError};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Exact-scan backend for tests and ephemeral runs
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, HashMap<String, VectorPoint>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cosine similarity of two equal-length vectors.
    pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }

        let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }

        dot_product / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn ensure_collection(&self, name: &str, _dimension: usize) -> Result<()> {
        self.collections
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.collections.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.collections.write().await.remove(name);
        Ok(())
    }

    async fn upsert(&self, name: &str, points: Vec<VectorPoint>) -> Result<()> {
        let mut collections = self.collections.write().await;
        let collection = collections
            .get_mut(name)
            .ok_or_else(|| VectorError::CollectionNotFound(name.to_string()))?;
        for point in points {
            collection.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        query: &[f32],
        k: usize,
        min_score: Option<f32>,
    ) -> Result<Vec<ScoredPoint>> {
        let collections = self.collections.read().await;
        let collection = collections
            .get(name)
            .ok_or_else(|| VectorError::CollectionNotFound(name.to_string()))?;

        let hits = collection
            .values()
            .map(|point| ScoredPoint {
                id: point.id.clone(),
                score: Self::cosine_similarity(query, &point.vector),
                payload: point.payload.clone(),
            })
            .collect();

        Ok(finalize_hits(hits, k, min_score))
    }

    async fn delete_points(&self, name: &str, ids: &[String]) -> Result<()> {
        if let Some(collection) = self.collections.write().await.get_mut(name) {
            for id in ids {
                collection.remove(id);
            }
        }
        Ok(())
    }

    async fn delete_by_document(&self, name: &str, document_id: &str) -> Result<()> {
        if let Some(collection) = self.collections.write().await.get_mut(name) {
            collection.retain(|_, point| point.payload.document_id != document_id);
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "InMemory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::VectorPayload;

    fn point(id: &str, document_id: &str, vector: Vec<f32>) -> VectorPoint {
        VectorPoint {
            id: id.to_string(),
            vector,
            payload: VectorPayload {
                collection_id: "c1".into(),
                document_id: document_id.to_string(),
                file_name: "notes.md".into(),
                chunk_order: 0,
                text: format!("text for {id}"),
                token_count: 3,
            },
        }
    }

    #[tokio::test]
    async fn test_upsert_search_roundtrip_top1() {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("docs", 3).await.unwrap();

        let target = vec![0.3, 0.5, 0.2];
        store
            .upsert(
                "docs",
                vec![
                    point("a", "d1", target.clone()),
                    point("b", "d1", vec![0.9, 0.1, 0.0]),
                ],
            )
            .await
            .unwrap();

        let hits = store.search("docs", &target, 2, None).await.unwrap();
        assert_eq!(hits[0].id, "a");
        assert!(hits[0].score >= 0.999);
    }

    #[tokio::test]
    async fn test_upsert_overwrites_by_id() {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("docs", 2).await.unwrap();

        store
            .upsert("docs", vec![point("a", "d1", vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .upsert("docs", vec![point("a", "d2", vec![0.0, 1.0])])
            .await
            .unwrap();

        let hits = store.search("docs", &[0.0, 1.0], 10, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].payload.document_id, "d2");
    }

    #[tokio::test]
    async fn test_delete_by_document() {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("docs", 2).await.unwrap();
        store
            .upsert(
                "docs",
                vec![
                    point("a", "d1", vec![1.0, 0.0]),
                    point("b", "d2", vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        store.delete_by_document("docs", "d1").await.unwrap();
        let hits = store.search("docs", &[1.0, 0.0], 10, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "b");
    }

    #[tokio::test]
    async fn test_collection_lifecycle_idempotent() {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("docs", 2).await.unwrap();
        store.ensure_collection("docs", 2).await.unwrap();
        assert_eq!(store.list_collections().await.unwrap(), vec!["docs"]);

        store.delete_collection("docs").await.unwrap();
        store.delete_collection("docs").await.unwrap();
        assert!(store.list_collections().await.unwrap().is_empty());
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];

        assert_eq!(InMemoryVectorStore::cosine_similarity(&a, &b), 1.0);
        assert_eq!(InMemoryVectorStore::cosine_similarity(&a, &c), 0.0);
    }
}

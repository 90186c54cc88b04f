//! Advertised tool set: cross-collection search, analytics, and health
//!
//! Every handler is read-only over the metadata store, the analytics read
//! model, and the vector store; tools never mutate entities the chat
//! orchestrator owns. The same registry backs agent dispatch and the MCP
//! `tools/*` surface.

use crate::analytics::AnalyticsService;
use crate::db::Database;
use crate::embedding::EmbeddingClient;
use crate::error::{AppError, McpError, Result};
use crate::llm::ToolSpec;
use crate::vector::VectorStore;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

const DEFAULT_SEARCH_K: usize = 5;

/// Read-only tool registry
pub struct ToolRegistry {
    db: Database,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingClient>,
    analytics: Arc<AnalyticsService>,
}

impl ToolRegistry {
    pub fn new(
        db: Database,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingClient>,
        analytics: Arc<AnalyticsService>,
    ) -> Self {
        Self {
            db,
            vectors,
            embedder,
            analytics,
        }
    }

    /// Tool descriptions advertised to providers and over MCP.
    pub fn specs(&self) -> Vec<ToolSpec> {
        fn spec(name: &str, description: &str, schema: Value) -> ToolSpec {
            ToolSpec {
                name: name.to_string(),
                description: description.to_string(),
                input_schema: schema,
            }
        }

        let query_k = json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search query"},
                "k": {"type": "integer", "description": "Maximum hits to return"}
            },
            "required": ["query"]
        });

        vec![
            spec(
                "search_knowledge",
                "Search one knowledge collection for passages relevant to a query.",
                json!({
                    "type": "object",
                    "properties": {
                        "collectionId": {"type": "string", "description": "Collection id or name"},
                        "query": {"type": "string", "description": "Search query"},
                        "k": {"type": "integer", "description": "Maximum hits to return"}
                    },
                    "required": ["collectionId", "query"]
                }),
            ),
            spec(
                "search_all_knowledge",
                "Search every active knowledge collection and merge results by score.",
                query_k.clone(),
            ),
            spec(
                "compare_knowledge_bases",
                "Run the same query against several collections and return side-by-side summaries.",
                json!({
                    "type": "object",
                    "properties": {
                        "ids": {"type": "array", "items": {"type": "string"}},
                        "query": {"type": "string"}
                    },
                    "required": ["ids", "query"]
                }),
            ),
            spec(
                "get_knowledge_base_summary",
                "Summarize all knowledge collections with document and chunk counts.",
                json!({"type": "object", "properties": {}}),
            ),
            spec(
                "get_knowledge_base_health",
                "Report per-collection status and whether the vector store is reachable.",
                json!({"type": "object", "properties": {}}),
            ),
            spec(
                "get_storage_optimization",
                "Report chunk-size distribution and storage suggestions.",
                json!({"type": "object", "properties": {}}),
            ),
            spec(
                "get_popular_models",
                "List models ordered by recorded usage.",
                json!({"type": "object", "properties": {}}),
            ),
            spec(
                "compare_models",
                "Compare usage statistics for the named models.",
                json!({
                    "type": "object",
                    "properties": {"names": {"type": "array", "items": {"type": "string"}}},
                    "required": ["names"]
                }),
            ),
            spec(
                "get_model_performance",
                "Usage statistics for one model.",
                json!({
                    "type": "object",
                    "properties": {"name": {"type": "string"}},
                    "required": ["name"]
                }),
            ),
            spec(
                "get_system_health",
                "Overall component health: metadata store, vector store, embedding provider.",
                json!({"type": "object", "properties": {}}),
            ),
            spec(
                "check_component_health",
                "Health of one component: database, vector_store, or embeddings.",
                json!({
                    "type": "object",
                    "properties": {"component": {"type": "string"}},
                    "required": ["component"]
                }),
            ),
        ]
    }

    /// Invoke a tool by name with a JSON-object argument.
    pub async fn invoke(&self, name: &str, args: &Value) -> Result<Value> {
        debug!(tool = name, "Invoking tool");

        match name {
            "search_knowledge" => {
                let collection = required_str(args, "collectionId")?;
                let query = required_str(args, "query")?;
                let k = optional_k(args);
                self.search_one(collection, query, k).await
            }
            "search_all_knowledge" => {
                let query = required_str(args, "query")?;
                let k = optional_k(args);
                self.search_all(query, k).await
            }
            "compare_knowledge_bases" => {
                let query = required_str(args, "query")?;
                let ids = args
                    .get("ids")
                    .and_then(Value::as_array)
                    .ok_or_else(|| McpError::InvalidParameters("ids must be an array".into()))?;

                let mut sides = Vec::new();
                for id in ids {
                    let id = id.as_str().unwrap_or_default();
                    let hits = self.search_one(id, query, DEFAULT_SEARCH_K).await;
                    sides.push(json!({
                        "collection": id,
                        "results": hits.unwrap_or_else(|e| json!({"error": e.to_string()})),
                    }));
                }
                Ok(json!({ "query": query, "collections": sides }))
            }
            "get_knowledge_base_summary" => self.knowledge_summary().await,
            "get_knowledge_base_health" => self.knowledge_health().await,
            "get_storage_optimization" => self.storage_optimization().await,
            "get_popular_models" => {
                let usage = self.analytics.model_usage().await?;
                Ok(json!({ "models": usage }))
            }
            "compare_models" => {
                let names: Vec<String> = args
                    .get("names")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .ok_or_else(|| McpError::InvalidParameters("names must be an array".into()))?;

                let usage = self.analytics.model_usage().await?;
                let selected: Vec<_> = usage
                    .into_iter()
                    .filter(|m| names.contains(&m.model))
                    .collect();
                Ok(json!({ "models": selected }))
            }
            "get_model_performance" => {
                let name = required_str(args, "name")?;
                match self.analytics.model_performance(name).await? {
                    Some(usage) => Ok(serde_json::to_value(usage)?),
                    None => Err(AppError::NotFound(format!("model {name}"))),
                }
            }
            "get_system_health" => self.system_health().await,
            "check_component_health" => {
                let component = required_str(args, "component")?;
                self.component_health(component).await
            }
            other => Err(McpError::ToolNotFound(other.to_string()).into()),
        }
    }

    async fn search_one(&self, collection: &str, query: &str, k: usize) -> Result<Value> {
        let record = self.db.knowledge().resolve_collection(collection).await?;
        let vectors = self.embedder.embed(&[query.to_string()]).await?;
        let query_vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Validation("empty embedding response".into()))?;

        let hits = self
            .vectors
            .search(&record.name, &query_vector, k, None)
            .await?;

        Ok(json!({
            "collection": record.name,
            "hits": hits
                .iter()
                .map(|hit| json!({
                    "chunkId": hit.id,
                    "score": hit.score,
                    "fileName": hit.payload.file_name,
                    "text": hit.payload.text,
                }))
                .collect::<Vec<_>>(),
        }))
    }

    async fn search_all(&self, query: &str, k: usize) -> Result<Value> {
        let collections = self.db.knowledge().list_collections().await?;
        let vectors = self.embedder.embed(&[query.to_string()]).await?;
        let query_vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Validation("empty embedding response".into()))?;

        let mut merged = Vec::new();
        for collection in collections.iter().filter(|c| c.status == "Active") {
            let hits = match self
                .vectors
                .search(&collection.name, &query_vector, k, None)
                .await
            {
                Ok(hits) => hits,
                Err(_) => continue,
            };
            for hit in hits {
                merged.push(json!({
                    "collection": collection.name,
                    "chunkId": hit.id,
                    "score": hit.score,
                    "fileName": hit.payload.file_name,
                    "text": hit.payload.text,
                }));
            }
        }

        merged.sort_by(|a, b| {
            let sa = a["score"].as_f64().unwrap_or(0.0);
            let sb = b["score"].as_f64().unwrap_or(0.0);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });
        merged.truncate(k);

        Ok(json!({ "query": query, "hits": merged }))
    }

    async fn knowledge_summary(&self) -> Result<Value> {
        let collections = self.db.knowledge().list_collections().await?;
        Ok(json!({
            "totalCollections": collections.len(),
            "collections": collections
                .iter()
                .map(|c| json!({
                    "id": c.id,
                    "name": c.name,
                    "status": c.status,
                    "documentCount": c.document_count,
                    "chunkCount": c.chunk_count,
                    "embeddingModel": c.embedding_model,
                }))
                .collect::<Vec<_>>(),
        }))
    }

    async fn knowledge_health(&self) -> Result<Value> {
        let collections = self.db.knowledge().list_collections().await?;
        let vector_store_reachable = self.vectors.health().await;
        let vector_collections = if vector_store_reachable {
            self.vectors.list_collections().await.unwrap_or_default()
        } else {
            Vec::new()
        };

        Ok(json!({
            "vectorStoreReachable": vector_store_reachable,
            "collections": collections
                .iter()
                .map(|c| json!({
                    "name": c.name,
                    "status": c.status,
                    "chunkCount": c.chunk_count,
                    "vectorCollectionPresent": vector_collections.contains(&c.name),
                }))
                .collect::<Vec<_>>(),
        }))
    }

    async fn storage_optimization(&self) -> Result<Value> {
        let collections = self.db.knowledge().list_collections().await?;
        let mut total_chunks = 0i64;
        let mut empty_collections = Vec::new();

        for collection in &collections {
            total_chunks += collection.chunk_count;
            if collection.chunk_count == 0 {
                empty_collections.push(collection.name.clone());
            }
        }

        let mut suggestions = Vec::new();
        if !empty_collections.is_empty() {
            suggestions.push(format!(
                "Collections with no chunks could be removed: {}",
                empty_collections.join(", ")
            ));
        }

        Ok(json!({
            "totalChunks": total_chunks,
            "totalCollections": collections.len(),
            "emptyCollections": empty_collections,
            "suggestions": suggestions,
        }))
    }

    async fn system_health(&self) -> Result<Value> {
        let database = sqlx::query("SELECT 1").fetch_one(self.db.pool()).await.is_ok();
        let vector_store = self.vectors.health().await;

        let healthy = database && vector_store;
        Ok(json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "components": {
                "database": database,
                "vector_store": vector_store,
                "embeddings": { "model": self.embedder.model(), "dimension": self.embedder.dimension() },
            },
        }))
    }

    async fn component_health(&self, component: &str) -> Result<Value> {
        match component {
            "database" => {
                let ok = sqlx::query("SELECT 1").fetch_one(self.db.pool()).await.is_ok();
                Ok(json!({"component": "database", "healthy": ok}))
            }
            "vector_store" => Ok(json!({
                "component": "vector_store",
                "healthy": self.vectors.health().await,
            })),
            "embeddings" => Ok(json!({
                "component": "embeddings",
                "model": self.embedder.model(),
                "dimension": self.embedder.dimension(),
            })),
            other => Err(AppError::NotFound(format!("component {other}"))),
        }
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| McpError::InvalidParameters(format!("{key} is required")).into())
}

fn optional_k(args: &Value) -> usize {
    args.get("k")
        .and_then(Value::as_u64)
        .map(|k| k.clamp(1, 50) as usize)
        .unwrap_or(DEFAULT_SEARCH_K)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::RealtimeHub;
    use crate::vector::{InMemoryVectorStore, VectorPayload, VectorPoint};
    use async_trait::async_trait;
    use sha2::{Digest, Sha256};

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

    async fn registry() -> (ToolRegistry, Database, Arc<InMemoryVectorStore>) {
        let db = Database::open_in_memory("pass").await.unwrap();
        let vectors = Arc::new(InMemoryVectorStore::new());
        let hub = Arc::new(RealtimeHub::new(8));
        let analytics = Arc::new(AnalyticsService::new(db.clone(), hub));
        let registry = ToolRegistry::new(
            db.clone(),
            vectors.clone(),
            Arc::new(HashEmbedder),
            analytics,
        );
        (registry, db, vectors)
    }

    async fn seed_collection(db: &Database, vectors: &InMemoryVectorStore, name: &str) {
        let collection = db
            .knowledge()
            .ensure_collection(name, "hash-embedder", "InMemory")
            .await
            .unwrap();
        vectors.ensure_collection(name, 8).await.unwrap();
        vectors
            .upsert(
                name,
                vec![VectorPoint {
                    id: format!("{name}-chunk"),
                    vector: HashEmbedder::vector_for("heading B content"),
                    payload: VectorPayload {
                        collection_id: collection.id.clone(),
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
    }

    #[tokio::test]
    async fn test_specs_cover_the_advertised_set() {
        let (registry, _, _) = registry().await;
        let names: Vec<String> = registry.specs().iter().map(|s| s.name.clone()).collect();

        for expected in [
            "search_knowledge",
            "search_all_knowledge",
            "compare_knowledge_bases",
            "get_knowledge_base_summary",
            "get_knowledge_base_health",
            "get_storage_optimization",
            "get_popular_models",
            "compare_models",
            "get_model_performance",
            "get_system_health",
            "check_component_health",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn test_search_knowledge_returns_hits() {
        let (registry, db, vectors) = registry().await;
        seed_collection(&db, &vectors, "docs-x").await;

        let result = registry
            .invoke(
                "search_knowledge",
                &json!({"collectionId": "docs-x", "query": "heading B content"}),
            )
            .await
            .unwrap();

        let hits = result["hits"].as_array().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["fileName"], "guide.md");
        assert!(hits[0]["score"].as_f64().unwrap() > 0.99);
    }

    #[tokio::test]
    async fn test_search_all_merges_by_score() {
        let (registry, db, vectors) = registry().await;
        seed_collection(&db, &vectors, "docs-a").await;
        seed_collection(&db, &vectors, "docs-b").await;

        let result = registry
            .invoke("search_all_knowledge", &json!({"query": "heading B content", "k": 5}))
            .await
            .unwrap();

        let hits = result["hits"].as_array().unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_found() {
        let (registry, _, _) = registry().await;
        let err = registry.invoke("bogus", &json!({})).await.unwrap_err();
        assert!(matches!(err, AppError::Mcp(McpError::ToolNotFound(_))));
    }

    #[tokio::test]
    async fn test_missing_argument_is_invalid_params() {
        let (registry, _, _) = registry().await;
        let err = registry
            .invoke("search_knowledge", &json!({"collectionId": "x"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ValidationFailed");
    }

    #[tokio::test]
    async fn test_system_health_reports_components() {
        let (registry, _, _) = registry().await;
        let result = registry.invoke("get_system_health", &json!({})).await.unwrap();
        assert_eq!(result["status"], "healthy");
        assert_eq!(result["components"]["database"], true);
    }
}

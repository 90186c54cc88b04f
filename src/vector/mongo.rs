//! MongoDB backend: one document collection plus a vector search index per
//! knowledge collection
//!
//! `ensure_collection` provisions the search index and waits for it to
//! report Ready before returning; `search` runs a `$vectorSearch`
//! aggregation stage and reads the score from `vectorSearchScore` metadata.

use super::{finalize_hits, ScoredPoint, VectorPayload, VectorPoint, VectorStore};
use crate::config::AppConfig;
use crate::error::{AppError, Result, VectorError};
use async_trait::async_trait;
use futures::stream::TryStreamExt;
use mongodb::bson::{doc, to_bson, Document};
use mongodb::{Client, Database, SearchIndexModel, SearchIndexType};
use std::time::Duration;
use tracing::{debug, warn};

const INDEX_NAME: &str = "vector_index";

pub struct MongoVectorStore {
    database: Database,
    index_ready_timeout: Duration,
}

impl MongoVectorStore {
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let client = Client::with_uri_str(&config.vector_store.mongo.connection_string)
            .await
            .map_err(|e| AppError::Vector(VectorError::BackendUnavailable(e.to_string())))?;
        let database = client.database(&config.vector_store.mongo.database);

        debug!(database = %config.vector_store.mongo.database, "Connected MongoDB client");
        Ok(Self {
            database,
            index_ready_timeout: Duration::from_secs(
                config.vector_store.mongo.index_ready_timeout_secs,
            ),
        })
    }

    fn unavailable(e: impl std::fmt::Display) -> AppError {
        AppError::Vector(VectorError::BackendUnavailable(e.to_string()))
    }

    async fn index_is_ready(&self, name: &str) -> Result<bool> {
        let collection = self.database.collection::<Document>(name);
        let mut cursor = collection
            .list_search_indexes()
            .await
            .map_err(Self::unavailable)?;

        while let Some(index) = cursor.try_next().await.map_err(Self::unavailable)? {
            let is_target = index.get_str("name").map(|n| n == INDEX_NAME).unwrap_or(false);
            if is_target {
                let ready = index.get_str("status").map(|s| s == "READY").unwrap_or(false)
                    || index.get_bool("queryable").unwrap_or(false);
                return Ok(ready);
            }
        }
        Ok(false)
    }

    async fn has_index(&self, name: &str) -> Result<bool> {
        let collection = self.database.collection::<Document>(name);
        let mut cursor = collection
            .list_search_indexes()
            .await
            .map_err(Self::unavailable)?;
        while let Some(index) = cursor.try_next().await.map_err(Self::unavailable)? {
            if index.get_str("name").map(|n| n == INDEX_NAME).unwrap_or(false) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl VectorStore for MongoVectorStore {
    async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<()> {
        let names = self
            .database
            .list_collection_names()
            .await
            .map_err(Self::unavailable)?;
        if !names.contains(&name.to_string()) {
            self.database
                .create_collection(name)
                .await
                .map_err(Self::unavailable)?;
        }

        let collection = self.database.collection::<Document>(name);
        if !self.has_index(name).await? {
            let model = SearchIndexModel::builder()
                .definition(doc! {
                    "fields": [{
                        "type": "vector",
                        "path": "vector",
                        "numDimensions": dimension as i32,
                        "similarity": "cosine"
                    }]
                })
                .name(Some(INDEX_NAME.to_string()))
                .index_type(Some(SearchIndexType::VectorSearch))
                .build();

            collection
                .create_search_index(model)
                .await
                .map_err(Self::unavailable)?;
            debug!(collection = name, dimension, "Provisioning vector search index");
        }

        // Creation returns before the index is queryable; wait for Ready.
        let deadline = tokio::time::Instant::now() + self.index_ready_timeout;
        loop {
            if self.index_is_ready(name).await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(collection = name, "Vector search index not ready before timeout");
                return Err(AppError::Vector(VectorError::BackendUnavailable(format!(
                    "vector search index for {name} did not become ready"
                ))));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        self.database
            .list_collection_names()
            .await
            .map_err(Self::unavailable)
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.database
            .collection::<Document>(name)
            .drop()
            .await
            .map_err(Self::unavailable)?;
        Ok(())
    }

    async fn upsert(&self, name: &str, points: Vec<VectorPoint>) -> Result<()> {
        let collection = self.database.collection::<Document>(name);

        for point in points {
            let vector = to_bson(&point.vector)
                .map_err(|e| AppError::Vector(VectorError::UpsertFailed(e.to_string())))?;
            let payload = mongodb::bson::to_document(&point.payload)
                .map_err(|e| AppError::Vector(VectorError::UpsertFailed(e.to_string())))?;

            let replacement = doc! {
                "_id": &point.id,
                "vector": vector,
                "payload": payload,
            };

            collection
                .replace_one(doc! { "_id": &point.id }, replacement)
                .upsert(true)
                .await
                .map_err(|e| AppError::Vector(VectorError::UpsertFailed(e.to_string())))?;
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
        let collection = self.database.collection::<Document>(name);
        let query_vector = to_bson(&query.to_vec())
            .map_err(|e| AppError::Vector(VectorError::SearchFailed(e.to_string())))?;

        let pipeline = vec![
            doc! {
                "$vectorSearch": {
                    "index": INDEX_NAME,
                    "path": "vector",
                    "queryVector": query_vector,
                    "numCandidates": (k * 10).max(100) as i32,
                    "limit": k as i32,
                }
            },
            doc! {
                "$project": {
                    "_id": 1,
                    "payload": 1,
                    "score": { "$meta": "vectorSearchScore" }
                }
            },
        ];

        let mut cursor = collection
            .aggregate(pipeline)
            .await
            .map_err(|e| AppError::Vector(VectorError::SearchFailed(e.to_string())))?;

        let mut hits = Vec::new();
        while let Some(document) = cursor
            .try_next()
            .await
            .map_err(|e| AppError::Vector(VectorError::SearchFailed(e.to_string())))?
        {
            let id = document.get_str("_id").unwrap_or_default().to_string();
            let score = document.get_f64("score").unwrap_or_default() as f32;
            let payload = document
                .get_document("payload")
                .ok()
                .and_then(|d| mongodb::bson::from_document::<VectorPayload>(d.clone()).ok())
                .unwrap_or(VectorPayload {
                    collection_id: String::new(),
                    document_id: String::new(),
                    file_name: String::new(),
                    chunk_order: 0,
                    text: String::new(),
                    token_count: 0,
                });

            hits.push(ScoredPoint { id, score, payload });
        }

        Ok(finalize_hits(hits, k, min_score))
    }

    async fn delete_points(&self, name: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.database
            .collection::<Document>(name)
            .delete_many(doc! { "_id": { "$in": ids } })
            .await
            .map_err(Self::unavailable)?;
        Ok(())
    }

    async fn delete_by_document(&self, name: &str, document_id: &str) -> Result<()> {
        self.database
            .collection::<Document>(name)
            .delete_many(doc! { "payload.document_id": document_id })
            .await
            .map_err(Self::unavailable)?;
        Ok(())
    }

    async fn health(&self) -> bool {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .is_ok()
    }

    fn kind(&self) -> &'static str {
        "MongoDB"
    }
}

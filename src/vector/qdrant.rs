//! Qdrant backend over the gRPC data port
//!
//! The data port (default 6334) carries collection and point operations; the
//! REST port (default 6333) is only used for the reachability probe.

use super::{finalize_hits, ScoredPoint, VectorPoint, VectorStore};
use crate::config::AppConfig;
use crate::error::{AppError, Result, VectorError};
use async_trait::async_trait;
use qdrant_client::qdrant::{
    value::Kind, Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter,
    PointStruct, PointsIdsList, SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, error};

pub struct QdrantVectorStore {
    client: Qdrant,
    http: reqwest::Client,
    health_url: String,
}

impl QdrantVectorStore {
    /// Connect the gRPC client. Connection failures surface as the backend
    /// being unavailable.
    pub fn connect(config: &AppConfig) -> Result<Self> {
        let grpc_url = config.qdrant_grpc_url();
        let mut builder = Qdrant::from_url(&grpc_url)
            .timeout(std::time::Duration::from_secs(config.vector_store.search_timeout_secs));
        if let Some(api_key) = &config.vector_store.qdrant.api_key {
            builder = builder.api_key(api_key.clone());
        }

        let client = builder
            .build()
            .map_err(|e| AppError::Vector(VectorError::BackendUnavailable(e.to_string())))?;

        debug!(url = %grpc_url, "Connected Qdrant gRPC client");
        Ok(Self {
            client,
            http: reqwest::Client::new(),
            health_url: format!("{}/healthz", config.qdrant_health_url()),
        })
    }

    fn unavailable(e: impl std::fmt::Display) -> AppError {
        AppError::Vector(VectorError::BackendUnavailable(e.to_string()))
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<()> {
        let exists = self
            .client
            .collection_exists(name)
            .await
            .map_err(Self::unavailable)?;
        if exists {
            return Ok(());
        }

        self.client
            .create_collection(
                CreateCollectionBuilder::new(name).vectors_config(VectorParamsBuilder::new(
                    dimension as u64,
                    Distance::Cosine,
                )),
            )
            .await
            .map_err(Self::unavailable)?;

        debug!(collection = name, dimension, "Created Qdrant collection");
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .list_collections()
            .await
            .map_err(Self::unavailable)?;
        Ok(response
            .collections
            .into_iter()
            .map(|collection| collection.name)
            .collect())
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let exists = self
            .client
            .collection_exists(name)
            .await
            .map_err(Self::unavailable)?;
        if !exists {
            return Ok(());
        }

        self.client
            .delete_collection(name)
            .await
            .map_err(Self::unavailable)?;
        Ok(())
    }

    async fn upsert(&self, name: &str, points: Vec<VectorPoint>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let point_count = points.len();
        let points: Vec<PointStruct> = points
            .into_iter()
            .map(|point| {
                let payload: Payload = Payload::try_from(json!({
                    "collection_id": point.payload.collection_id,
                    "document_id": point.payload.document_id,
                    "file_name": point.payload.file_name,
                    "chunk_order": point.payload.chunk_order,
                    "text": point.payload.text,
                    "token_count": point.payload.token_count,
                }))
                .unwrap_or_default();
                PointStruct::new(point.id, point.vector, payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(name, points).wait(true))
            .await
            .map_err(|e| {
                error!(collection = name, error = %e, "Qdrant upsert failed");
                AppError::Vector(VectorError::UpsertFailed(e.to_string()))
            })?;

        debug!(collection = name, points = point_count, "Upserted points");
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        query: &[f32],
        k: usize,
        min_score: Option<f32>,
    ) -> Result<Vec<ScoredPoint>> {
        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(name, query.to_vec(), k as u64).with_payload(true),
            )
            .await
            .map_err(|e| {
                error!(collection = name, error = %e, "Qdrant search failed");
                AppError::Vector(VectorError::SearchFailed(e.to_string()))
            })?;

        let hits = response
            .result
            .into_iter()
            .map(|point| ScoredPoint {
                id: point
                    .id
                    .and_then(|id| id.point_id_options)
                    .map(point_id_to_string)
                    .unwrap_or_default(),
                score: point.score,
                payload: payload_from_map(point.payload),
            })
            .collect();

        Ok(finalize_hits(hits, k, min_score))
    }

    async fn delete_points(&self, name: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let ids: Vec<_> = ids.iter().map(|id| id.clone().into()).collect();
        self.client
            .delete_points(
                DeletePointsBuilder::new(name)
                    .points(PointsIdsList { ids })
                    .wait(true),
            )
            .await
            .map_err(Self::unavailable)?;
        Ok(())
    }

    async fn delete_by_document(&self, name: &str, document_id: &str) -> Result<()> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(name)
                    .points(Filter::must([Condition::matches(
                        "document_id",
                        document_id.to_string(),
                    )]))
                    .wait(true),
            )
            .await
            .map_err(Self::unavailable)?;
        Ok(())
    }

    async fn health(&self) -> bool {
        match self.http.get(&self.health_url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn kind(&self) -> &'static str {
        "Qdrant"
    }
}

fn point_id_to_string(id: qdrant_client::qdrant::point_id::PointIdOptions) -> String {
    use qdrant_client::qdrant::point_id::PointIdOptions;
    match id {
        PointIdOptions::Uuid(uuid) => uuid,
        PointIdOptions::Num(num) => num.to_string(),
    }
}

fn payload_from_map(map: HashMap<String, qdrant_client::qdrant::Value>) -> super::VectorPayload {
    let get_str = |key: &str| -> String {
        map.get(key)
            .and_then(|v| match &v.kind {
                Some(Kind::StringValue(s)) => Some(s.clone()),
                _ => None,
            })
            .unwrap_or_default()
    };
    let get_int = |key: &str| -> i64 {
        map.get(key)
            .and_then(|v| match &v.kind {
                Some(Kind::IntegerValue(i)) => Some(*i),
                Some(Kind::DoubleValue(d)) => Some(*d as i64),
                _ => None,
            })
            .unwrap_or_default()
    };

    super::VectorPayload {
        collection_id: get_str("collection_id"),
        document_id: get_str("document_id"),
        file_name: get_str("file_name"),
        chunk_order: get_int("chunk_order"),
        text: get_str("text"),
        token_count: get_int("token_count"),
    }
}

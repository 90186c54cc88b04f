//! Ingestion pipeline: parse, chunk, embed, upsert, record
//!
//! Chunk rows are written only after their vector points are upserted. A
//! crash between the two leaves orphan points, which the re-ingest path
//! cleans up by deleting everything keyed to the deterministic document id
//! before inserting again.

pub mod chunker;
pub mod parser;
pub mod tokenizer;

use crate::db::{ChunkRecord, CollectionRecord, Database, DocumentRecord};
use crate::db::knowledge::DocumentStatus;
use crate::embedding::EmbeddingClient;
use crate::error::{AppError, Result};
use crate::vector::{VectorPayload, VectorPoint, VectorStore};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use chunker::{Chunk, ChunkerConfig, DocumentChunker};
pub use parser::{parse_document, DocumentElement, FileType, StructuredDocument};
pub use tokenizer::TokenEstimator;

/// A source handed to the pipeline
#[derive(Debug, Clone)]
pub struct IngestSource {
    /// Display name, also used to resolve the parser
    pub file_name: String,
    /// Stable path or logical identifier of the source
    pub source_path: String,
    pub bytes: Vec<u8>,
}

/// Result of one ingestion
#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestionOutcome {
    pub document_id: String,
    pub chunk_count: usize,
}

/// Orchestrates parse → chunk → embed → upsert → record
pub struct IngestionPipeline {
    db: Database,
    embedder: Arc<dyn EmbeddingClient>,
    vectors: Arc<dyn VectorStore>,
    collection_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IngestionPipeline {
    pub fn new(
        db: Database,
        embedder: Arc<dyn EmbeddingClient>,
        vectors: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            db,
            embedder,
            vectors,
            collection_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Deterministic document id from collection, source path, and content.
    pub fn document_id(collection: &str, source_path: &str, bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(collection.as_bytes());
        hasher.update(source_path.as_bytes());
        hasher.update(bytes);
        hex::encode(hasher.finalize())[..32].to_string()
    }

    /// Ingest one source into a collection. Ingestions of the same
    /// collection serialize; different collections proceed in parallel.
    pub async fn ingest(
        &self,
        collection_name: &str,
        source: IngestSource,
    ) -> Result<IngestionOutcome> {
        let lock = self.collection_lock(collection_name).await;
        let _guard = lock.lock().await;

        // Fail fast on formats we cannot parse
        let file_type = FileType::from_file_name(&source.file_name).map_err(AppError::Parse)?;
        let document_id = Self::document_id(collection_name, &source.source_path, &source.bytes);

        let collection = self
            .db
            .knowledge()
            .ensure_collection(collection_name, self.embedder.model(), self.vectors.kind())
            .await?;

        // Parsing is CPU-bound (PDF extraction in particular); keep it off
        // the reactor.
        let file_name = source.file_name.clone();
        let bytes = source.bytes.clone();
        let parsed = tokio::task::spawn_blocking(move || parse_document(&file_name, &bytes))
            .await
            .map_err(|e| AppError::Config(format!("parser task failed: {e}")))?;

        let document = match parsed {
            Ok(document) => document,
            Err(e) => {
                self.record_document_error(&collection, &document_id, &source, file_type, &e.to_string())
                    .await?;
                return Err(AppError::Parse(e));
            }
        };

        let chunking = self.db.settings().chunking().await?;
        let encoding = self
            .db
            .settings()
            .get_or("TokenizerEncoding", "cl100k_base")
            .await?;
        let chunker = DocumentChunker::new(
            ChunkerConfig {
                max_tokens: chunking.max_tokens,
                overlap_tokens: chunking.overlap_tokens,
                hard_char_cap: chunking.hard_char_cap,
                max_code_fence_size: chunking.max_code_fence_size,
            },
            TokenEstimator::new(&encoding),
        );

        let chunks = match chunker.chunk(&document) {
            Ok(chunks) => chunks,
            Err(e) => {
                self.record_document_error(&collection, &document_id, &source, file_type, &e.to_string())
                    .await?;
                return Err(AppError::Parse(e));
            }
        };

        match self
            .store_chunks(&collection, &document_id, &source, file_type, &chunks)
            .await
        {
            Ok(()) => {
                info!(
                    collection = collection_name,
                    document_id = %document_id,
                    chunks = chunks.len(),
                    "Ingestion complete"
                );
                Ok(IngestionOutcome {
                    document_id,
                    chunk_count: chunks.len(),
                })
            }
            Err(e) => {
                warn!(document_id = %document_id, error = %e, "Ingestion failed after parsing");
                self.db
                    .knowledge()
                    .set_document_status(&document_id, DocumentStatus::Error, Some(&e.to_string()), None)
                    .await
                    .ok();
                Err(e)
            }
        }
    }

    /// Steps 4–7: ensure the vector collection, write the document row,
    /// embed and upsert every chunk, then finalize statuses and counts.
    async fn store_chunks(
        &self,
        collection: &CollectionRecord,
        document_id: &str,
        source: &IngestSource,
        file_type: FileType,
        chunks: &[Chunk],
    ) -> Result<()> {
        self.vectors
            .ensure_collection(&collection.name, self.embedder.dimension())
            .await?;

        self.db
            .knowledge()
            .upsert_document(&DocumentRecord {
                id: document_id.to_string(),
                collection_id: collection.id.clone(),
                original_file_name: source.file_name.clone(),
                file_size: source.bytes.len() as i64,
                file_type: file_type.as_str().to_string(),
                chunk_count: 0,
                processing_status: DocumentStatus::Processing.as_str().to_string(),
                error_message: None,
                uploaded_at: Utc::now(),
                processed_at: None,
            })
            .await?;

        // Re-ingesting the same source: clear prior chunks and their vector
        // points before inserting the new set.
        let stale = self
            .db
            .knowledge()
            .delete_chunks_by_document(document_id)
            .await?;
        if !stale.is_empty() {
            debug!(document_id, stale = stale.len(), "Clearing prior chunks for re-ingest");
        }
        self.vectors
            .delete_by_document(&collection.name, document_id)
            .await?;

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed(&texts).await?;
        if embeddings.len() != chunks.len() {
            return Err(AppError::Llm(crate::error::LlmError::InvalidResponse(format!(
                "embedder returned {} vectors for {} chunks",
                embeddings.len(),
                chunks.len()
            ))));
        }

        let mut points = Vec::with_capacity(chunks.len());
        let mut records = Vec::with_capacity(chunks.len());
        for (chunk, vector) in chunks.iter().zip(embeddings) {
            let chunk_id = Uuid::new_v4().to_string();
            points.push(VectorPoint {
                id: chunk_id.clone(),
                vector,
                payload: VectorPayload {
                    collection_id: collection.id.clone(),
                    document_id: document_id.to_string(),
                    file_name: source.file_name.clone(),
                    chunk_order: chunk.order,
                    text: chunk.text.clone(),
                    token_count: chunk.token_count as i64,
                },
            });
            records.push(ChunkRecord {
                id: chunk_id,
                collection_id: collection.id.clone(),
                document_id: document_id.to_string(),
                chunk_text: chunk.text.clone(),
                chunk_order: chunk.order,
                token_count: chunk.token_count as i64,
                character_count: chunk.character_count as i64,
                vector_stored: true,
            });
        }

        // Vector upsert strictly before the chunk rows
        self.vectors.upsert(&collection.name, points).await?;
        for record in &records {
            self.db.knowledge().insert_chunk(record).await?;
        }

        self.db
            .knowledge()
            .set_document_status(
                document_id,
                DocumentStatus::Complete,
                None,
                Some(chunks.len() as i64),
            )
            .await?;
        self.db
            .knowledge()
            .refresh_collection_counts(&collection.id)
            .await?;

        Ok(())
    }

    async fn record_document_error(
        &self,
        collection: &CollectionRecord,
        document_id: &str,
        source: &IngestSource,
        file_type: FileType,
        message: &str,
    ) -> Result<()> {
        self.db
            .knowledge()
            .upsert_document(&DocumentRecord {
                id: document_id.to_string(),
                collection_id: collection.id.clone(),
                original_file_name: source.file_name.clone(),
                file_size: source.bytes.len() as i64,
                file_type: file_type.as_str().to_string(),
                chunk_count: 0,
                processing_status: DocumentStatus::Error.as_str().to_string(),
                error_message: Some(message.to_string()),
                uploaded_at: Utc::now(),
                processed_at: Some(Utc::now()),
            })
            .await
    }

    /// Destroy a collection: metadata rows and the vector-store collection
    /// in one logical operation.
    pub async fn delete_collection(&self, id_or_name: &str) -> Result<()> {
        let collection = self.db.knowledge().resolve_collection(id_or_name).await?;
        let lock = self.collection_lock(&collection.name).await;
        let _guard = lock.lock().await;

        self.vectors.delete_collection(&collection.name).await?;
        self.db.knowledge().delete_collection(&collection.id).await?;
        info!(collection = %collection.name, "Deleted collection");
        Ok(())
    }

    async fn collection_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.collection_locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParseError;
    use crate::vector::InMemoryVectorStore;
    use async_trait::async_trait;

    /// Deterministic embedder: vector derived from text bytes
    pub(crate) struct StubEmbedder {
        dimension: usize,
    }

    impl StubEmbedder {
        pub(crate) fn new(dimension: usize) -> Self {
            Self { dimension }
        }

        pub(crate) fn vector_for(&self, text: &str) -> Vec<f32> {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            let digest = hasher.finalize();
            (0..self.dimension)
                .map(|i| digest[i % digest.len()] as f32 / 255.0)
                .collect()
        }
    }

    #[async_trait]
    impl EmbeddingClient for StubEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| self.vector_for(t)).collect())
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn model(&self) -> &str {
            "stub-embedder"
        }
    }

    async fn pipeline() -> (IngestionPipeline, Database, Arc<InMemoryVectorStore>) {
        let db = Database::open_in_memory("pass").await.unwrap();
        let vectors = Arc::new(InMemoryVectorStore::new());
        let pipeline = IngestionPipeline::new(
            db.clone(),
            Arc::new(StubEmbedder::new(8)),
            vectors.clone(),
        );
        (pipeline, db, vectors)
    }

    fn markdown_source() -> IngestSource {
        IngestSource {
            file_name: "guide.md".to_string(),
            source_path: "/docs/guide.md".to_string(),
            bytes: b"# A\n\nalpha beta gamma.\n\n## B\n\ndelta epsilon zeta.\n\n## C\n\neta theta iota."
                .to_vec(),
        }
    }

    #[tokio::test]
    async fn test_ingest_writes_rows_and_points() {
        let (pipeline, db, vectors) = pipeline().await;

        let outcome = pipeline.ingest("docs-x", markdown_source()).await.unwrap();
        assert!(outcome.chunk_count > 0);

        let document = db.knowledge().document(&outcome.document_id).await.unwrap().unwrap();
        assert_eq!(document.processing_status, "Complete");
        assert_eq!(document.chunk_count as usize, outcome.chunk_count);

        let chunks = db.knowledge().chunks_by_document(&outcome.document_id).await.unwrap();
        assert_eq!(chunks.len(), outcome.chunk_count);
        assert!(chunks.iter().all(|c| c.vector_stored));

        // Chunk rows equal vector points
        let embedder = StubEmbedder::new(8);
        let hits = vectors
            .search("docs-x", &embedder.vector_for(&chunks[0].chunk_text), 100, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), outcome.chunk_count);

        // Denormalized counts caught up
        let collection = db.knowledge().collection_by_name("docs-x").await.unwrap().unwrap();
        assert_eq!(collection.document_count, 1);
        assert_eq!(collection.chunk_count as usize, outcome.chunk_count);
    }

    #[tokio::test]
    async fn test_reingest_is_idempotent() {
        let (pipeline, db, vectors) = pipeline().await;

        let first = pipeline.ingest("docs-x", markdown_source()).await.unwrap();
        let second = pipeline.ingest("docs-x", markdown_source()).await.unwrap();

        assert_eq!(first.document_id, second.document_id);
        assert_eq!(first.chunk_count, second.chunk_count);

        let chunks = db.knowledge().chunks_by_document(&second.document_id).await.unwrap();
        assert_eq!(chunks.len(), second.chunk_count);

        let embedder = StubEmbedder::new(8);
        let hits = vectors
            .search("docs-x", &embedder.vector_for(&chunks[0].chunk_text), 100, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), second.chunk_count);
    }

    #[tokio::test]
    async fn test_empty_source_marks_document_error() {
        let (pipeline, db, _) = pipeline().await;

        let source = IngestSource {
            file_name: "empty.txt".to_string(),
            source_path: "/docs/empty.txt".to_string(),
            bytes: b"  \n\n ".to_vec(),
        };
        let document_id =
            IngestionPipeline::document_id("docs-x", &source.source_path, &source.bytes);

        let err = pipeline.ingest("docs-x", source).await.unwrap_err();
        assert!(matches!(err, AppError::Parse(ParseError::Empty)));

        let document = db.knowledge().document(&document_id).await.unwrap().unwrap();
        assert_eq!(document.processing_status, "Error");
        assert!(document.error_message.is_some());
    }

    #[tokio::test]
    async fn test_unsupported_format_fails_fast() {
        let (pipeline, db, _) = pipeline().await;

        let err = pipeline
            .ingest(
                "docs-x",
                IngestSource {
                    file_name: "slides.pptx".to_string(),
                    source_path: "/docs/slides.pptx".to_string(),
                    bytes: b"irrelevant".to_vec(),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Parse(ParseError::UnsupportedFormat(_))));
        // No collection row is created before the format check
        assert!(db.knowledge().collection_by_name("docs-x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_collection_cascades_vectors() {
        let (pipeline, db, vectors) = pipeline().await;
        pipeline.ingest("docs-x", markdown_source()).await.unwrap();

        pipeline.delete_collection("docs-x").await.unwrap();
        assert!(db.knowledge().collection_by_name("docs-x").await.unwrap().is_none());
        assert!(vectors.list_collections().await.unwrap().is_empty());
    }

    #[test]
    fn test_document_id_is_stable() {
        let a = IngestionPipeline::document_id("c", "/p/a.md", b"content");
        let b = IngestionPipeline::document_id("c", "/p/a.md", b"content");
        let c = IngestionPipeline::document_id("c", "/p/a.md", b"different");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }
}

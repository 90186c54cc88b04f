//! Knowledge-collection, document, and chunk repositories

use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

/// Collection lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionStatus {
    Active,
    Processing,
    Error,
    Deleted,
}

impl CollectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Processing => "Processing",
            Self::Error => "Error",
            Self::Deleted => "Deleted",
        }
    }
}

/// Document processing status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentStatus {
    Pending,
    Processing,
    Complete,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Processing => "Processing",
            Self::Complete => "Complete",
            Self::Error => "Error",
        }
    }
}

/// A knowledge collection row; counts are denormalized
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub document_count: i64,
    pub chunk_count: i64,
    pub embedding_model: String,
    pub vector_store_kind: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A document row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub collection_id: String,
    pub original_file_name: String,
    pub file_size: i64,
    pub file_type: String,
    pub chunk_count: i64,
    pub processing_status: String,
    pub error_message: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// A chunk row; `vector_stored` means a vector point keyed by this id exists
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub collection_id: String,
    pub document_id: String,
    pub chunk_text: String,
    pub chunk_order: i64,
    pub token_count: i64,
    pub character_count: i64,
    pub vector_stored: bool,
}

/// Repository over `collections`, `documents`, and `chunks`
#[derive(Clone)]
pub struct KnowledgeStore {
    pool: SqlitePool,
}

impl KnowledgeStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Find a collection by name, creating it when missing.
    pub async fn ensure_collection(
        &self,
        name: &str,
        embedding_model: &str,
        vector_store_kind: &str,
    ) -> Result<CollectionRecord> {
        if let Some(existing) = self.collection_by_name(name).await? {
            return Ok(existing);
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO collections (id, name, embedding_model, vector_store_kind, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'Active', ?5, ?5)
            "#,
        )
        .bind(&id)
        .bind(name)
        .bind(embedding_model)
        .bind(vector_store_kind)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(collection = name, "Created collection row");
        self.collection_by_name(name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("collection {name}")))
    }

    pub async fn collection_by_name(&self, name: &str) -> Result<Option<CollectionRecord>> {
        let row = sqlx::query("SELECT * FROM collections WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| read_collection(&row)).transpose()
    }

    pub async fn collection_by_id(&self, id: &str) -> Result<Option<CollectionRecord>> {
        let row = sqlx::query("SELECT * FROM collections WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| read_collection(&row)).transpose()
    }

    /// Resolve a collection by id or name.
    pub async fn resolve_collection(&self, id_or_name: &str) -> Result<CollectionRecord> {
        if let Some(found) = self.collection_by_id(id_or_name).await? {
            return Ok(found);
        }
        self.collection_by_name(id_or_name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("collection {id_or_name}")))
    }

    pub async fn list_collections(&self) -> Result<Vec<CollectionRecord>> {
        let rows = sqlx::query("SELECT * FROM collections WHERE status != 'Deleted' ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(read_collection).collect()
    }

    pub async fn set_collection_status(&self, id: &str, status: CollectionStatus) -> Result<()> {
        sqlx::query("UPDATE collections SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Recompute the denormalized counts from child rows.
    pub async fn refresh_collection_counts(&self, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE collections SET
                document_count = (SELECT COUNT(*) FROM documents WHERE collection_id = ?1),
                chunk_count = (SELECT COUNT(*) FROM chunks WHERE collection_id = ?1),
                updated_at = ?2
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a collection and everything under it in one transaction.
    pub async fn delete_collection(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE collection_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE collection_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM collections WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("collection {id}")));
        }
        Ok(())
    }

    /// Insert or replace a document row.
    pub async fn upsert_document(&self, doc: &DocumentRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents
                (id, collection_id, original_file_name, file_size, file_type, chunk_count,
                 processing_status, error_message, uploaded_at, processed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                collection_id = ?2, original_file_name = ?3, file_size = ?4, file_type = ?5,
                chunk_count = ?6, processing_status = ?7, error_message = ?8,
                uploaded_at = ?9, processed_at = ?10
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.collection_id)
        .bind(&doc.original_file_name)
        .bind(doc.file_size)
        .bind(&doc.file_type)
        .bind(doc.chunk_count)
        .bind(&doc.processing_status)
        .bind(&doc.error_message)
        .bind(doc.uploaded_at.to_rfc3339())
        .bind(doc.processed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_document_status(
        &self,
        id: &str,
        status: DocumentStatus,
        error_message: Option<&str>,
        chunk_count: Option<i64>,
    ) -> Result<()> {
        let processed_at = matches!(status, DocumentStatus::Complete | DocumentStatus::Error)
            .then(|| Utc::now().to_rfc3339());

        sqlx::query(
            r#"
            UPDATE documents SET
                processing_status = ?1,
                error_message = ?2,
                chunk_count = COALESCE(?3, chunk_count),
                processed_at = COALESCE(?4, processed_at)
            WHERE id = ?5
            "#,
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(chunk_count)
        .bind(processed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn document(&self, id: &str) -> Result<Option<DocumentRecord>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| read_document(&row)).transpose()
    }

    pub async fn documents_in_collection(&self, collection_id: &str) -> Result<Vec<DocumentRecord>> {
        let rows =
            sqlx::query("SELECT * FROM documents WHERE collection_id = ?1 ORDER BY uploaded_at")
                .bind(collection_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(read_document).collect()
    }

    pub async fn insert_chunk(&self, chunk: &ChunkRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO chunks
                (id, collection_id, document_id, chunk_text, chunk_order, token_count, character_count, vector_stored)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.collection_id)
        .bind(&chunk.document_id)
        .bind(&chunk.chunk_text)
        .bind(chunk.chunk_order)
        .bind(chunk.token_count)
        .bind(chunk.character_count)
        .bind(chunk.vector_stored as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn chunks_by_document(&self, document_id: &str) -> Result<Vec<ChunkRecord>> {
        let rows =
            sqlx::query("SELECT * FROM chunks WHERE document_id = ?1 ORDER BY chunk_order ASC")
                .bind(document_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(read_chunk).collect()
    }

    /// Remove chunk rows for a document; returns the ids removed so the
    /// caller can clear the matching vector points.
    pub async fn delete_chunks_by_document(&self, document_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM chunks WHERE document_id = ?1")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;
        let ids: Vec<String> = rows.iter().map(|row| row.get("id")).collect();

        sqlx::query("DELETE FROM chunks WHERE document_id = ?1")
            .bind(document_id)
            .execute(&self.pool)
            .await?;

        Ok(ids)
    }

    pub async fn chunk_count(&self, collection_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM chunks WHERE collection_id = ?1")
            .bind(collection_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

fn read_collection(row: &sqlx::sqlite::SqliteRow) -> Result<CollectionRecord> {
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    Ok(CollectionRecord {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        document_count: row.get("document_count"),
        chunk_count: row.get("chunk_count"),
        embedding_model: row.get("embedding_model"),
        vector_store_kind: row.get("vector_store_kind"),
        status: row.get("status"),
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn read_document(row: &sqlx::sqlite::SqliteRow) -> Result<DocumentRecord> {
    let uploaded_at: String = row.get("uploaded_at");
    let processed_at: Option<String> = row.get("processed_at");
    Ok(DocumentRecord {
        id: row.get("id"),
        collection_id: row.get("collection_id"),
        original_file_name: row.get("original_file_name"),
        file_size: row.get("file_size"),
        file_type: row.get("file_type"),
        chunk_count: row.get("chunk_count"),
        processing_status: row.get("processing_status"),
        error_message: row.get("error_message"),
        uploaded_at: parse_ts(&uploaded_at)?,
        processed_at: processed_at.as_deref().map(parse_ts).transpose()?,
    })
}

fn read_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<ChunkRecord> {
    let vector_stored: i64 = row.get("vector_stored");
    Ok(ChunkRecord {
        id: row.get("id"),
        collection_id: row.get("collection_id"),
        document_id: row.get("document_id"),
        chunk_text: row.get("chunk_text"),
        chunk_order: row.get("chunk_order"),
        token_count: row.get("token_count"),
        character_count: row.get("character_count"),
        vector_stored: vector_stored != 0,
    })
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Config(format!("Corrupt timestamp in metadata store: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn store() -> KnowledgeStore {
        Database::open_in_memory("pass").await.unwrap().knowledge()
    }

    fn doc(id: &str, collection_id: &str) -> DocumentRecord {
        DocumentRecord {
            id: id.to_string(),
            collection_id: collection_id.to_string(),
            original_file_name: "notes.md".to_string(),
            file_size: 128,
            file_type: "md".to_string(),
            chunk_count: 0,
            processing_status: DocumentStatus::Processing.as_str().to_string(),
            error_message: None,
            uploaded_at: Utc::now(),
            processed_at: None,
        }
    }

    #[tokio::test]
    async fn test_ensure_collection_is_idempotent() {
        let store = store().await;
        let a = store
            .ensure_collection("docs-x", "nomic-embed-text", "Qdrant")
            .await
            .unwrap();
        let b = store
            .ensure_collection("docs-x", "nomic-embed-text", "Qdrant")
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.status, "Active");
    }

    #[tokio::test]
    async fn test_counts_refresh_from_children() {
        let store = store().await;
        let collection = store
            .ensure_collection("docs-x", "nomic-embed-text", "Qdrant")
            .await
            .unwrap();

        store.upsert_document(&doc("d1", &collection.id)).await.unwrap();
        for i in 0..3 {
            store
                .insert_chunk(&ChunkRecord {
                    id: format!("k{i}"),
                    collection_id: collection.id.clone(),
                    document_id: "d1".to_string(),
                    chunk_text: format!("chunk {i}"),
                    chunk_order: i,
                    token_count: 2,
                    character_count: 7,
                    vector_stored: true,
                })
                .await
                .unwrap();
        }

        store.refresh_collection_counts(&collection.id).await.unwrap();
        let refreshed = store.collection_by_id(&collection.id).await.unwrap().unwrap();
        assert_eq!(refreshed.document_count, 1);
        assert_eq!(refreshed.chunk_count, 3);
    }

    #[tokio::test]
    async fn test_delete_chunks_returns_ids() {
        let store = store().await;
        let collection = store
            .ensure_collection("docs-x", "nomic-embed-text", "Qdrant")
            .await
            .unwrap();
        store.upsert_document(&doc("d1", &collection.id)).await.unwrap();
        store
            .insert_chunk(&ChunkRecord {
                id: "k0".to_string(),
                collection_id: collection.id.clone(),
                document_id: "d1".to_string(),
                chunk_text: "text".to_string(),
                chunk_order: 0,
                token_count: 1,
                character_count: 4,
                vector_stored: true,
            })
            .await
            .unwrap();

        let ids = store.delete_chunks_by_document("d1").await.unwrap();
        assert_eq!(ids, vec!["k0".to_string()]);
        assert!(store.chunks_by_document("d1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cascading_collection_delete() {
        let store = store().await;
        let collection = store
            .ensure_collection("docs-x", "nomic-embed-text", "Qdrant")
            .await
            .unwrap();
        store.upsert_document(&doc("d1", &collection.id)).await.unwrap();

        store.delete_collection(&collection.id).await.unwrap();
        assert!(store.collection_by_id(&collection.id).await.unwrap().is_none());
        assert!(store.document("d1").await.unwrap().is_none());

        let err = store.delete_collection(&collection.id).await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[tokio::test]
    async fn test_document_status_transitions() {
        let store = store().await;
        let collection = store
            .ensure_collection("docs-x", "nomic-embed-text", "Qdrant")
            .await
            .unwrap();
        store.upsert_document(&doc("d1", &collection.id)).await.unwrap();

        store
            .set_document_status("d1", DocumentStatus::Complete, None, Some(7))
            .await
            .unwrap();
        let updated = store.document("d1").await.unwrap().unwrap();
        assert_eq!(updated.processing_status, "Complete");
        assert_eq!(updated.chunk_count, 7);
        assert!(updated.processed_at.is_some());
    }
}

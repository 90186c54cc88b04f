//! Embedded metadata store: schema bootstrap, migrations, and repositories

pub mod conversations;
pub mod knowledge;
pub mod metrics;
pub mod settings;

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tracing::{debug, info, warn};

pub use conversations::{Conversation, ConversationStore, StoredMessage};
pub use knowledge::{ChunkRecord, CollectionRecord, DocumentRecord, KnowledgeStore};
pub use metrics::{MetricsStore, UsageMetric};
pub use settings::{ChunkingSettings, SettingsStore};

const SCHEMA_VERSION: i64 = 2;

/// Handle to the metadata store; cheap to clone
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    settings_key: [u8; 32],
}

impl Database {
    /// Open (and create if missing) the database file, apply schema and
    /// migrations, and seed default settings. Parent directories are created
    /// as needed; calling open twice on the same path is harmless.
    pub async fn open(path: &Path, settings_passphrase: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        Self::bootstrap(pool, settings_passphrase).await
    }

    /// In-memory database for tests and ephemeral runs
    pub async fn open_in_memory(settings_passphrase: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        // A pooled in-memory database must stay on one connection
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::bootstrap(pool, settings_passphrase).await
    }

    async fn bootstrap(pool: SqlitePool, settings_passphrase: &str) -> Result<Self> {
        apply_schema(&pool).await?;
        migrate(&pool).await?;

        let settings_key = settings::bootstrap_encryption(&pool, settings_passphrase).await?;
        let db = Self { pool, settings_key };
        db.settings().seed_defaults().await?;

        info!("Metadata store ready");
        Ok(db)
    }

    /// Borrow the underlying pool; repositories acquire a connection per
    /// operation from here.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn settings(&self) -> SettingsStore {
        SettingsStore::new(self.pool.clone(), self.settings_key)
    }

    pub fn conversations(&self) -> ConversationStore {
        ConversationStore::new(self.pool.clone())
    }

    pub fn knowledge(&self) -> KnowledgeStore {
        KnowledgeStore::new(self.pool.clone())
    }

    pub fn metrics(&self) -> MetricsStore {
        MetricsStore::new(self.pool.clone())
    }
}

async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    debug!("Applying schema DDL");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL,
            applied_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            document_count INTEGER NOT NULL DEFAULT 0,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            embedding_model TEXT NOT NULL,
            vector_store_kind TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'Active',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            collection_id TEXT NOT NULL,
            original_file_name TEXT NOT NULL,
            file_size INTEGER NOT NULL DEFAULT 0,
            file_type TEXT NOT NULL,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            processing_status TEXT NOT NULL DEFAULT 'Pending',
            error_message TEXT,
            uploaded_at TEXT NOT NULL,
            processed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            collection_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            chunk_text TEXT NOT NULL,
            chunk_order INTEGER NOT NULL,
            token_count INTEGER NOT NULL DEFAULT 0,
            character_count INTEGER NOT NULL DEFAULT 0,
            vector_stored INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_collection ON chunks(collection_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            client_id TEXT,
            title TEXT,
            knowledge_id TEXT,
            provider TEXT NOT NULL,
            model_name TEXT NOT NULL,
            temperature REAL NOT NULL DEFAULT 0.7,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            is_archived INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            token_count INTEGER,
            timestamp TEXT NOT NULL,
            message_index INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, message_index)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS app_settings (
            name TEXT PRIMARY KEY,
            value TEXT,
            encrypted_value BLOB,
            is_encrypted INTEGER NOT NULL DEFAULT 0,
            category TEXT NOT NULL DEFAULT 'General',
            data_type TEXT NOT NULL DEFAULT 'String',
            default_value TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS usage_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            prompt_tokens INTEGER NOT NULL DEFAULT 0,
            completion_tokens INTEGER NOT NULL DEFAULT 0,
            response_time_ms INTEGER NOT NULL DEFAULT 0,
            timestamp TEXT NOT NULL,
            success INTEGER NOT NULL DEFAULT 1,
            error_kind TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_usage_metrics_time ON usage_metrics(timestamp)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Bring an existing database up to the current schema version.
///
/// Version 2 rebuilds `documents`, `chunks`, and `usage_metrics` without the
/// legacy foreign-key constraints: ingestion writes chunk rows after the
/// vector upsert, and the old constraints made crash recovery delete-and-
/// reinsert impossible without violating them mid-transaction.
async fn migrate(pool: &SqlitePool) -> Result<()> {
    let current: Option<i64> = sqlx::query("SELECT MAX(version) AS v FROM schema_version")
        .fetch_one(pool)
        .await?
        .try_get("v")
        .ok()
        .flatten();

    if current == Some(SCHEMA_VERSION) {
        return Ok(());
    }

    for table in ["documents", "chunks", "usage_metrics"] {
        if table_has_foreign_keys(pool, table).await? {
            warn!(table, "Rebuilding table to drop legacy foreign keys");
            rebuild_without_foreign_keys(pool, table).await?;
        }
    }

    sqlx::query("DELETE FROM schema_version")
        .execute(pool)
        .await?;
    sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)")
        .bind(SCHEMA_VERSION)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(pool)
        .await?;

    debug!(version = SCHEMA_VERSION, "Schema version recorded");
    Ok(())
}

async fn table_has_foreign_keys(pool: &SqlitePool, table: &str) -> Result<bool> {
    let rows = sqlx::query(&format!("PRAGMA foreign_key_list({table})"))
        .fetch_all(pool)
        .await?;
    Ok(!rows.is_empty())
}

/// Rebuild a table with its current columns but no table constraints, then
/// swap it in place of the original.
async fn rebuild_without_foreign_keys(pool: &SqlitePool, table: &str) -> Result<()> {
    let columns = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await?;

    let mut defs = Vec::new();
    let mut names = Vec::new();
    for col in &columns {
        let name: String = col.get("name");
        let col_type: String = col.get("type");
        let notnull: i64 = col.get("notnull");
        let pk: i64 = col.get("pk");
        let mut def = format!("{name} {col_type}");
        if pk > 0 {
            def.push_str(" PRIMARY KEY");
        }
        if notnull > 0 && pk == 0 {
            def.push_str(" NOT NULL");
        }
        defs.push(def);
        names.push(name);
    }

    let tmp = format!("{table}_rebuild");
    let column_list = names.join(", ");

    let mut tx = pool.begin().await?;
    sqlx::query(&format!("CREATE TABLE {tmp} ({})", defs.join(", ")))
        .execute(&mut *tx)
        .await?;
    sqlx::query(&format!(
        "INSERT INTO {tmp} ({column_list}) SELECT {column_list} FROM {table}"
    ))
    .execute(&mut *tx)
    .await?;
    sqlx::query(&format!("DROP TABLE {table}"))
        .execute(&mut *tx)
        .await?;
    sqlx::query(&format!("ALTER TABLE {tmp} RENAME TO {table}"))
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_creates_schema_and_seeds() {
        let db = Database::open_in_memory("test-pass").await.unwrap();

        let row = sqlx::query("SELECT COUNT(*) AS n FROM app_settings")
            .fetch_one(db.pool())
            .await
            .unwrap();
        let n: i64 = row.get("n");
        assert!(n > 0, "default settings should be seeded");

        let version: i64 = sqlx::query("SELECT MAX(version) AS v FROM schema_version")
            .fetch_one(db.pool())
            .await
            .unwrap()
            .get("v");
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_open_is_idempotent_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("knowledge.db");

        let first = Database::open(&path, "pass").await.unwrap();
        drop(first);
        let second = Database::open(&path, "pass").await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_legacy_fk_rebuild() {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();

        // Simulate a legacy database whose chunks table carried a FK
        sqlx::query("CREATE TABLE documents (id TEXT PRIMARY KEY, collection_id TEXT NOT NULL, original_file_name TEXT NOT NULL, file_size INTEGER NOT NULL DEFAULT 0, file_type TEXT NOT NULL, chunk_count INTEGER NOT NULL DEFAULT 0, processing_status TEXT NOT NULL DEFAULT 'Pending', error_message TEXT, uploaded_at TEXT NOT NULL, processed_at TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE chunks (id TEXT PRIMARY KEY, collection_id TEXT NOT NULL, document_id TEXT NOT NULL REFERENCES documents(id), chunk_text TEXT NOT NULL, chunk_order INTEGER NOT NULL, token_count INTEGER NOT NULL DEFAULT 0, character_count INTEGER NOT NULL DEFAULT 0, vector_stored INTEGER NOT NULL DEFAULT 0)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO documents (id, collection_id, original_file_name, file_type, uploaded_at) VALUES ('d1', 'c1', 'a.md', 'md', '2024-01-01T00:00:00Z')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO chunks (id, collection_id, document_id, chunk_text, chunk_order) VALUES ('k1', 'c1', 'd1', 'hello', 0)")
            .execute(&pool)
            .await
            .unwrap();

        assert!(table_has_foreign_keys(&pool, "chunks").await.unwrap());

        let db = Database::bootstrap(pool, "pass").await.unwrap();
        assert!(!table_has_foreign_keys(db.pool(), "chunks").await.unwrap());

        // Rows survive the rebuild
        let row = sqlx::query("SELECT chunk_text FROM chunks WHERE id = 'k1'")
            .fetch_one(db.pool())
            .await
            .unwrap();
        let text: String = row.get("chunk_text");
        assert_eq!(text, "hello");
    }
}

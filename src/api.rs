//! REST API server for the chat service
//!
//! Provides HTTP endpoints for:
//! - Knowledge collection upload, listing, and deletion
//! - Chat turns
//! - Health checks
//! - Local model management
//! - Usage analytics

use crate::analytics::AnalyticsService;
use crate::chat::{ChatOrchestrator, ChatRequest};
use crate::config::AppConfig;
use crate::db::Database;
use crate::embedding::build_embedding_client;
use crate::error::AppError;
use crate::ingest::{IngestSource, IngestionPipeline, TokenEstimator};
use crate::llm::{KernelFactory, ProviderKind};
use crate::mcp::McpServer;
use crate::ollama::OllamaManager;
use crate::realtime::RealtimeHub;
use crate::tools::ToolRegistry;
use crate::vector::build_vector_store;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub pipeline: Arc<IngestionPipeline>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub tools: Arc<ToolRegistry>,
    pub analytics: Arc<AnalyticsService>,
    pub ollama: Arc<OllamaManager>,
    pub hub: Arc<RealtimeHub>,
}

impl AppState {
    /// Open the metadata store and assemble every component. Open or
    /// migration failures here are fatal.
    pub async fn new(config: &AppConfig) -> crate::error::Result<Self> {
        let db = Database::open(
            &config.database.path,
            &config.database.settings_passphrase,
        )
        .await?;
        Self::with_database(config, db).await
    }

    /// Assemble components over an already-open metadata store.
    pub async fn with_database(
        config: &AppConfig,
        db: Database,
    ) -> crate::error::Result<Self> {
        let openai_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) if !key.is_empty() => Some(key),
            _ => db.settings().get_encrypted("OpenAi.ApiKey").await?,
        };

        let embedder = build_embedding_client(&config.embedding, &config.ollama, openai_key)?;
        let vectors = build_vector_store(config).await?;

        let max_queue = db
            .settings()
            .get_i64("RealtimeMaxQueue", config.realtime.max_queue as i64)
            .await?
            .max(1) as usize;
        let hub = Arc::new(RealtimeHub::new(max_queue));
        let analytics = Arc::new(AnalyticsService::new(db.clone(), hub.clone()));
        let tools = Arc::new(ToolRegistry::new(
            db.clone(),
            vectors.clone(),
            embedder.clone(),
            analytics.clone(),
        ));
        let factory = Arc::new(KernelFactory::new(config.clone(), db.clone()));

        let encoding = db
            .settings()
            .get_or("TokenizerEncoding", "cl100k_base")
            .await?;
        let orchestrator = Arc::new(ChatOrchestrator::new(
            db.clone(),
            factory,
            embedder.clone(),
            vectors.clone(),
            tools.clone(),
            analytics.clone(),
            TokenEstimator::new(&encoding),
        ));
        let pipeline = Arc::new(IngestionPipeline::new(db.clone(), embedder, vectors));
        let ollama = Arc::new(OllamaManager::new(config.ollama.base_url.clone()));

        Ok(Self {
            db,
            pipeline,
            orchestrator,
            tools,
            analytics,
            ollama,
            hub,
        })
    }

    /// The MCP dispatcher over the same components.
    pub fn mcp_server(&self) -> Arc<McpServer> {
        Arc::new(McpServer::new(
            self.db.clone(),
            self.tools.clone(),
            self.analytics.clone(),
        ))
    }
}

/// The HTTP surface always answers failures with a JSON error body; stack
/// traces never leave the process.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        });

        if status.is_server_error() {
            error!(kind = self.kind(), error = %self, "Request failed");
        }
        (status, Json(body)).into_response()
    }
}

/// Chat request body as it appears on the wire
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequestBody {
    pub knowledge_id: Option<String>,
    pub message: String,
    /// -1 means "use the server default"
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub strip_markdown: bool,
    #[serde(default)]
    pub use_extended_instructions: bool,
    pub conversation_id: Option<String>,
    pub provider: String,
    pub ollama_model: Option<String>,
    #[serde(default)]
    pub use_agent: bool,
}

fn default_temperature() -> f32 {
    -1.0
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponseBody {
    pub conversation_id: String,
    pub reply: String,
}

/// Build the REST router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/knowledge", post(upload_knowledge).get(list_knowledge))
        .route(
            "/api/knowledge/{id}",
            get(get_knowledge).delete(delete_knowledge),
        )
        .route("/api/chat", post(chat))
        .route("/api/ping", get(ping))
        .route("/api/health", get(health))
        .route("/api/ollama/models", get(list_models))
        .route("/api/ollama/models/pull", post(pull_model))
        .route("/api/ollama/models/{name}", delete(delete_model))
        .route("/api/analytics/usage", get(analytics_usage))
        .route("/api/analytics/models", get(analytics_models))
        .route("/api/analytics/stream", get(analytics_stream))
        // Uploads may carry documents up to the parser size cap
        .layer(axum::extract::DefaultBodyLimit::max(
            (crate::ingest::parser::MAX_DOCUMENT_BYTES + 1024 * 1024) as usize,
        ))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve the REST API.
pub async fn serve(state: AppState, host: &str, port: u16) -> crate::error::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "REST API listening");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn upload_knowledge(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut knowledge_id: Option<String> = None;
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("invalid multipart body: {e}")))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "knowledgeId" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| AppError::Validation(e.to_string()))?;
                knowledge_id = Some(value);
            }
            "files" | "files[]" => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| AppError::Validation("file field needs a filename".into()))?;
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::Validation(e.to_string()))?;
                files.push((file_name, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let knowledge_id =
        knowledge_id.ok_or_else(|| AppError::Validation("knowledgeId is required".into()))?;
    if files.is_empty() {
        return Err(AppError::Validation("at least one file is required".into()));
    }

    for (file_name, bytes) in files {
        let source = IngestSource {
            source_path: format!("upload://{knowledge_id}/{file_name}"),
            file_name,
            bytes,
        };
        state.pipeline.ingest(&knowledge_id, source).await?;
    }

    let collection = state.db.knowledge().resolve_collection(&knowledge_id).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": collection.id }))).into_response())
}

async fn list_knowledge(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let collections = state.db.knowledge().list_collections().await?;
    Ok(Json(json!({
        "collections": collections
            .iter()
            .map(|c| json!({
                "id": c.id,
                "name": c.name,
                "status": c.status,
                "documentCount": c.document_count,
                "chunkCount": c.chunk_count,
            }))
            .collect::<Vec<_>>()
    })))
}

async fn get_knowledge(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let collection = state.db.knowledge().resolve_collection(&id).await?;
    let documents = state
        .db
        .knowledge()
        .documents_in_collection(&collection.id)
        .await?;

    Ok(Json(json!({
        "id": collection.id,
        "name": collection.name,
        "description": collection.description,
        "status": collection.status,
        "embeddingModel": collection.embedding_model,
        "vectorStoreKind": collection.vector_store_kind,
        "documentCount": collection.document_count,
        "chunkCount": collection.chunk_count,
        "documents": documents,
    })))
}

async fn delete_knowledge(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.pipeline.delete_collection(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn chat(
    State(state): State<AppState>,
    Json(body): Json<ChatRequestBody>,
) -> Result<Json<ChatResponseBody>, AppError> {
    if body.message.trim().is_empty() {
        return Err(AppError::Validation("message must not be empty".into()));
    }
    let provider = ProviderKind::parse(&body.provider)
        .ok_or_else(|| AppError::Validation(format!("unknown provider: {}", body.provider)))?;

    let reply = state
        .orchestrator
        .ask(ChatRequest {
            knowledge_id: body.knowledge_id,
            message: body.message,
            temperature: Some(body.temperature),
            strip_markdown: body.strip_markdown,
            use_extended_instructions: body.use_extended_instructions,
            conversation_id: body.conversation_id,
            provider,
            model: body.ollama_model,
            use_agent: body.use_agent,
        })
        .await?;

    Ok(Json(ChatResponseBody {
        conversation_id: reply.conversation_id,
        reply: reply.reply,
    }))
}

async fn ping() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let health = state.tools.invoke("get_system_health", &json!({})).await?;
    Ok(Json(health))
}

async fn list_models(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let models = state.ollama.list_models().await?;
    Ok(Json(json!({ "models": models })))
}

#[derive(Deserialize)]
struct PullRequest {
    name: String,
}

async fn pull_model(
    State(state): State<AppState>,
    Json(body): Json<PullRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let mut progress = state.ollama.pull_model(&body.name).await?;

    let stream = async_stream::stream! {
        while let Some(update) = progress.next().await {
            match update {
                Ok(progress) => {
                    let data = serde_json::to_string(&json!({
                        "digest": progress.digest,
                        "bytesDownloaded": progress.bytes_downloaded,
                        "totalBytes": progress.total_bytes,
                        "percent": progress.percent,
                    }))
                    .unwrap_or_default();
                    yield Ok(Event::default().event("progress").data(data));
                }
                Err(e) => {
                    let data = json!({"error": {"kind": e.kind(), "message": e.to_string()}});
                    yield Ok(Event::default().event("error").data(data.to_string()));
                    break;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

async fn delete_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    state.ollama.delete_model(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn analytics_usage(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let usage = state.analytics.aggregates().await?;
    Ok(Json(json!({ "usage": usage })))
}

async fn analytics_models(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let models = state.analytics.model_usage().await?;
    Ok(Json(json!({ "models": models })))
}

/// Push analytics change notifications to the client as server-sent events.
async fn analytics_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let client_id = uuid::Uuid::new_v4().to_string();
    let mut rx = state.hub.subscribe(&client_id).await;

    let stream = async_stream::stream! {
        while let Some(message) = rx.recv().await {
            yield Ok(Event::default().event("analytics").data(message.to_string()));
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

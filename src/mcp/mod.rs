//! MCP server core: JSON-RPC 2.0 dispatch for tools and resources
//!
//! The method set covers `initialize`, `tools/list`, `tools/call`,
//! `resources/list`, `resources/templates/list`, and `resources/read`.
//! Transports (stdio line framing, HTTP with SSE sessions) live in
//! submodules and share this dispatcher.

pub mod auth;
pub mod http;
pub mod stdio;

use crate::analytics::AnalyticsService;
use crate::db::Database;
use crate::error::AppError;
use crate::tools::ToolRegistry;
use jsonrpc_core::{Call, Error, ErrorCode, Failure, Id, Output, Request, Success, Version};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC error code for a missing resource
const RESOURCE_NOT_FOUND: i64 = -32002;

const COLLECTIONS_URI: &str = "resource://knowledge/collections";
const SYSTEM_HEALTH_URI: &str = "resource://system/health";
const SYSTEM_MODELS_URI: &str = "resource://system/models";

/// MCP server shared by both transports
pub struct McpServer {
    db: Database,
    tools: Arc<ToolRegistry>,
    analytics: Arc<AnalyticsService>,
}

impl McpServer {
    pub fn new(db: Database, tools: Arc<ToolRegistry>, analytics: Arc<AnalyticsService>) -> Self {
        Self {
            db,
            tools,
            analytics,
        }
    }

    /// Handle one line-framed JSON-RPC message. Returns `None` for
    /// notifications and unparsable input that carries no id.
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Unparsable JSON-RPC input");
                let failure = Failure {
                    jsonrpc: Some(Version::V2),
                    error: Error::new(ErrorCode::ParseError),
                    id: Id::Null,
                };
                return serde_json::to_string(&failure).ok();
            }
        };

        match request {
            Request::Single(Call::MethodCall(call)) => {
                let params = params_to_value(call.params);
                let output = self.handle_call(call.method.as_str(), params, call.id).await;
                serde_json::to_string(&output).ok()
            }
            Request::Single(Call::Notification(notification)) => {
                debug!(method = %notification.method, "Ignoring notification");
                None
            }
            Request::Single(Call::Invalid { id }) => {
                let failure = Failure {
                    jsonrpc: Some(Version::V2),
                    error: Error::new(ErrorCode::InvalidRequest),
                    id,
                };
                serde_json::to_string(&failure).ok()
            }
            Request::Batch(_) => {
                let failure = Failure {
                    jsonrpc: Some(Version::V2),
                    error: Error::new(ErrorCode::InvalidRequest),
                    id: Id::Null,
                };
                serde_json::to_string(&failure).ok()
            }
        }
    }

    /// Dispatch one method call to an output.
    pub async fn handle_call(&self, method: &str, params: Value, id: Id) -> Output {
        debug!(method, "MCP request");

        let result = match method {
            "initialize" => Ok(self.initialize()),
            "tools/list" => Ok(self.list_tools()),
            "tools/call" => self.call_tool(&params).await,
            "resources/list" => Ok(self.list_resources()),
            "resources/templates/list" => Ok(self.list_resource_templates()),
            "resources/read" => self.read_resource(&params).await,
            other => Err(Error {
                code: ErrorCode::MethodNotFound,
                message: format!("Unknown method: {other}"),
                data: None,
            }),
        };

        match result {
            Ok(result) => Output::Success(Success {
                jsonrpc: Some(Version::V2),
                result,
                id,
            }),
            Err(error) => Output::Failure(Failure {
                jsonrpc: Some(Version::V2),
                error,
                id,
            }),
        }
    }

    /// The resources capability is declared with both realtime flags off.
    fn initialize(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": {},
                "resources": { "subscribe": false, "listChanged": false }
            },
            "serverInfo": {
                "name": "chatstack",
                "version": env!("CARGO_PKG_VERSION"),
            }
        })
    }

    fn list_tools(&self) -> Value {
        json!({
            "tools": self
                .tools
                .specs()
                .iter()
                .map(|spec| json!({
                    "name": spec.name,
                    "description": spec.description,
                    "inputSchema": spec.input_schema,
                }))
                .collect::<Vec<_>>()
        })
    }

    async fn call_tool(&self, params: &Value) -> Result<Value, Error> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::invalid_params("name is required"))?;
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        let result = self
            .tools
            .invoke(name, &arguments)
            .await
            .map_err(app_error_to_rpc)?;

        Ok(json!({
            "content": [{
                "type": "text",
                "text": result.to_string(),
            }]
        }))
    }

    fn list_resources(&self) -> Value {
        json!({
            "resources": [
                {
                    "uri": COLLECTIONS_URI,
                    "name": "knowledge-collections",
                    "description": "All knowledge collections with counts and status",
                    "mimeType": "application/json"
                },
                {
                    "uri": SYSTEM_HEALTH_URI,
                    "name": "system-health",
                    "description": "Component-level health snapshot",
                    "mimeType": "application/json"
                },
                {
                    "uri": SYSTEM_MODELS_URI,
                    "name": "system-models",
                    "description": "Recorded model usage ordered by popularity",
                    "mimeType": "application/json"
                }
            ]
        })
    }

    fn list_resource_templates(&self) -> Value {
        json!({
            "resourceTemplates": [
                {
                    "uriTemplate": "resource://knowledge/{collectionId}/documents",
                    "name": "collection-documents",
                    "description": "Documents in one knowledge collection",
                    "mimeType": "application/json"
                },
                {
                    "uriTemplate": "resource://knowledge/{collectionId}/document/{documentId}",
                    "name": "collection-document",
                    "description": "One document with its processing state",
                    "mimeType": "application/json"
                },
                {
                    "uriTemplate": "resource://knowledge/{collectionId}/stats",
                    "name": "collection-stats",
                    "description": "Counts and status for one collection",
                    "mimeType": "application/json"
                }
            ]
        })
    }

    async fn read_resource(&self, params: &Value) -> Result<Value, Error> {
        let uri = params
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::invalid_params("uri is required"))?;

        let payload = self.resolve_resource(uri).await?;
        Ok(json!({
            "contents": [{
                "uri": uri,
                "mimeType": "application/json",
                "text": payload.to_string(),
            }]
        }))
    }

    async fn resolve_resource(&self, uri: &str) -> Result<Value, Error> {
        match uri {
            COLLECTIONS_URI => self
                .tools
                .invoke("get_knowledge_base_summary", &json!({}))
                .await
                .map_err(app_error_to_rpc),
            SYSTEM_HEALTH_URI => self
                .tools
                .invoke("get_system_health", &json!({}))
                .await
                .map_err(app_error_to_rpc),
            SYSTEM_MODELS_URI => {
                let usage = self
                    .analytics
                    .model_usage()
                    .await
                    .map_err(app_error_to_rpc)?;
                Ok(json!({ "models": usage }))
            }
            other => self.resolve_knowledge_uri(other).await,
        }
    }

    /// Parameterized `resource://knowledge/...` URIs.
    async fn resolve_knowledge_uri(&self, uri: &str) -> Result<Value, Error> {
        let Some(rest) = uri.strip_prefix("resource://knowledge/") else {
            return Err(resource_not_found(uri));
        };
        let segments: Vec<&str> = rest.split('/').collect();

        match segments.as_slice() {
            [collection_id, "documents"] => {
                let collection = self.require_collection(collection_id).await?;
                let documents = self
                    .db
                    .knowledge()
                    .documents_in_collection(&collection.id)
                    .await
                    .map_err(app_error_to_rpc)?;

                Ok(json!({
                    "collection": collection.name,
                    "totalDocuments": documents.len(),
                    "documents": documents
                        .iter()
                        .map(|d| json!({
                            "id": d.id,
                            "fileName": d.original_file_name,
                            "fileType": d.file_type,
                            "chunkCount": d.chunk_count,
                            "status": d.processing_status,
                        }))
                        .collect::<Vec<_>>(),
                }))
            }
            [collection_id, "document", document_id] => {
                let collection = self.require_collection(collection_id).await?;
                let document = self
                    .db
                    .knowledge()
                    .document(document_id)
                    .await
                    .map_err(app_error_to_rpc)?
                    .filter(|d| d.collection_id == collection.id)
                    .ok_or_else(|| resource_not_found(uri))?;

                serde_json::to_value(&document).map_err(|e| Error {
                    code: ErrorCode::InternalError,
                    message: e.to_string(),
                    data: None,
                })
            }
            [collection_id, "stats"] => {
                let collection = self.require_collection(collection_id).await?;
                Ok(json!({
                    "name": collection.name,
                    "status": collection.status,
                    "documentCount": collection.document_count,
                    "chunkCount": collection.chunk_count,
                    "embeddingModel": collection.embedding_model,
                    "vectorStoreKind": collection.vector_store_kind,
                }))
            }
            _ => Err(resource_not_found(uri)),
        }
    }

    async fn require_collection(
        &self,
        id_or_name: &str,
    ) -> Result<crate::db::CollectionRecord, Error> {
        self.db
            .knowledge()
            .resolve_collection(id_or_name)
            .await
            .map_err(|e| match e {
                AppError::NotFound(_) => resource_not_found(id_or_name),
                other => app_error_to_rpc(other),
            })
    }
}

fn params_to_value(params: jsonrpc_core::Params) -> Value {
    match params {
        jsonrpc_core::Params::None => Value::Null,
        jsonrpc_core::Params::Array(values) => Value::Array(values),
        jsonrpc_core::Params::Map(map) => Value::Object(map),
    }
}

fn resource_not_found(uri: &str) -> Error {
    Error {
        code: ErrorCode::ServerError(RESOURCE_NOT_FOUND),
        message: format!("Resource not found: {uri}"),
        data: None,
    }
}

fn app_error_to_rpc(error: AppError) -> Error {
    match error.kind() {
        "NotFound" => Error {
            code: ErrorCode::ServerError(RESOURCE_NOT_FOUND),
            message: error.to_string(),
            data: None,
        },
        "ValidationFailed" => Error::invalid_params(error.to_string()),
        _ => Error {
            code: ErrorCode::InternalError,
            message: error.to_string(),
            data: None,
        },
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    async fn call(server: &McpServer, method: &str, params: Value) -> Value {
        let output = server
            .handle_call(method, params, Id::Num(1))
            .await;
        match output {
            Output::Success(success) => success.result,
            Output::Failure(failure) => panic!("unexpected failure: {:?}", failure.error),
        }
    }

    async fn call_err(server: &McpServer, method: &str, params: Value) -> Error {
        match server.handle_call(method, params, Id::Num(1)).await {
            Output::Failure(failure) => failure.error,
            Output::Success(success) => panic!("unexpected success: {}", success.result),
        }
    }

    #[tokio::test]
    async fn test_initialize_declares_static_resource_capability() {
        let (server, _, _) = test_support::server().await;
        let result = call(&server, "initialize", json!({})).await;

        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["capabilities"]["resources"]["subscribe"], false);
        assert_eq!(result["capabilities"]["resources"]["listChanged"], false);
        assert!(result["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn test_tools_list_exposes_registry() {
        let (server, _, _) = test_support::server().await;
        let result = call(&server, "tools/list", json!({})).await;

        let tools = result["tools"].as_array().unwrap();
        assert!(tools.iter().any(|t| t["name"] == "search_knowledge"));
        assert!(tools.iter().all(|t| t["inputSchema"].is_object()));
    }

    #[tokio::test]
    async fn test_tools_call_wraps_text_content() {
        let (server, _, _) = test_support::server().await;
        let result = call(
            &server,
            "tools/call",
            json!({"name": "get_system_health", "arguments": {}}),
        )
        .await;

        assert_eq!(result["content"][0]["type"], "text");
        let payload: Value =
            serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(payload["status"], "healthy");
    }

    #[tokio::test]
    async fn test_resources_read_documents_template() {
        let (server, db, _) = test_support::server().await;
        let collection = db
            .knowledge()
            .ensure_collection("docs-x", "null-embedder", "InMemory")
            .await
            .unwrap();
        db.knowledge()
            .upsert_document(&crate::db::DocumentRecord {
                id: "d1".into(),
                collection_id: collection.id.clone(),
                original_file_name: "a.md".into(),
                file_size: 10,
                file_type: "md".into(),
                chunk_count: 2,
                processing_status: "Complete".into(),
                error_message: None,
                uploaded_at: chrono::Utc::now(),
                processed_at: None,
            })
            .await
            .unwrap();

        let result = call(
            &server,
            "resources/read",
            json!({"uri": "resource://knowledge/docs-x/documents"}),
        )
        .await;

        assert_eq!(result["contents"][0]["mimeType"], "application/json");
        let payload: Value =
            serde_json::from_str(result["contents"][0]["text"].as_str().unwrap()).unwrap();
        assert!(payload["totalDocuments"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_unknown_resource_is_32002() {
        let (server, _, _) = test_support::server().await;
        let error = call_err(
            &server,
            "resources/read",
            json!({"uri": "resource://bogus/thing"}),
        )
        .await;
        assert_eq!(error.code, ErrorCode::ServerError(-32002));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (server, _, _) = test_support::server().await;
        let error = call_err(&server, "resources/subscribe", json!({})).await;
        assert_eq!(error.code, ErrorCode::MethodNotFound);
    }

    #[tokio::test]
    async fn test_handle_line_roundtrip() {
        let (server, _, _) = test_support::server().await;
        let response = server
            .handle_line(r#"{"jsonrpc":"2.0","id":7,"method":"initialize","params":{}}"#)
            .await
            .unwrap();

        let parsed: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(parsed["id"], 7);
        assert_eq!(parsed["result"]["protocolVersion"], PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_handle_line_ignores_notifications() {
        let (server, _, _) = test_support::server().await;
        let response = server
            .handle_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await;
        assert!(response.is_none());
    }
}

//! MCP surface scenarios over line-framed JSON-RPC

use chatstack::api::AppState;
use chatstack::config::{AppConfig, VectorStoreProvider};
use chatstack::db::Database;
use chatstack::ingest::IngestSource;
use serde_json::{json, Value};
use serial_test::serial;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

struct EmbedResponder;

impl Respond for EmbedResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or_default();
        let count = body["input"].as_array().map(|a| a.len()).unwrap_or(1);
        let embeddings: Vec<Vec<f32>> = (0..count).map(|_| vec![0.7, 0.1, 0.4, 0.2]).collect();
        ResponseTemplate::new(200).set_body_json(json!({ "embeddings": embeddings }))
    }
}

async fn seeded_state() -> (AppState, MockServer) {
    let ollama = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(EmbedResponder)
        .mount(&ollama)
        .await;

    let mut config = AppConfig::default();
    config.vector_store.provider = VectorStoreProvider::InMemory;
    config.embedding.dimension = 4;
    config.ollama.base_url = ollama.uri();

    let db = Database::open_in_memory("test-pass").await.unwrap();
    let state = AppState::with_database(&config, db).await.unwrap();

    state
        .pipeline
        .ingest(
            "docs-x",
            IngestSource {
                file_name: "guide.md".to_string(),
                source_path: "/docs/guide.md".to_string(),
                bytes: b"# A\n\nalpha lines.\n\n## B\n\nbravo body.\n\n## C\n\ncharlie lines.".to_vec(),
            },
        )
        .await
        .unwrap();

    (state, ollama)
}

async fn rpc(server: &chatstack::McpServer, line: &str) -> Value {
    let response = server.handle_line(line).await.expect("expected a response");
    serde_json::from_str(&response).unwrap()
}

#[tokio::test]
#[serial]
async fn tool_call_over_line_framing() {
    let (state, _ollama) = seeded_state().await;
    let server = state.mcp_server();

    let init = rpc(
        &server,
        r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
    )
    .await;
    assert_eq!(init["result"]["capabilities"]["resources"]["subscribe"], false);
    assert_eq!(init["result"]["capabilities"]["resources"]["listChanged"], false);

    let call = rpc(
        &server,
        r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"search_knowledge","arguments":{"collectionId":"docs-x","query":"B"}}}"#,
    )
    .await;

    let text = call["result"]["content"][0]["text"].as_str().unwrap();
    let payload: Value = serde_json::from_str(text).unwrap();
    assert_eq!(payload["collection"], "docs-x");
    assert!(!payload["hits"].as_array().unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn parameterized_resource_read() {
    let (state, _ollama) = seeded_state().await;
    let server = state.mcp_server();

    let response = rpc(
        &server,
        r#"{"jsonrpc":"2.0","id":3,"method":"resources/read","params":{"uri":"resource://knowledge/docs-x/documents"}}"#,
    )
    .await;

    let contents = &response["result"]["contents"][0];
    assert_eq!(contents["mimeType"], "application/json");
    let payload: Value = serde_json::from_str(contents["text"].as_str().unwrap()).unwrap();
    assert!(payload["totalDocuments"].as_u64().unwrap() >= 1);
}

#[tokio::test]
#[serial]
async fn resource_templates_follow_uri_syntax() {
    let (state, _ollama) = seeded_state().await;
    let server = state.mcp_server();

    let response = rpc(
        &server,
        r#"{"jsonrpc":"2.0","id":4,"method":"resources/templates/list","params":{}}"#,
    )
    .await;

    let templates = response["result"]["resourceTemplates"].as_array().unwrap();
    let uris: Vec<&str> = templates
        .iter()
        .map(|t| t["uriTemplate"].as_str().unwrap())
        .collect();
    assert!(uris.contains(&"resource://knowledge/{collectionId}/documents"));
    assert!(uris.contains(&"resource://knowledge/{collectionId}/document/{documentId}"));
    assert!(uris.contains(&"resource://knowledge/{collectionId}/stats"));
}

#[tokio::test]
#[serial]
async fn unknown_resource_returns_resource_not_found_code() {
    let (state, _ollama) = seeded_state().await;
    let server = state.mcp_server();

    let response = rpc(
        &server,
        r#"{"jsonrpc":"2.0","id":5,"method":"resources/read","params":{"uri":"resource://knowledge/missing/stats"}}"#,
    )
    .await;

    assert_eq!(response["error"]["code"], -32002);
}

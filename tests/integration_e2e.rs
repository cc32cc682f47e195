// End-to-end tests over the full service state with stubbed backends: a
// stateful in-memory vector store and a scripted chat model, both served
// through wiremock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ragd::agent::ChatOptions;
use ragd::api::build_state;
use ragd::config::{Config, FlowDetailLevel};
use ragd::flowlog::analyzer::FlowAnalyzer;
use ragd::flowlog::{FlowEventType, FlowStatus};
use ragd::store::NewKnowledgeBase;
use tempfile::TempDir;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const DIM: usize = 4;

#[derive(Default)]
struct FakeCollection {
    dimension: usize,
    payloads: Vec<serde_json::Value>,
}

/// Minimal in-memory stand-in for the vector database, shared across the
/// wiremock responders.
#[derive(Default)]
struct FakeVectorStore {
    collections: Mutex<HashMap<String, FakeCollection>>,
}

fn collection_from_path(url_path: &str) -> String {
    url_path
        .trim_start_matches("/collections/")
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

struct CreateCollection(Arc<FakeVectorStore>);

impl Respond for CreateCollection {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let name = collection_from_path(request.url.path());
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap_or_default();
        let dimension = body["vectors"]["size"].as_u64().unwrap_or(0) as usize;
        self.0
            .collections
            .lock()
            .expect("lock")
            .entry(name)
            .or_insert_with(|| FakeCollection {
                dimension,
                payloads: Vec::new(),
            });
        ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": true}))
    }
}

struct GetCollection(Arc<FakeVectorStore>);

impl Respond for GetCollection {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let name = collection_from_path(request.url.path());
        let collections = self.0.collections.lock().expect("lock");
        match collections.get(&name) {
            Some(collection) => ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": {
                    "points_count": collection.payloads.len(),
                    "config": {"params": {"vectors": {"size": collection.dimension, "distance": "Cosine"}}}
                }
            })),
            None => ResponseTemplate::new(404),
        }
    }
}

struct DeleteCollection(Arc<FakeVectorStore>);

impl Respond for DeleteCollection {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let name = collection_from_path(request.url.path());
        self.0.collections.lock().expect("lock").remove(&name);
        ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": true}))
    }
}

struct UpsertPoints(Arc<FakeVectorStore>);

impl Respond for UpsertPoints {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let name = collection_from_path(request.url.path());
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap_or_default();
        let mut collections = self.0.collections.lock().expect("lock");
        let collection = collections.entry(name).or_default();
        if let Some(points) = body["points"].as_array() {
            for point in points {
                collection.payloads.push(serde_json::json!({
                    "id": point["id"],
                    "payload": point["payload"],
                }));
            }
        }
        ResponseTemplate::new(200)
            .set_body_json(serde_json::json!({"result": {"status": "completed"}}))
    }
}

struct SearchPoints(Arc<FakeVectorStore>);

impl Respond for SearchPoints {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let name = collection_from_path(request.url.path());
        let collections = self.0.collections.lock().expect("lock");
        let hits: Vec<serde_json::Value> = collections
            .get(&name)
            .map(|collection| {
                collection
                    .payloads
                    .iter()
                    .enumerate()
                    .map(|(i, point)| {
                        serde_json::json!({
                            "id": point["id"],
                            "score": 0.9 - i as f64 * 0.01,
                            "payload": point["payload"],
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": hits}))
    }
}

/// Chat model script: a retrieval tool call first, then an answer quoting
/// the tool observation verbatim.
struct ScriptedChatModel;

impl Respond for ScriptedChatModel {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).expect("chat body");
        let messages = body["messages"].as_array().expect("messages");

        let last_tool_observation = messages
            .iter()
            .rev()
            .find(|m| m["role"] == "tool")
            .and_then(|m| m["content"].as_str());

        match last_tool_observation {
            None => {
                let query = messages
                    .iter()
                    .rev()
                    .find(|m| m["role"] == "user")
                    .and_then(|m| m["content"].as_str())
                    .unwrap_or_default();
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "message": {
                        "role": "assistant",
                        "content": "",
                        "tool_calls": [{
                            "function": {
                                "name": "search_knowledge_base",
                                "arguments": {"query": query}
                            }
                        }]
                    },
                    "done": true
                }))
            }
            Some(observation) => {
                let parsed: serde_json::Value =
                    serde_json::from_str(observation).unwrap_or_default();
                let answer = parsed["results"]
                    .as_array()
                    .and_then(|results| results.first())
                    .map(|hit| {
                        format!(
                            "According to {}: {}",
                            hit["source"].as_str().unwrap_or("unknown"),
                            hit["content"].as_str().unwrap_or("")
                        )
                    })
                    .unwrap_or_else(|| "The knowledge base contains no answer.".to_string());
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "message": {"role": "assistant", "content": answer},
                    "done": true
                }))
            }
        }
    }
}

async fn start_backend() -> (MockServer, Arc<FakeVectorStore>) {
    let server = MockServer::start().await;
    let fake = Arc::new(FakeVectorStore::default());

    Mock::given(method("PUT"))
        .and(path_regex(r"^/collections/[^/]+$"))
        .respond_with(CreateCollection(fake.clone()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/collections/[^/]+$"))
        .respond_with(GetCollection(fake.clone()))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path_regex(r"^/collections/[^/]+$"))
        .respond_with(DeleteCollection(fake.clone()))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/collections/[^/]+/points$"))
        .respond_with(UpsertPoints(fake.clone()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/collections/[^/]+/points/search$"))
        .respond_with(SearchPoints(fake.clone()))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(|request: &Request| {
            let body: serde_json::Value = serde_json::from_slice(&request.body).expect("body");
            if let Some(inputs) = body.get("input").and_then(|v| v.as_array()) {
                let embeddings: Vec<Vec<f32>> =
                    inputs.iter().map(|_| vec![0.5f32; DIM]).collect();
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"embeddings": embeddings}))
            } else {
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"embedding": vec![0.5f32; DIM]}))
            }
        })
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ScriptedChatModel)
        .mount(&server)
        .await;

    (server, fake)
}

async fn test_state(server: &MockServer, dir: &TempDir) -> ragd::api::AppState {
    let mut config = Config::default();
    config.base_dir = dir.path().to_path_buf();
    config.llm.host = server.uri();
    config.embedding.host = server.uri();
    config.embedding.dimension = DIM;
    config.embedding.retries = 1;
    config.embedding.backoff_initial_s = 0.01;
    config.vector_store.url = server.uri();
    config.retrieval.adaptive_target_results = 1;
    config.flow_log.detail_level = FlowDetailLevel::Verbose;

    build_state(config).await.expect("state")
}

fn kb_spec(name: &str) -> NewKnowledgeBase {
    NewKnowledgeBase {
        name: name.to_string(),
        description: String::new(),
        embedding_model: "bge-m3".to_string(),
        embedding_dimension: DIM,
        chunk_config: None,
        retrieval_config: None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_chat_over_ingested_file() {
    let (server, _fake) = start_backend().await;
    let dir = TempDir::new().expect("temp dir");
    let state = test_state(&server, &dir).await;

    let kb = state.manager.create_kb(kb_spec("company facts")).await.expect("kb");

    let file_path = dir.path().join("facts.txt");
    std::fs::write(
        &file_path,
        "Lee Xiaoyong partnered with Zhang San to invest in ABC Tech Co.",
    )
    .expect("write");
    let report = state
        .manager
        .ingest_paths(&kb.id, &[file_path], false)
        .await
        .expect("ingest");
    assert_eq!(report.documents_loaded, 1);
    assert!(report.vectors_uploaded >= 1);
    assert!(report.failed_files.is_empty());

    let session_id = uuid::Uuid::new_v4();
    let answer = state
        .agent
        .chat(
            "Who did Lee Xiaoyong partner with?",
            ChatOptions {
                kb_id: Some(kb.id.clone()),
                session_id: Some(session_id),
                ..Default::default()
            },
        )
        .await
        .expect("answer");

    assert!(answer.contains("Zhang San"), "answer was: {answer}");
    assert!(answer.contains("ABC Tech Co."), "answer was: {answer}");

    // The flow log records exactly one successful retrieval and a
    // successful completion for this session.
    state.flow.flush();
    let analyzer = FlowAnalyzer::load(&state.config.flow_log_path()).expect("analyzer");
    let session_events = analyzer.filter_session(session_id);
    assert!(!session_events.is_empty());

    let tool_events: Vec<_> = session_events
        .iter()
        .filter(|e| e.event_type == FlowEventType::ToolExecution)
        .collect();
    assert_eq!(tool_events.len(), 1);
    assert_eq!(tool_events[0].status, FlowStatus::Success);
    let output = tool_events[0]
        .metadata
        .iter()
        .find(|(k, _)| k == "Output")
        .map(|(_, v)| v.as_str())
        .unwrap_or_default();
    assert!(output.contains("\"count\":"), "tool output: {output}");
    assert!(!output.contains("\"count\":0"), "retrieval should have hits");

    let complete = session_events
        .iter()
        .find(|e| e.event_type == FlowEventType::QueryComplete)
        .expect("query complete");
    assert_eq!(complete.status, FlowStatus::Success);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_chat_and_foreign_ingest_do_not_interfere() {
    let (server, _fake) = start_backend().await;
    let dir = TempDir::new().expect("temp dir");
    let state = test_state(&server, &dir).await;

    let kb1 = state.manager.create_kb(kb_spec("corpus one")).await.expect("kb1");
    let kb2 = state.manager.create_kb(kb_spec("corpus two")).await.expect("kb2");

    let file1 = dir.path().join("one.txt");
    std::fs::write(&file1, "Alpha project is led by Zhang San.").expect("write");
    state
        .manager
        .ingest_paths(&kb1.id, &[file1], false)
        .await
        .expect("ingest kb1");

    // Many files for the second KB, ingested while the first KB answers.
    let mut kb2_files = Vec::new();
    for i in 0..5 {
        let path = dir.path().join(format!("two_{i}.txt"));
        std::fs::write(&path, format!("Beta memo {i}: unrelated material."))
            .expect("write");
        kb2_files.push(path);
    }

    let chat = state.agent.chat(
        "Who leads the Alpha project?",
        ChatOptions {
            kb_id: Some(kb1.id.clone()),
            ..Default::default()
        },
    );
    let ingest = state.manager.ingest_paths(&kb2.id, &kb2_files, false);

    let (answer, report) = tokio::join!(chat, ingest);
    let answer = answer.expect("answer");
    let report = report.expect("report");

    assert!(report.failed_files.is_empty());
    assert_eq!(report.documents_loaded, 5);
    assert!(answer.contains("Zhang San"), "answer was: {answer}");
    // No cross-KB leakage: the answer quotes corpus one only.
    assert!(!answer.contains("Beta memo"), "answer was: {answer}");
}

#[tokio::test(flavor = "multi_thread")]
async fn kb_delete_drops_its_collection() {
    let (server, fake) = start_backend().await;
    let dir = TempDir::new().expect("temp dir");
    let state = test_state(&server, &dir).await;

    let kb = state.manager.create_kb(kb_spec("ephemeral")).await.expect("kb");
    let collection_name = kb.collection_name.clone();
    assert!(fake
        .collections
        .lock()
        .expect("lock")
        .contains_key(&collection_name));

    state.manager.delete_kb(&kb.id).await.expect("delete");
    assert!(!fake
        .collections
        .lock()
        .expect("lock")
        .contains_key(&collection_name));
}

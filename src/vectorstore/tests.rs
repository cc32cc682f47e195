use super::*;
use crate::config::VectorStoreConfig;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(url: &str) -> VectorStoreConfig {
    VectorStoreConfig {
        url: url.to_string(),
        default_collection: "knowledge_base".to_string(),
        upsert_batch_size: 2,
        retries: 2,
        timeout_s: 5,
    }
}

fn collection_body(dimension: usize, points: u64) -> serde_json::Value {
    serde_json::json!({
        "result": {
            "points_count": points,
            "config": { "params": { "vectors": { "size": dimension, "distance": "Cosine" } } }
        },
        "status": "ok"
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn ensure_collection_creates_when_absent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/collections/kb_test"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/collections/kb_test"))
        .and(body_partial_json(serde_json::json!({
            "vectors": {"size": 4, "distance": "Cosine"}
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": true})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = VectorStoreClient::new(&test_config(&server.uri())).expect("client");
    client
        .ensure_collection("kb_test", 4)
        .await
        .expect("collection created");
}

#[tokio::test(flavor = "multi_thread")]
async fn ensure_collection_validates_existing_dimension() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/collections/kb_test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(collection_body(768, 10)))
        .mount(&server)
        .await;

    let client = VectorStoreClient::new(&test_config(&server.uri())).expect("client");
    // Matching dimension is idempotent.
    client
        .ensure_collection("kb_test", 768)
        .await
        .expect("idempotent");

    // Mismatched dimension fails.
    let err = client
        .ensure_collection("kb_test", 1024)
        .await
        .expect_err("dimension mismatch");
    assert!(matches!(err, RagError::VectorStore(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_missing_collection_is_ok() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/collections/ghost"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = VectorStoreClient::new(&test_config(&server.uri())).expect("client");
    client.delete_collection("ghost").await.expect("idempotent delete");
}

#[tokio::test(flavor = "multi_thread")]
async fn upsert_splits_into_batches() {
    let server = MockServer::start().await;
    // 3 points with batch size 2 -> two PUT calls.
    Mock::given(method("PUT"))
        .and(path("/collections/kb_test/points"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"result": {"status": "completed"}})),
        )
        .expect(2)
        .mount(&server)
        .await;

    let client = VectorStoreClient::new(&test_config(&server.uri())).expect("client");
    let points: Vec<VectorPoint> = (0..3)
        .map(|i| VectorPoint {
            id: Uuid::new_v4(),
            vector: vec![i as f32; 4],
            payload: Map::new(),
        })
        .collect();
    client.upsert("kb_test", points).await.expect("upsert");
}

#[tokio::test(flavor = "multi_thread")]
async fn search_parses_hits_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/collections/kb_test/points/search"))
        .and(body_partial_json(serde_json::json!({"limit": 2})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": [
                {"id": "aaa", "score": 0.9, "payload": {"text": "first"}},
                {"id": "bbb", "score": 0.4, "payload": {"text": "second"}}
            ]
        })))
        .mount(&server)
        .await;

    let client = VectorStoreClient::new(&test_config(&server.uri())).expect("client");
    let hits = client
        .search("kb_test", vec![0.0; 4], 2, Some(0.3))
        .await
        .expect("search");

    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].id, "aaa");
    assert!(hits[0].score > hits[1].score);
    assert_eq!(hits[1].payload.get("text").and_then(|v| v.as_str()), Some("second"));
}

#[tokio::test(flavor = "multi_thread")]
async fn scroll_follows_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/collections/kb_test/points/scroll"))
        .and(body_partial_json(serde_json::json!({"offset": "cursor-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": {
                "points": [{"id": "p2", "payload": {"text": "two"}}],
                "next_page_offset": null
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/collections/kb_test/points/scroll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": {
                "points": [{"id": "p1", "payload": {"text": "one"}}],
                "next_page_offset": "cursor-1"
            }
        })))
        .mount(&server)
        .await;

    let client = VectorStoreClient::new(&test_config(&server.uri())).expect("client");
    let points = client.scroll("kb_test", 100).await.expect("scroll");

    assert_eq!(points.len(), 2);
    assert_eq!(points[0].id, "p1");
    assert_eq!(points[1].id, "p2");
}

#[tokio::test(flavor = "multi_thread")]
async fn count_and_info() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/collections/kb_test/points/count"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"result": {"count": 42}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/collections/kb_test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(collection_body(4, 42)))
        .mount(&server)
        .await;

    let client = VectorStoreClient::new(&test_config(&server.uri())).expect("client");
    assert_eq!(client.count("kb_test").await.expect("count"), 42);

    let info = client.info("kb_test").await.expect("info");
    assert_eq!(info.dimension, 4);
    assert_eq!(info.points_count, 42);
}

#[tokio::test(flavor = "multi_thread")]
async fn server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/collections/kb_test/points/count"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/collections/kb_test/points/count"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": {"count": 7}})),
        )
        .mount(&server)
        .await;

    let client = VectorStoreClient::new(&test_config(&server.uri())).expect("client");
    assert_eq!(client.count("kb_test").await.expect("count"), 7);
}

#[tokio::test(flavor = "multi_thread")]
async fn healthy_reflects_reachability() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/collections"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"result": {"collections": []}})),
        )
        .mount(&server)
        .await;

    let client = VectorStoreClient::new(&test_config(&server.uri())).expect("client");
    assert!(client.healthy().await);

    let unreachable = VectorStoreClient::new(&test_config("http://127.0.0.1:9")).expect("client");
    assert!(!unreachable.healthy().await);
}

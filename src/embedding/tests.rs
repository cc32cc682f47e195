use super::*;
use crate::config::EmbeddingConfig;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(host: &str, dimension: usize) -> EmbeddingConfig {
    EmbeddingConfig {
        host: host.to_string(),
        model: "bge-m3".to_string(),
        dimension,
        batch_size: 2,
        retries: 2,
        backoff_initial_s: 0.01,
        backoff_factor: 1.5,
        inter_batch_delay_s: 0.0,
        timeout_s: 5,
    }
}

fn vector(dimension: usize, fill: f32) -> Vec<f32> {
    vec![fill; dimension]
}

#[test]
fn client_configuration() {
    let client = EmbeddingClient::new(&test_config("http://localhost:11434", 4))
        .expect("failed to create client");

    assert_eq!(client.model(), "bge-m3");
    assert_eq!(client.dimension(), 4);
}

#[test]
fn invalid_host_rejected() {
    let err = EmbeddingClient::new(&test_config("not a url", 4)).expect_err("should reject");
    assert!(matches!(err, RagError::Config(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn embed_query_returns_vector() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(serde_json::json!({"prompt": "hello"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"embedding": [0.1, 0.2, 0.3, 0.4]})),
        )
        .mount(&server)
        .await;

    let client = EmbeddingClient::new(&test_config(&server.uri(), 4)).expect("client");
    let vector = client.embed_query("hello").await.expect("embedding");
    assert_eq!(vector, vec![0.1, 0.2, 0.3, 0.4]);
}

#[tokio::test(flavor = "multi_thread")]
async fn embed_documents_preserves_order_across_batches() {
    let server = MockServer::start().await;
    // batch_size is 2, so three texts arrive as one batch of two and one single.
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(serde_json::json!({"input": ["a", "b"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "embeddings": [vector(4, 1.0), vector(4, 2.0)]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(serde_json::json!({"prompt": "c"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"embedding": vector(4, 3.0)})),
        )
        .mount(&server)
        .await;

    let client = EmbeddingClient::new(&test_config(&server.uri(), 4)).expect("client");
    let vectors = client
        .embed_documents(vec!["a".into(), "b".into(), "c".into()])
        .await
        .expect("embeddings");

    assert_eq!(vectors.len(), 3);
    assert_eq!(vectors[0][0], 1.0);
    assert_eq!(vectors[1][0], 2.0);
    assert_eq!(vectors[2][0], 3.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn dimension_mismatch_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"embedding": [0.1, 0.2, 0.3]})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = EmbeddingClient::new(&test_config(&server.uri(), 1024)).expect("client");
    let err = client.embed_query("hello").await.expect_err("should fail");
    assert!(matches!(err, RagError::Embedding(_)));
    assert!(err.to_string().contains("dimension mismatch"));
}

#[tokio::test(flavor = "multi_thread")]
async fn server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"embedding": vector(4, 0.5)})),
        )
        .mount(&server)
        .await;

    let client = EmbeddingClient::new(&test_config(&server.uri(), 4)).expect("client");
    let result = client.embed_query("retry me").await.expect("embedding");
    assert_eq!(result.len(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let client = EmbeddingClient::new(&test_config(&server.uri(), 4)).expect("client");
    let err = client.embed_query("nope").await.expect_err("should fail");
    assert!(matches!(err, RagError::Embedding(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_batch_falls_back_to_per_item() {
    let server = MockServer::start().await;
    // The batch endpoint keeps failing; the single-text endpoint works.
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(serde_json::json!({"input": ["a", "b"]})))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(serde_json::json!({"prompt": "a"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"embedding": vector(4, 1.0)})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(serde_json::json!({"prompt": "b"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"embedding": vector(4, 2.0)})),
        )
        .mount(&server)
        .await;

    let client = EmbeddingClient::new(&test_config(&server.uri(), 4)).expect("client");
    let vectors = client
        .embed_documents(vec!["a".into(), "b".into()])
        .await
        .expect("fallback embeddings");
    assert_eq!(vectors[0][0], 1.0);
    assert_eq!(vectors[1][0], 2.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn check_available_reports_model_presence() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "models": [{"name": "bge-m3"}, {"name": "qwen2.5:7b"}]
        })))
        .mount(&server)
        .await;

    let client = EmbeddingClient::new(&test_config(&server.uri(), 4)).expect("client");
    assert!(client.check_available().await);

    let mut missing = test_config(&server.uri(), 4);
    missing.model = "absent-model".to_string();
    let client = EmbeddingClient::new(&missing).expect("client");
    assert!(!client.check_available().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn check_available_false_when_unreachable() {
    // Port 9 is the discard port; nothing is listening there.
    let mut config = test_config("http://127.0.0.1:9", 4);
    config.retries = 1;
    let client = EmbeddingClient::new(&config).expect("client");
    assert!(!client.check_available().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_input_produces_empty_output() {
    let config = test_config("http://127.0.0.1:9", 4);
    let client = EmbeddingClient::new(&config).expect("client");
    let vectors = client.embed_documents(Vec::new()).await.expect("empty");
    assert!(vectors.is_empty());
}

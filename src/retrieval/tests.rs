use super::*;
use crate::config::{EmbeddingConfig, RetrievalConfig, RetrievalMode, VectorStoreConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn embed_config(host: &str) -> EmbeddingConfig {
    EmbeddingConfig {
        host: host.to_string(),
        model: "bge-m3".to_string(),
        dimension: 4,
        batch_size: 8,
        retries: 1,
        backoff_initial_s: 0.01,
        backoff_factor: 1.5,
        inter_batch_delay_s: 0.0,
        timeout_s: 5,
    }
}

fn store_config(url: &str) -> VectorStoreConfig {
    VectorStoreConfig {
        url: url.to_string(),
        default_collection: "knowledge_base".to_string(),
        upsert_batch_size: 100,
        retries: 1,
        timeout_s: 5,
    }
}

fn retrieval_config(mode: RetrievalMode) -> RetrievalConfig {
    RetrievalConfig {
        mode,
        top_k: 5,
        similarity_threshold: 0.5,
        vector_weight: 0.7,
        keyword_weight: 0.3,
        adaptive_min_threshold: 0.1,
        adaptive_target_results: 1,
    }
}

async fn engine_for(server: &MockServer) -> RetrievalEngine {
    let embedder = EmbeddingClient::new(&embed_config(&server.uri())).expect("embedder");
    let store = VectorStoreClient::new(&store_config(&server.uri())).expect("store");
    RetrievalEngine::new(Arc::new(embedder), Arc::new(store))
}

async fn mount_embed(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"embedding": [0.1, 0.2, 0.3, 0.4]})),
        )
        .mount(server)
        .await;
}

fn hit(id: &str, score: f32, text: &str, chunk_index: u64) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "score": score,
        "payload": {
            "text": text,
            "source": "corpus.txt",
            "chunk_index": chunk_index,
            "kb_id": "k1"
        }
    })
}

#[test]
fn tokenize_mixed_language() {
    let terms = tokenize("Who did 李小勇 partner with?");
    assert!(terms.contains(&"who".to_string()));
    assert!(terms.contains(&"partner".to_string()));
    assert!(terms.contains(&"李小".to_string()));
    assert!(terms.contains(&"小勇".to_string()));
    assert!(terms.contains(&"李小勇".to_string()));
    // Punctuation and single letters do not become terms.
    assert!(!terms.iter().any(|t| t.contains('?')));
}

#[test]
fn normalization_maps_to_unit_interval() {
    let hits: Vec<SearchHit> = [0.2f32, 0.5, 0.8]
        .iter()
        .enumerate()
        .map(|(i, score)| SearchHit {
            id: format!("h{i}"),
            score: *score,
            content: String::new(),
            source: String::new(),
            metadata: Map::new(),
        })
        .collect();

    let normalized = normalize_scores(&hits);
    assert_eq!(normalized, vec![0.0, 0.5, 1.0]);

    let single = normalize_scores(&hits[..1]);
    assert_eq!(single, vec![1.0]);
}

#[test]
fn expansion_prepends_synonyms() {
    let mut synonyms = SynonymMap::new();
    synonyms.insert("invest".to_string(), vec!["入股".to_string(), "funding".to_string()]);

    let expanded = expand_query("invest in tech", &synonyms);
    assert_eq!(expanded, "入股 funding invest in tech");

    assert_eq!(expand_query("invest", &SynonymMap::new()), "invest");
    assert_eq!(expand_query("unrelated", &synonyms), "unrelated");
}

#[tokio::test(flavor = "multi_thread")]
async fn vector_search_orders_and_converts_hits() {
    let server = MockServer::start().await;
    mount_embed(&server).await;
    Mock::given(method("POST"))
        .and(path("/collections/kb_k1/points/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": [
                hit("a", 0.9, "Zhang San invested in ABC Tech", 0),
                hit("b", 0.6, "unrelated fact", 3)
            ]
        })))
        .mount(&server)
        .await;

    let engine = engine_for(&server).await;
    let hits = engine
        .vector_search("kb_k1", "who invested?", 5, Some(0.5))
        .await
        .expect("search");

    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].content, "Zhang San invested in ABC Tech");
    assert_eq!(hits[0].source, "corpus.txt");
    assert!(hits[0].metadata.get("text").is_none());
    assert_eq!(hits[0].metadata.get("chunk_index").and_then(|v| v.as_u64()), Some(0));
}

#[tokio::test(flavor = "multi_thread")]
async fn ties_break_by_chunk_index_then_id() {
    let server = MockServer::start().await;
    mount_embed(&server).await;
    Mock::given(method("POST"))
        .and(path("/collections/kb_k1/points/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": [
                hit("z", 0.5, "same score, later chunk", 7),
                hit("b", 0.5, "same score, same chunk, later id", 2),
                hit("a", 0.5, "same score, same chunk, earlier id", 2)
            ]
        })))
        .mount(&server)
        .await;

    let engine = engine_for(&server).await;
    let hits = engine
        .vector_search("kb_k1", "q", 5, None)
        .await
        .expect("search");

    let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "z"]);
}

struct ThresholdResponder {
    attempts: Arc<AtomicUsize>,
}

impl Respond for ThresholdResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let body: serde_json::Value = serde_json::from_slice(&request.body).expect("json body");
        let threshold = body
            .get("score_threshold")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);

        if threshold <= 0.45 {
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": [hit("best", 0.45, "the matching snippet", 0)]
            }))
        } else {
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": []}))
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn adaptive_search_decays_threshold_multiplicatively() {
    let server = MockServer::start().await;
    mount_embed(&server).await;
    let attempts = Arc::new(AtomicUsize::new(0));
    Mock::given(method("POST"))
        .and(path("/collections/kb_k1/points/search"))
        .respond_with(ThresholdResponder {
            attempts: attempts.clone(),
        })
        .mount(&server)
        .await;

    let engine = engine_for(&server).await;
    let config = RetrievalConfig {
        mode: RetrievalMode::Vector,
        top_k: 10,
        similarity_threshold: 0.8,
        vector_weight: 1.0,
        keyword_weight: 0.0,
        adaptive_min_threshold: 0.2,
        adaptive_target_results: 3,
    };

    let hits = engine
        .search("kb_k1", "query with a weak match", &config, &SynonymMap::new())
        .await
        .expect("search");

    // Thresholds tried: 0.8, 0.56, 0.392, 0.274. The hit appears from the
    // third attempt on; the target of 3 is never met, so the largest
    // non-empty result is returned after the bounded four attempts.
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert_eq!(hits.len(), 1);
    assert!((hits[0].score - 0.45).abs() < 1e-6);
}

#[tokio::test(flavor = "multi_thread")]
async fn adaptive_search_stops_once_target_met() {
    let server = MockServer::start().await;
    mount_embed(&server).await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    Mock::given(method("POST"))
        .and(path("/collections/kb_k1/points/search"))
        .respond_with(move |_: &Request| {
            counter.fetch_add(1, Ordering::SeqCst);
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": [hit("a", 0.9, "hit one", 0)]
            }))
        })
        .mount(&server)
        .await;

    let engine = engine_for(&server).await;
    let config = retrieval_config(RetrievalMode::Vector);

    let hits = engine
        .search("kb_k1", "easy query", &config, &SynonymMap::new())
        .await
        .expect("search");

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(hits.len(), 1);
}

fn scroll_body() -> serde_json::Value {
    serde_json::json!({
        "result": {
            "points": [
                {"id": "p1", "payload": {"text": "李小勇和张三合作入股了ABC科技公司。", "source": "a.txt", "chunk_index": 0}},
                {"id": "p2", "payload": {"text": "Zhang San invested in ABC Tech Co.", "source": "a.txt", "chunk_index": 1}},
                {"id": "p3", "payload": {"text": "completely unrelated paragraph", "source": "b.txt", "chunk_index": 0}}
            ],
            "next_page_offset": null
        }
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn keyword_search_scores_by_tf_idf() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/collections/kb_k1/points/scroll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(scroll_body()))
        .mount(&server)
        .await;

    let engine = engine_for(&server).await;
    let hits = engine
        .keyword_search("kb_k1", "张三 invested", 5)
        .await
        .expect("search");

    assert_eq!(hits.len(), 2);
    // Both matching chunks rank above the unrelated one, which is absent.
    assert!(hits.iter().all(|h| h.id != "p3"));
}

#[tokio::test(flavor = "multi_thread")]
async fn keyword_search_empty_collection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/collections/kb_k1/points/scroll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": {"points": [], "next_page_offset": null}
        })))
        .mount(&server)
        .await;

    let engine = engine_for(&server).await;
    let hits = engine.keyword_search("kb_k1", "anything", 5).await.expect("search");
    assert!(hits.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn hybrid_with_full_vector_weight_matches_vector_ranking() {
    let server = MockServer::start().await;
    mount_embed(&server).await;
    Mock::given(method("POST"))
        .and(path("/collections/kb_k1/points/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": [
                hit("a", 0.9, "Zhang San invested in ABC Tech Co.", 0),
                hit("b", 0.7, "李小勇和张三合作。", 1),
                hit("c", 0.3, "completely unrelated paragraph", 2)
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/collections/kb_k1/points/scroll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(scroll_body()))
        .mount(&server)
        .await;

    let engine = engine_for(&server).await;
    let mut config = retrieval_config(RetrievalMode::Hybrid);
    config.vector_weight = 1.0;
    config.keyword_weight = 0.0;

    let vector_only = engine
        .vector_search("kb_k1", "who invested", config.top_k, Some(0.2))
        .await
        .expect("vector");
    let hybrid = engine
        .hybrid_search("kb_k1", "who invested", &config, 0.2)
        .await
        .expect("hybrid");

    let vector_ids: Vec<&str> = vector_only.iter().map(|h| h.id.as_str()).collect();
    let hybrid_ids: Vec<&str> = hybrid.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(vector_ids, hybrid_ids);
}

#[tokio::test(flavor = "multi_thread")]
async fn hybrid_is_deterministic_across_runs() {
    let server = MockServer::start().await;
    mount_embed(&server).await;
    Mock::given(method("POST"))
        .and(path("/collections/kb_k1/points/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": [
                hit("a", 0.9, "Zhang San invested in ABC Tech Co.", 0),
                hit("b", 0.7, "李小勇和张三合作入股。", 1)
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/collections/kb_k1/points/scroll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(scroll_body()))
        .mount(&server)
        .await;

    let engine = engine_for(&server).await;
    let config = retrieval_config(RetrievalMode::Hybrid);

    let first = engine
        .hybrid_search("kb_k1", "张三 invested", &config, 0.2)
        .await
        .expect("first run");
    let second = engine
        .hybrid_search("kb_k1", "张三 invested", &config, 0.2)
        .await
        .expect("second run");

    let first_ids: Vec<(&str, f32)> = first.iter().map(|h| (h.id.as_str(), h.score)).collect();
    let second_ids: Vec<(&str, f32)> = second.iter().map(|h| (h.id.as_str(), h.score)).collect();
    assert_eq!(first_ids, second_ids);
}

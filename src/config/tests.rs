use super::*;
use tempfile::TempDir;

#[test]
fn defaults_are_valid() {
    let config = Config::default();
    assert!(config.validate().is_ok());
}

#[test]
fn load_missing_file_uses_defaults() {
    let dir = TempDir::new().expect("temp dir");
    let config = Config::load(dir.path()).expect("load defaults");

    assert_eq!(config.llm.timeout_s, 60);
    assert_eq!(config.embedding.timeout_s, 30);
    assert_eq!(config.vector_store.timeout_s, 10);
    assert_eq!(config.base_dir, dir.path());
}

#[test]
fn load_partial_file() {
    let dir = TempDir::new().expect("temp dir");
    std::fs::write(
        dir.path().join("config.toml"),
        r#"
[embedding]
model = "nomic-embed-text"
dimension = 768

[retrieval]
mode = "hybrid"
top_k = 8
"#,
    )
    .expect("write config");

    let config = Config::load(dir.path()).expect("load config");
    assert_eq!(config.embedding.model, "nomic-embed-text");
    assert_eq!(config.embedding.dimension, 768);
    assert_eq!(config.retrieval.mode, RetrievalMode::Hybrid);
    assert_eq!(config.retrieval.top_k, 8);
    // Untouched sections keep their defaults.
    assert_eq!(config.chunking.chunk_size, 500);
}

#[test]
fn invalid_url_rejected() {
    let mut config = Config::default();
    config.vector_store.url = "not a url".to_string();
    let err = config.validate().expect_err("should reject");
    assert!(matches!(err, RagError::Config(_)));
}

#[test]
fn overlap_must_be_less_than_chunk_size() {
    let mut config = Config::default();
    config.chunking.chunk_overlap = config.chunking.chunk_size;
    assert!(config.validate().is_err());

    config.chunking.chunk_overlap = config.chunking.chunk_size + 10;
    assert!(config.validate().is_err());
}

#[test]
fn weights_must_sum_to_one() {
    let mut config = Config::default();
    config.retrieval.vector_weight = 0.9;
    config.retrieval.keyword_weight = 0.3;
    assert!(config.validate().is_err());

    config.retrieval.vector_weight = 1.0;
    config.retrieval.keyword_weight = 0.0;
    assert!(config.validate().is_ok());
}

#[test]
fn thresholds_must_be_in_unit_interval() {
    let mut config = Config::default();
    config.retrieval.similarity_threshold = 1.2;
    assert!(config.validate().is_err());

    config.retrieval.similarity_threshold = 0.8;
    config.retrieval.adaptive_min_threshold = -0.1;
    assert!(config.validate().is_err());
}

#[test]
fn inter_batch_delay_bounded() {
    let mut config = Config::default();
    config.embedding.inter_batch_delay_s = 5.0;
    assert!(config.validate().is_err());

    config.embedding.inter_batch_delay_s = 2.0;
    assert!(config.validate().is_ok());
}

#[test]
fn retrieval_mode_parses() {
    assert_eq!(
        "hybrid".parse::<RetrievalMode>().expect("parses"),
        RetrievalMode::Hybrid
    );
    assert!("semantic".parse::<RetrievalMode>().is_err());
}

#[test]
fn malformed_toml_is_a_config_error() {
    let dir = TempDir::new().expect("temp dir");
    std::fs::write(dir.path().join("config.toml"), "[llm\nhost=").expect("write config");

    let err = Config::load(dir.path()).expect_err("should fail");
    assert!(matches!(err, RagError::Config(_)));
}

#[cfg(test)]
mod tests;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::VectorStoreConfig;
use crate::{RagError, Result};

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_BASE: u64 = 2;

/// A point ready for upload: id, embedding, and the chunk payload that
/// searches return verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct VectorPoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: Map<String, Value>,
}

/// A search hit as returned by the store, ordered by descending similarity.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: Map<String, Value>,
}

/// A payload-only point produced by scrolling.
#[derive(Debug, Clone)]
pub struct PayloadPoint {
    pub id: String,
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub points_count: u64,
    pub dimension: usize,
}

/// REST client for a Qdrant-compatible vector database.
///
/// Collections use cosine distance. Upserts run in batches with retry and
/// exponential backoff; reads retry the same way. The client is cheap to
/// clone and safe to share across workers.
#[derive(Debug, Clone)]
pub struct VectorStoreClient {
    base_url: Url,
    agent: ureq::Agent,
    upsert_batch_size: usize,
    retries: u32,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct CollectionDescription {
    config: CollectionConfigResponse,
    #[serde(default)]
    points_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CollectionConfigResponse {
    params: CollectionParams,
}

#[derive(Debug, Deserialize)]
struct CollectionParams {
    vectors: VectorParams,
}

#[derive(Debug, Deserialize)]
struct VectorParams {
    size: usize,
}

#[derive(Debug, Deserialize)]
struct SearchResponseHit {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct ScrollResponse {
    points: Vec<ScrollPoint>,
    #[serde(default)]
    next_page_offset: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ScrollPoint {
    id: Value,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

impl VectorStoreClient {
    #[inline]
    pub fn new(config: &VectorStoreConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| RagError::Config(format!("invalid vector store URL: {e}")))?;

        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(config.timeout()))
            .build()
            .into();

        Ok(Self {
            base_url,
            agent,
            upsert_batch_size: config.upsert_batch_size.max(1),
            retries: config.retries.max(1),
        })
    }

    #[inline]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    #[inline]
    pub fn with_upsert_batch_size(mut self, batch_size: usize) -> Self {
        self.upsert_batch_size = batch_size.max(1);
        self
    }

    /// Create the collection if absent (cosine distance); validate the
    /// dimension of an existing one. Idempotent.
    pub async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<()> {
        let client = self.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || client.ensure_collection_blocking(&name, dimension))
            .await
            .map_err(|e| RagError::Internal(format!("vector store task panicked: {e}")))?
    }

    /// Delete the collection. Idempotent; deleting a missing collection is
    /// not an error.
    pub async fn delete_collection(&self, name: &str) -> Result<()> {
        let client = self.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || client.delete_collection_blocking(&name))
            .await
            .map_err(|e| RagError::Internal(format!("vector store task panicked: {e}")))?
    }

    pub async fn upsert(&self, name: &str, points: Vec<VectorPoint>) -> Result<()> {
        let client = self.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || client.upsert_blocking(&name, &points))
            .await
            .map_err(|e| RagError::Internal(format!("vector store task panicked: {e}")))?
    }

    pub async fn search(
        &self,
        name: &str,
        vector: Vec<f32>,
        limit: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredPoint>> {
        let client = self.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || {
            client.search_blocking(&name, &vector, limit, score_threshold)
        })
        .await
        .map_err(|e| RagError::Internal(format!("vector store task panicked: {e}")))?
    }

    /// Forward-only enumeration of payloads, following the scroll cursor
    /// until `max_points` points have been fetched or the collection is
    /// exhausted.
    pub async fn scroll(&self, name: &str, max_points: usize) -> Result<Vec<PayloadPoint>> {
        let client = self.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || client.scroll_blocking(&name, max_points))
            .await
            .map_err(|e| RagError::Internal(format!("vector store task panicked: {e}")))?
    }

    pub async fn count(&self, name: &str) -> Result<u64> {
        let client = self.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || client.count_blocking(&name))
            .await
            .map_err(|e| RagError::Internal(format!("vector store task panicked: {e}")))?
    }

    pub async fn info(&self, name: &str) -> Result<CollectionInfo> {
        let client = self.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || {
            client
                .collection_info_blocking(&name)?
                .ok_or_else(|| RagError::NotFound(format!("collection '{name}' does not exist")))
        })
        .await
        .map_err(|e| RagError::Internal(format!("vector store task panicked: {e}")))?
    }

    /// Delete all points whose payload field `key` equals `value`.
    pub async fn delete_by_payload(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let client = self.clone();
        let name = name.to_string();
        let key = key.to_string();
        let value = value.to_string();
        tokio::task::spawn_blocking(move || client.delete_by_payload_blocking(&name, &key, &value))
            .await
            .map_err(|e| RagError::Internal(format!("vector store task panicked: {e}")))?
    }

    /// Probe the server. Never errors.
    pub async fn healthy(&self) -> bool {
        let client = self.clone();
        tokio::task::spawn_blocking(move || client.healthy_blocking())
            .await
            .unwrap_or(false)
    }

    pub fn ensure_collection_blocking(&self, name: &str, dimension: usize) -> Result<()> {
        if let Some(info) = self.collection_info_blocking(name)? {
            if info.dimension != dimension {
                return Err(RagError::VectorStore(format!(
                    "collection '{name}' has dimension {}, expected {dimension}",
                    info.dimension
                )));
            }
            debug!("Collection '{name}' already exists with dimension {dimension}");
            return Ok(());
        }

        let url = self.collection_url(name)?;
        let body = json!({
            "vectors": { "size": dimension, "distance": "Cosine" }
        })
        .to_string();
        self.request_with_retry(|| {
            self.agent
                .put(url.as_str())
                .header("Content-Type", "application/json")
                .send(&body)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        info!("Created collection '{name}' with dimension {dimension}");
        Ok(())
    }

    pub fn delete_collection_blocking(&self, name: &str) -> Result<()> {
        let url = self.collection_url(name)?;
        let result = self.request_with_retry(|| {
            self.agent
                .delete(url.as_str())
                .call()
                .and_then(|mut resp| resp.body_mut().read_to_string())
        });

        match result {
            Ok(_) => {
                info!("Deleted collection '{name}'");
                Ok(())
            }
            Err(RagError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn upsert_blocking(&self, name: &str, points: &[VectorPoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        debug!(
            "Upserting {} points into '{name}' in batches of {}",
            points.len(),
            self.upsert_batch_size
        );

        let url = self.points_url(name, "?wait=true")?;
        for batch in points.chunks(self.upsert_batch_size) {
            let body = json!({ "points": batch }).to_string();
            self.request_with_retry(|| {
                self.agent
                    .put(url.as_str())
                    .header("Content-Type", "application/json")
                    .send(&body)
                    .and_then(|mut resp| resp.body_mut().read_to_string())
            })?;
        }

        debug!("Upserted {} points into '{name}'", points.len());
        Ok(())
    }

    pub fn search_blocking(
        &self,
        name: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredPoint>> {
        let url = self.points_url(name, "/search")?;
        let mut request = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(threshold) = score_threshold {
            request["score_threshold"] = json!(threshold);
        }
        let body = request.to_string();

        let response_text = self.request_with_retry(|| {
            self.agent
                .post(url.as_str())
                .header("Content-Type", "application/json")
                .send(&body)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        let parsed: ApiEnvelope<Vec<SearchResponseHit>> = serde_json::from_str(&response_text)
            .map_err(|e| RagError::VectorStore(format!("malformed search response: {e}")))?;

        let hits = parsed
            .result
            .into_iter()
            .map(|hit| ScoredPoint {
                id: point_id_to_string(&hit.id),
                score: hit.score,
                payload: hit.payload.unwrap_or_default(),
            })
            .collect();
        Ok(hits)
    }

    pub fn scroll_blocking(&self, name: &str, max_points: usize) -> Result<Vec<PayloadPoint>> {
        let url = self.points_url(name, "/scroll")?;
        let page_size = 256.min(max_points.max(1));
        let mut offset: Option<Value> = None;
        let mut points = Vec::new();

        loop {
            let mut request = json!({
                "limit": page_size,
                "with_payload": true,
                "with_vector": false,
            });
            if let Some(cursor) = &offset {
                request["offset"] = cursor.clone();
            }
            let body = request.to_string();

            let response_text = self.request_with_retry(|| {
                self.agent
                    .post(url.as_str())
                    .header("Content-Type", "application/json")
                    .send(&body)
                    .and_then(|mut resp| resp.body_mut().read_to_string())
            })?;

            let parsed: ApiEnvelope<ScrollResponse> = serde_json::from_str(&response_text)
                .map_err(|e| RagError::VectorStore(format!("malformed scroll response: {e}")))?;

            for point in parsed.result.points {
                points.push(PayloadPoint {
                    id: point_id_to_string(&point.id),
                    payload: point.payload.unwrap_or_default(),
                });
                if points.len() >= max_points {
                    return Ok(points);
                }
            }

            match parsed.result.next_page_offset {
                Some(cursor) if !cursor.is_null() => offset = Some(cursor),
                _ => break,
            }
        }

        Ok(points)
    }

    pub fn count_blocking(&self, name: &str) -> Result<u64> {
        let url = self.points_url(name, "/count")?;
        let body = json!({ "exact": true }).to_string();

        let response_text = self.request_with_retry(|| {
            self.agent
                .post(url.as_str())
                .header("Content-Type", "application/json")
                .send(&body)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        let parsed: ApiEnvelope<CountResponse> = serde_json::from_str(&response_text)
            .map_err(|e| RagError::VectorStore(format!("malformed count response: {e}")))?;
        Ok(parsed.result.count)
    }

    pub fn delete_by_payload_blocking(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let url = self.points_url(name, "/delete?wait=true")?;
        let body = json!({
            "filter": { "must": [ { "key": key, "match": { "value": value } } ] }
        })
        .to_string();

        self.request_with_retry(|| {
            self.agent
                .post(url.as_str())
                .header("Content-Type", "application/json")
                .send(&body)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;
        Ok(())
    }

    pub fn healthy_blocking(&self) -> bool {
        let Ok(url) = self.base_url.join("/collections") else {
            return false;
        };
        self.agent.get(url.as_str()).call().is_ok()
    }

    fn collection_info_blocking(&self, name: &str) -> Result<Option<CollectionInfo>> {
        let url = self.collection_url(name)?;
        let result = self.request_with_retry(|| {
            self.agent
                .get(url.as_str())
                .call()
                .and_then(|mut resp| resp.body_mut().read_to_string())
        });

        let response_text = match result {
            Ok(text) => text,
            Err(RagError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };

        let parsed: ApiEnvelope<CollectionDescription> = serde_json::from_str(&response_text)
            .map_err(|e| RagError::VectorStore(format!("malformed collection response: {e}")))?;

        Ok(Some(CollectionInfo {
            points_count: parsed.result.points_count.unwrap_or(0),
            dimension: parsed.result.config.params.vectors.size,
        }))
    }

    fn collection_url(&self, name: &str) -> Result<Url> {
        self.base_url
            .join(&format!("/collections/{name}"))
            .map_err(|e| RagError::Config(format!("failed to build collection URL: {e}")))
    }

    fn points_url(&self, name: &str, suffix: &str) -> Result<Url> {
        self.base_url
            .join(&format!("/collections/{name}/points{suffix}"))
            .map_err(|e| RagError::Config(format!("failed to build points URL: {e}")))
    }

    fn request_with_retry<F>(&self, mut request_fn: F) -> Result<String>
    where
        F: FnMut() -> std::result::Result<String, ureq::Error>,
    {
        let mut last_error = None;

        for attempt in 1..=self.retries {
            match request_fn() {
                Ok(response_text) => return Ok(response_text),
                Err(ureq::Error::StatusCode(404)) => {
                    return Err(RagError::NotFound("resource not found in vector store".into()));
                }
                Err(error) => {
                    let retryable = matches!(
                        &error,
                        ureq::Error::StatusCode(status) if *status >= 500
                    ) || matches!(
                        &error,
                        ureq::Error::ConnectionFailed
                            | ureq::Error::HostNotFound
                            | ureq::Error::Timeout(_)
                            | ureq::Error::Io(_)
                    );

                    let mapped = match &error {
                        ureq::Error::Timeout(_) => {
                            RagError::Timeout(format!("vector store request: {error}"))
                        }
                        _ => RagError::VectorStore(format!("request failed: {error}")),
                    };

                    if !retryable {
                        return Err(mapped);
                    }

                    warn!(
                        "Vector store request failed (attempt {attempt}/{}): {error}",
                        self.retries
                    );
                    last_error = Some(mapped);

                    if attempt < self.retries {
                        let delay = BACKOFF_INITIAL * BACKOFF_BASE.pow(attempt - 1) as u32;
                        std::thread::sleep(delay);
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| RagError::VectorStore("request failed after retries".into())))
    }
}

fn point_id_to_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

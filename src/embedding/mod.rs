#[cfg(test)]
mod tests;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::config::EmbeddingConfig;
use crate::{RagError, Result};

const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Client for an Ollama-compatible embedding service.
///
/// Documents are embedded in batches; each batch call is retried with
/// multiplicative backoff. A batch that keeps failing falls back to per-item
/// embedding to isolate the offending text. A response whose vector length
/// differs from the configured dimension is fatal and never retried.
#[derive(Debug, Clone)]
pub struct EmbeddingClient {
    base_url: Url,
    model: String,
    expected_dimension: usize,
    batch_size: usize,
    agent: ureq::Agent,
    retries: u32,
    backoff_initial: Duration,
    backoff_factor: f64,
    inter_batch_delay: Duration,
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Serialize)]
struct BatchEmbedRequest {
    model: String,
    #[serde(rename = "input")]
    inputs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

impl EmbeddingClient {
    #[inline]
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let base_url = Url::parse(&config.host)
            .map_err(|e| RagError::Config(format!("invalid embedding host: {e}")))?;

        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(config.timeout()))
            .build()
            .into();

        Ok(Self {
            base_url,
            model: config.model.clone(),
            expected_dimension: config.dimension,
            batch_size: config.batch_size.max(1),
            agent,
            retries: config.retries.max(1),
            backoff_initial: Duration::from_secs_f64(config.backoff_initial_s),
            backoff_factor: config.backoff_factor,
            inter_batch_delay: Duration::from_secs_f64(config.inter_batch_delay_s),
        })
    }

    #[inline]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    #[inline]
    pub fn with_backoff(mut self, initial: Duration, factor: f64) -> Self {
        self.backoff_initial = initial;
        self.backoff_factor = factor;
        self
    }

    #[inline]
    pub fn with_inter_batch_delay(mut self, delay: Duration) -> Self {
        self.inter_batch_delay = delay;
        self
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.expected_dimension
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let client = self.clone();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || client.embed_query_blocking(&text))
            .await
            .map_err(|e| RagError::Internal(format!("embedding task panicked: {e}")))?
    }

    /// Embed a batch of documents, preserving input order. Returns exactly
    /// `texts.len()` vectors or fails.
    pub async fn embed_documents(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let client = self.clone();
        tokio::task::spawn_blocking(move || client.embed_documents_blocking(&texts))
            .await
            .map_err(|e| RagError::Internal(format!("embedding task panicked: {e}")))?
    }

    /// Probe service reachability and model presence. Never errors.
    pub async fn check_available(&self) -> bool {
        let client = self.clone();
        tokio::task::spawn_blocking(move || client.check_available_blocking())
            .await
            .unwrap_or(false)
    }

    pub fn embed_query_blocking(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self.request_single(text)?;
        self.validate_dimension(&vector)?;
        Ok(vector)
    }

    pub fn embed_documents_blocking(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Embedding {} texts in batches of {}", texts.len(), self.batch_size);

        let mut results = Vec::with_capacity(texts.len());
        for (batch_index, batch) in texts.chunks(self.batch_size).enumerate() {
            if batch_index > 0 && !self.inter_batch_delay.is_zero() {
                std::thread::sleep(self.inter_batch_delay);
            }

            let vectors = match self.request_batch(batch) {
                Ok(vectors) => vectors,
                Err(err) if batch.len() > 1 => {
                    warn!(
                        "Batch of {} texts failed after retries ({err}), falling back to per-item embedding",
                        batch.len()
                    );
                    self.embed_items_individually(batch, err)?
                }
                Err(err) => return Err(err),
            };

            for vector in &vectors {
                self.validate_dimension(vector)?;
            }
            results.extend(vectors);
        }

        debug!("Embedded {} texts", results.len());
        Ok(results)
    }

    pub fn check_available_blocking(&self) -> bool {
        match self.list_models() {
            Ok(models) => {
                let present = models.iter().any(|m| m.name == self.model);
                if !present {
                    warn!(
                        "Embedding model {} not present on server (available: {:?})",
                        self.model,
                        models.iter().map(|m| m.name.as_str()).collect::<Vec<_>>()
                    );
                }
                present
            }
            Err(err) => {
                debug!("Embedding service unavailable: {err}");
                false
            }
        }
    }

    fn embed_items_individually(
        &self,
        batch: &[String],
        batch_err: RagError,
    ) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(batch.len());
        for text in batch {
            match self.request_single(text) {
                Ok(vector) => vectors.push(vector),
                // The batch error is what the caller acted on first; keep it.
                Err(_) => return Err(batch_err),
            }
        }
        Ok(vectors)
    }

    fn request_single(&self, text: &str) -> Result<Vec<f32>> {
        let url = self.embed_url()?;
        let request = EmbedRequest {
            model: self.model.clone(),
            prompt: text.to_string(),
        };
        let body = serde_json::to_string(&request)?;

        let response_text = self.request_with_retry(|| {
            self.agent
                .post(url.as_str())
                .header("Content-Type", "application/json")
                .send(&body)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        let parsed: EmbedResponse = serde_json::from_str(&response_text)
            .map_err(|e| RagError::Embedding(format!("malformed embedding response: {e}")))?;
        Ok(parsed.embedding)
    }

    fn request_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.len() == 1 {
            return Ok(vec![self.request_single(&texts[0])?]);
        }

        let url = self.embed_url()?;
        let request = BatchEmbedRequest {
            model: self.model.clone(),
            inputs: texts.to_vec(),
        };
        let body = serde_json::to_string(&request)?;

        let response_text = self.request_with_retry(|| {
            self.agent
                .post(url.as_str())
                .header("Content-Type", "application/json")
                .send(&body)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        let parsed: BatchEmbedResponse = serde_json::from_str(&response_text)
            .map_err(|e| RagError::Embedding(format!("malformed batch embedding response: {e}")))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(RagError::Embedding(format!(
                "embedding count mismatch: requested {}, received {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }
        Ok(parsed.embeddings)
    }

    fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = self
            .base_url
            .join("/api/tags")
            .map_err(|e| RagError::Config(format!("failed to build models URL: {e}")))?;

        let response_text = self.request_with_retry(|| {
            self.agent
                .get(url.as_str())
                .call()
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        let parsed: ModelsResponse = serde_json::from_str(&response_text)
            .map_err(|e| RagError::Embedding(format!("malformed models response: {e}")))?;
        Ok(parsed.models)
    }

    fn embed_url(&self) -> Result<Url> {
        self.base_url
            .join("/api/embed")
            .map_err(|e| RagError::Config(format!("failed to build embedding URL: {e}")))
    }

    fn validate_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.expected_dimension {
            return Err(RagError::Embedding(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.expected_dimension,
                vector.len()
            )));
        }
        Ok(())
    }

    fn request_with_retry<F>(&self, mut request_fn: F) -> Result<String>
    where
        F: FnMut() -> std::result::Result<String, ureq::Error>,
    {
        let mut delay = self.backoff_initial;
        let mut last_error = None;

        for attempt in 1..=self.retries {
            match request_fn() {
                Ok(response_text) => return Ok(response_text),
                Err(error) => {
                    let classified = classify_transport_error(&error);
                    match classified {
                        Transport::Fatal(err) => return Err(err),
                        Transport::Retryable(err) => {
                            warn!(
                                "Embedding request failed (attempt {attempt}/{}): {error}",
                                self.retries
                            );
                            last_error = Some(err);
                        }
                    }

                    if attempt < self.retries {
                        std::thread::sleep(delay);
                        delay = Duration::from_secs_f64(
                            (delay.as_secs_f64() * self.backoff_factor)
                                .min(BACKOFF_CAP.as_secs_f64()),
                        );
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| RagError::Embedding("request failed after retries".into())))
    }
}

enum Transport {
    Retryable(RagError),
    Fatal(RagError),
}

fn classify_transport_error(error: &ureq::Error) -> Transport {
    match error {
        ureq::Error::StatusCode(status) if *status >= 500 => {
            Transport::Retryable(RagError::Embedding(format!("server error: HTTP {status}")))
        }
        ureq::Error::StatusCode(status) => {
            Transport::Fatal(RagError::Embedding(format!("client error: HTTP {status}")))
        }
        ureq::Error::Timeout(_) => {
            Transport::Retryable(RagError::Timeout(format!("embedding request: {error}")))
        }
        ureq::Error::ConnectionFailed | ureq::Error::HostNotFound | ureq::Error::Io(_) => {
            Transport::Retryable(RagError::Embedding(format!("transport error: {error}")))
        }
        other => Transport::Fatal(RagError::Embedding(format!("request failed: {other}"))),
    }
}

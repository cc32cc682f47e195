#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::{RetrievalConfig, RetrievalMode};
use crate::embedding::EmbeddingClient;
use crate::vectorstore::{ScoredPoint, VectorStoreClient};
use crate::Result;

/// Multiplicative threshold decay applied by adaptive search.
const ADAPTIVE_FACTOR: f32 = 0.7;
/// Total search attempts adaptive search will make, the initial one included.
const ADAPTIVE_MAX_ATTEMPTS: usize = 4;
/// Upper bound on payloads fetched for in-memory keyword scoring.
const SCROLL_LIMIT: usize = 10_000;

/// Caller-supplied synonym dictionary for query expansion. Defaults to
/// empty; the engine never invents one.
pub type SynonymMap = HashMap<String, Vec<String>>;

/// A retrieval result. Sorted by descending score; ties broken by lower
/// chunk index, then lower id.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(skip)]
    pub id: String,
    pub score: f32,
    pub content: String,
    pub source: String,
    pub metadata: Map<String, Value>,
}

impl SearchHit {
    fn from_point(point: ScoredPoint) -> Self {
        let mut payload = point.payload;
        let content = payload
            .remove("text")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let source = payload
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        payload.remove("source");

        Self {
            id: point.id,
            score: point.score,
            content,
            source,
            metadata: payload,
        }
    }

    fn chunk_index(&self) -> u64 {
        self.metadata
            .get("chunk_index")
            .and_then(|v| v.as_u64())
            .unwrap_or(u64::MAX)
    }
}

/// Search strategies over one knowledge base's collection.
///
/// The engine is bound to the shared embedding and vector store clients; it
/// knows nothing about the agent that may call it as a tool.
pub struct RetrievalEngine {
    embedder: Arc<EmbeddingClient>,
    store: Arc<VectorStoreClient>,
}

impl RetrievalEngine {
    pub fn new(embedder: Arc<EmbeddingClient>, store: Arc<VectorStoreClient>) -> Self {
        Self { embedder, store }
    }

    /// Adaptive search over the configured mode: when an attempt yields
    /// fewer than `adaptive_target_results` hits, the similarity threshold
    /// is multiplied by 0.7 (floored at `adaptive_min_threshold`) and the
    /// search re-runs, up to four attempts. The first attempt meeting the
    /// target wins; otherwise the largest non-empty result is returned.
    pub async fn search(
        &self,
        collection: &str,
        query: &str,
        config: &RetrievalConfig,
        synonyms: &SynonymMap,
    ) -> Result<Vec<SearchHit>> {
        let query = expand_query(query, synonyms);

        let mut threshold = config.similarity_threshold;
        let mut best: Vec<SearchHit> = Vec::new();

        for attempt in 1..=ADAPTIVE_MAX_ATTEMPTS {
            debug!(
                "Search attempt {attempt}/{ADAPTIVE_MAX_ATTEMPTS} on '{collection}' (mode: {}, threshold: {threshold:.3})",
                config.mode
            );
            let results = self
                .search_once(collection, &query, config, threshold)
                .await?;

            if results.len() >= config.adaptive_target_results {
                info!(
                    "Search on '{collection}' met target with {} hit(s) at threshold {threshold:.3}",
                    results.len()
                );
                return Ok(results);
            }
            if results.len() > best.len() {
                best = results;
            }
            if threshold <= config.adaptive_min_threshold {
                break;
            }
            let next = (threshold * ADAPTIVE_FACTOR).max(config.adaptive_min_threshold);
            debug!(
                "Only {} hit(s) (target {}), lowering threshold {threshold:.3} -> {next:.3}",
                best.len(),
                config.adaptive_target_results
            );
            threshold = next;
        }

        info!(
            "Search on '{collection}' returning {} hit(s) after adaptive fallback",
            best.len()
        );
        Ok(best)
    }

    /// One search pass in the configured mode at an explicit threshold.
    pub async fn search_once(
        &self,
        collection: &str,
        query: &str,
        config: &RetrievalConfig,
        threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        let mut results = match config.mode {
            RetrievalMode::Vector => {
                self.vector_search(collection, query, config.top_k, Some(threshold))
                    .await?
            }
            RetrievalMode::Fulltext => {
                self.keyword_search(collection, query, config.top_k).await?
            }
            RetrievalMode::Hybrid => self.hybrid_search(collection, query, config, threshold).await?,
        };
        sort_hits(&mut results);
        Ok(results)
    }

    pub async fn vector_search(
        &self,
        collection: &str,
        query: &str,
        limit: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<SearchHit>> {
        let vector = self.embedder.embed_query(query).await?;
        let points = self.store.search(collection, vector, limit, threshold).await?;
        let mut hits: Vec<SearchHit> = points.into_iter().map(SearchHit::from_point).collect();
        sort_hits(&mut hits);
        Ok(hits)
    }

    /// In-memory keyword scoring: scroll the collection's payloads and rank
    /// by term frequency weighted with a lazily estimated inverse document
    /// frequency over the scrolled set.
    pub async fn keyword_search(
        &self,
        collection: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let terms = tokenize(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let points = self.store.scroll(collection, SCROLL_LIMIT).await?;
        if points.is_empty() {
            return Ok(Vec::new());
        }
        let total = points.len() as f64;

        let lowered: Vec<String> = points
            .iter()
            .map(|p| {
                p.payload
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_lowercase()
            })
            .collect();

        let mut document_frequency: HashMap<&str, usize> = HashMap::new();
        for term in &terms {
            let df = lowered
                .iter()
                .filter(|text| text.contains(term.as_str()))
                .count();
            document_frequency.insert(term, df);
        }

        let mut scored = Vec::new();
        for (index, text) in lowered.iter().enumerate() {
            let mut score = 0.0f64;
            for term in &terms {
                let df = document_frequency[term.as_str()];
                if df == 0 {
                    continue;
                }
                let tf = text.matches(term.as_str()).count() as f64;
                if tf == 0.0 {
                    continue;
                }
                let idf = (total / df as f64).ln();
                score += tf * idf;
            }
            if score > 0.0 {
                let point = &points[index];
                scored.push(SearchHit::from_point(ScoredPoint {
                    id: point.id.clone(),
                    score: score as f32,
                    payload: point.payload.clone(),
                }));
            }
        }

        sort_hits(&mut scored);
        scored.truncate(limit);
        Ok(scored)
    }

    /// Weighted merge of vector and keyword results. Both sides run with an
    /// internal limit of `2 * top_k`; their score lists are min-max
    /// normalized to [0,1] and combined as
    /// `final = vector_weight * s_v + keyword_weight * s_k`, a missing half
    /// contributing zero.
    pub async fn hybrid_search(
        &self,
        collection: &str,
        query: &str,
        config: &RetrievalConfig,
        threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        let internal_limit = config.top_k * 2;

        // A half with zero weight cannot contribute; skip its search.
        let vector_hits = if config.vector_weight > 0.0 {
            match self
                .vector_search(collection, query, internal_limit, Some(threshold))
                .await
            {
                Ok(hits) => hits,
                Err(err) => {
                    warn!("Vector half of hybrid search failed: {err}");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        let keyword_hits = if config.keyword_weight > 0.0 {
            self.keyword_search(collection, query, internal_limit)
                .await?
        } else {
            Vec::new()
        };

        let vector_scores = normalize_scores(&vector_hits);
        let keyword_scores = normalize_scores(&keyword_hits);

        struct Merged {
            hit: SearchHit,
            vector: f32,
            keyword: f32,
        }

        let mut merged: HashMap<String, Merged> = HashMap::new();
        for (hit, normalized) in vector_hits.into_iter().zip(vector_scores) {
            merged.insert(
                hit.id.clone(),
                Merged {
                    hit,
                    vector: normalized,
                    keyword: 0.0,
                },
            );
        }
        for (hit, normalized) in keyword_hits.into_iter().zip(keyword_scores) {
            merged
                .entry(hit.id.clone())
                .and_modify(|m| m.keyword = m.keyword.max(normalized))
                .or_insert(Merged {
                    hit,
                    vector: 0.0,
                    keyword: normalized,
                });
        }

        let mut results: Vec<SearchHit> = merged
            .into_values()
            .map(|m| {
                let mut hit = m.hit;
                hit.score = config.vector_weight * m.vector + config.keyword_weight * m.keyword;
                hit
            })
            .collect();

        sort_hits(&mut results);
        results.truncate(config.top_k);
        Ok(results)
    }
}

fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_index().cmp(&b.chunk_index()))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Min-max normalization of a hit list's scores to [0,1]. A single-element
/// or constant list normalizes to 1.0.
fn normalize_scores(hits: &[SearchHit]) -> Vec<f32> {
    if hits.is_empty() {
        return Vec::new();
    }
    let min = hits.iter().map(|h| h.score).fold(f32::INFINITY, f32::min);
    let max = hits.iter().map(|h| h.score).fold(f32::NEG_INFINITY, f32::max);
    if (max - min).abs() < f32::EPSILON {
        return vec![1.0; hits.len()];
    }
    hits.iter().map(|h| (h.score - min) / (max - min)).collect()
}

/// Query terms: lowercased whitespace-separated words, plus Chinese
/// 2- and 3-grams when CJK characters are present.
pub fn tokenize(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    let mut push = |term: String| {
        if !terms.contains(&term) {
            terms.push(term);
        }
    };

    for word in query.split_whitespace() {
        let cleaned: String = word
            .to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect();
        if cleaned.chars().count() >= 2 && !cleaned.chars().any(is_cjk) {
            push(cleaned);
        }
    }

    let cjk_runs: Vec<Vec<char>> = split_cjk_runs(query);
    for run in cjk_runs {
        for n in 2..=3 {
            if run.len() < n {
                continue;
            }
            for window in run.windows(n) {
                push(window.iter().collect());
            }
        }
    }

    terms
}

fn split_cjk_runs(text: &str) -> Vec<Vec<char>> {
    let mut runs = Vec::new();
    let mut current = Vec::new();
    for c in text.chars() {
        if is_cjk(c) {
            current.push(c);
        } else if !current.is_empty() {
            runs.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

/// Prepend synonym expansions for query terms found in the caller-supplied
/// dictionary. An empty dictionary leaves the query untouched.
pub fn expand_query(query: &str, synonyms: &SynonymMap) -> String {
    if synonyms.is_empty() {
        return query.to_string();
    }

    let mut expansions: Vec<&str> = Vec::new();
    for term in tokenize(query) {
        if let Some(alternatives) = synonyms.get(&term) {
            for alternative in alternatives {
                if !expansions.contains(&alternative.as_str()) {
                    expansions.push(alternative);
                }
            }
        }
    }

    if expansions.is_empty() {
        query.to_string()
    } else {
        format!("{} {query}", expansions.join(" "))
    }
}


use serde_json::{json, Map, Value};
use tracing::debug;

use crate::config::ChunkConfig;
use crate::loader::Document;
use crate::{RagError, Result};

/// Separator priority for general text.
const GENERAL_SEPARATORS: &[&str] = &["\n\n\n", "\n\n", "\n", ". ", " ", ""];

/// Separator priority for Chinese-aware splitting.
const CHINESE_SEPARATORS: &[&str] = &[
    "\n\n\n", "\n\n", "\n", "。", "？", "！", "；", "，", " ", "",
];

/// Auto-detection threshold: a document whose Chinese-character ratio is at
/// least this much is split with the Chinese separator list.
const CHINESE_RATIO_THRESHOLD: f64 = 0.3;

const SENTENCE_TERMINATORS: &[char] = &['。', '？', '！', '；', '.', '!', '?', ';', '\n'];

/// A bounded text fragment carrying its source metadata and position.
/// Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub content: String,
    pub metadata: Map<String, Value>,
}

impl Chunk {
    pub fn source(&self) -> &str {
        self.metadata
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
    }

    pub fn index(&self) -> u64 {
        self.metadata
            .get("chunk_index")
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }
}

/// Recursive character chunker.
///
/// Splits each document on a priority list of separators into fragments no
/// longer than the configured budget, then reassembles them into chunks with
/// the configured overlap taken from the tail of the preceding chunk.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkConfig,
}

impl Chunker {
    /// Fails when `chunk_overlap >= chunk_size`.
    pub fn new(config: ChunkConfig) -> Result<Self> {
        crate::config::validate_chunk_config(&config)
            .map_err(|e| RagError::Validation(e.to_string()))?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Split documents into chunks, preserving document order. `chunk_index`
    /// increases monotonically per source across all of that source's
    /// documents.
    pub fn split(&self, documents: &[Document]) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut counters: std::collections::HashMap<String, u64> = std::collections::HashMap::new();

        for document in documents {
            if document.content.trim().is_empty() {
                continue;
            }

            let separators = if self.use_chinese_separators(&document.content) {
                CHINESE_SEPARATORS
            } else {
                GENERAL_SEPARATORS
            };

            let counter = counters.entry(document.source().to_string()).or_insert(0);
            for content in self.split_text_with(&document.content, separators) {
                let mut metadata = document.metadata.clone();
                metadata.insert("chunk_index".to_string(), json!(*counter));
                chunks.push(Chunk { content, metadata });
                *counter += 1;
            }
        }

        debug!(
            "Split {} document(s) into {} chunk(s)",
            documents.len(),
            chunks.len()
        );
        chunks
    }

    fn use_chinese_separators(&self, text: &str) -> bool {
        self.config.chinese_aware || chinese_ratio(text) >= CHINESE_RATIO_THRESHOLD
    }

    fn split_text_with(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let overlap = self.config.chunk_overlap;
        let core_budget = self.config.chunk_size - overlap;

        let fragments = recursive_split(text, separators, core_budget);
        let cores = merge_fragments(fragments, core_budget);

        let mut chunks: Vec<String> = Vec::with_capacity(cores.len());
        for core in cores {
            if core.trim().is_empty() {
                continue;
            }
            let content = match chunks.last() {
                Some(previous) if overlap > 0 => {
                    let mut content = self.overlap_tail(previous);
                    content.push_str(&core);
                    content
                }
                _ => core,
            };
            chunks.push(content);
        }
        chunks
    }

    /// The text carried over from the previous chunk. In exact mode this is
    /// its last `chunk_overlap` characters; in sentence mode the carry-over
    /// starts just after the latest sentence terminator inside that window.
    fn overlap_tail(&self, previous: &str) -> String {
        let chars: Vec<char> = previous.chars().collect();
        let overlap = self.config.chunk_overlap.min(chars.len());
        let window_start = chars.len() - overlap;

        if !self.config.respect_sentence_boundary || window_start == 0 {
            return chars[window_start..].iter().collect();
        }

        // Snap the carry-over to a sentence start: it begins just after the
        // first terminator at or after the exact-overlap cut. No terminator
        // in the window falls back to the exact cut.
        let mut start = window_start;
        for i in (window_start - 1)..chars.len().saturating_sub(1) {
            if SENTENCE_TERMINATORS.contains(&chars[i]) {
                start = i + 1;
                break;
            }
        }
        chars[start..].iter().collect()
    }
}

/// Fraction of characters in the CJK Unified Ideographs block.
pub fn chinese_ratio(text: &str) -> f64 {
    let mut total = 0usize;
    let mut chinese = 0usize;
    for c in text.chars() {
        if c.is_whitespace() {
            continue;
        }
        total += 1;
        if ('\u{4e00}'..='\u{9fff}').contains(&c) {
            chinese += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        chinese as f64 / total as f64
    }
}

/// Split `text` into fragments of at most `max_chars` characters, trying the
/// separators in priority order and recursing into narrower separators for
/// pieces that are still too long. Separators stay attached to the piece
/// they terminate, so no characters are lost.
fn recursive_split(text: &str, separators: &[&str], max_chars: usize) -> Vec<String> {
    if char_len(text) <= max_chars {
        return vec![text.to_string()];
    }

    let Some((separator, rest)) = separators.split_first() else {
        return split_by_chars(text, max_chars);
    };

    if separator.is_empty() {
        return split_by_chars(text, max_chars);
    }
    if !text.contains(separator) {
        return recursive_split(text, rest, max_chars);
    }

    let mut fragments = Vec::new();
    for piece in text.split_inclusive(separator) {
        if char_len(piece) <= max_chars {
            fragments.push(piece.to_string());
        } else {
            fragments.extend(recursive_split(piece, rest, max_chars));
        }
    }
    fragments
}

/// Greedily merge adjacent fragments up to the budget. Fragments are already
/// individually within budget.
fn merge_fragments(fragments: Vec<String>, max_chars: usize) -> Vec<String> {
    let mut merged = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for fragment in fragments {
        let fragment_len = char_len(&fragment);
        if current_len + fragment_len > max_chars && !current.is_empty() {
            merged.push(current);
            current = String::new();
            current_len = 0;
        }
        current.push_str(&fragment);
        current_len += fragment_len;
    }
    if !current.is_empty() {
        merged.push(current);
    }
    merged
}

fn split_by_chars(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars.max(1))
        .map(|window| window.iter().collect())
        .collect()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

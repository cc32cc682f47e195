use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, Type};

use crate::config::{ChunkConfig, RetrievalConfig, RetrievalMode};
use crate::{RagError, Result};

/// A knowledge base: a named, isolated corpus owning exactly one vector
/// collection. `embedding_model` and `embedding_dimension` are fixed for
/// the KB's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: String,
    pub name: String,
    pub description: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub chunk_config: ChunkConfig,
    pub retrieval_config: RetrievalConfig,
    pub collection_name: String,
    pub document_count: i64,
    pub chunk_count: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl FromRow<'_, SqliteRow> for KnowledgeBase {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let mode: String = row.try_get("retrieval_mode")?;
        let mode = mode
            .parse::<RetrievalMode>()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "retrieval_mode".to_string(),
                source: Box::new(std::io::Error::other(e.to_string())),
            })?;

        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            embedding_model: row.try_get("embedding_model")?,
            embedding_dimension: row.try_get::<i64, _>("embedding_dimension")? as usize,
            chunk_config: ChunkConfig {
                chunk_size: row.try_get::<i64, _>("chunk_size")? as usize,
                chunk_overlap: row.try_get::<i64, _>("chunk_overlap")? as usize,
                respect_sentence_boundary: row.try_get("respect_sentence_boundary")?,
                chinese_aware: row.try_get("chinese_aware")?,
            },
            retrieval_config: RetrievalConfig {
                mode,
                top_k: row.try_get::<i64, _>("top_k")? as usize,
                similarity_threshold: row.try_get::<f64, _>("similarity_threshold")? as f32,
                vector_weight: row.try_get::<f64, _>("vector_weight")? as f32,
                keyword_weight: row.try_get::<f64, _>("keyword_weight")? as f32,
                adaptive_min_threshold: row.try_get::<f64, _>("adaptive_min_threshold")? as f32,
                adaptive_target_results: row.try_get::<i64, _>("adaptive_target_results")?
                    as usize,
            },
            collection_name: row.try_get("collection_name")?,
            document_count: row.try_get("document_count")?,
            chunk_count: row.try_get("chunk_count")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Creation request for a knowledge base. Unset configs inherit the service
/// defaults at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewKnowledgeBase {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    #[serde(default)]
    pub chunk_config: Option<ChunkConfig>,
    #[serde(default)]
    pub retrieval_config: Option<RetrievalConfig>,
}

/// Patch for an existing knowledge base. The embedding fields are present
/// only so that attempts to change them can be rejected explicitly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBaseUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub chunk_config: Option<ChunkConfig>,
    #[serde(default)]
    pub retrieval_config: Option<RetrievalConfig>,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub embedding_dimension: Option<usize>,
}

/// Validate a KB name: 2..=100 characters, restricted to letters, digits,
/// CJK ideographs, spaces, underscores, and hyphens.
pub fn validate_kb_name(name: &str) -> Result<()> {
    let length = name.chars().count();
    if !(2..=100).contains(&length) {
        return Err(RagError::Validation(format!(
            "knowledge base name must be 2..=100 characters (got {length})"
        )));
    }
    let ok = name.chars().all(|c| {
        c.is_ascii_alphanumeric()
            || c == '_'
            || c == '-'
            || c == ' '
            || ('\u{4e00}'..='\u{9fff}').contains(&c)
    });
    if !ok {
        return Err(RagError::Validation(format!(
            "knowledge base name '{name}' contains unsupported characters"
        )));
    }
    Ok(())
}

pub fn validate_kb_description(description: &str) -> Result<()> {
    if description.chars().count() > 500 {
        return Err(RagError::Validation(
            "knowledge base description must be at most 500 characters".into(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Parsing,
    Persisting,
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            FileStatus::Pending => write!(f, "pending"),
            FileStatus::Parsing => write!(f, "parsing"),
            FileStatus::Persisting => write!(f, "persisting"),
            FileStatus::Succeeded => write!(f, "succeeded"),
            FileStatus::Failed => write!(f, "failed"),
            FileStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for FileStatus {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(FileStatus::Pending),
            "parsing" => Ok(FileStatus::Parsing),
            "persisting" => Ok(FileStatus::Persisting),
            "succeeded" => Ok(FileStatus::Succeeded),
            "failed" => Ok(FileStatus::Failed),
            "cancelled" => Ok(FileStatus::Cancelled),
            other => Err(RagError::Validation(format!(
                "unknown file status '{other}'"
            ))),
        }
    }
}

impl FileStatus {
    /// Lifecycle: pending → parsing → persisting → succeeded | failed.
    /// A pending or in-flight file may be cancelled; terminal states have
    /// no outgoing transitions (reattempt is delete + re-upload).
    pub fn can_transition_to(self, next: FileStatus) -> bool {
        use FileStatus::*;
        matches!(
            (self, next),
            (Pending, Parsing)
                | (Parsing, Persisting)
                | (Persisting, Succeeded)
                | (Pending, Failed)
                | (Parsing, Failed)
                | (Persisting, Failed)
                | (Pending, Cancelled)
                | (Parsing, Cancelled)
                | (Persisting, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FileStatus::Succeeded | FileStatus::Failed | FileStatus::Cancelled
        )
    }
}

/// A file registered to a knowledge base, tracking its ingestion lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct FileEntity {
    pub id: String,
    pub kb_id: String,
    pub file_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub content_type: String,
    pub status: FileStatus,
    pub chunk_count: i64,
    pub failed_reason: Option<String>,
    pub source_mtime: Option<i64>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewFileEntity {
    pub kb_id: String,
    pub file_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub content_type: String,
}

/// One page of a listing, with the total across all pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub pages: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, page_size: i64) -> Self {
        let pages = if page_size > 0 {
            (total + page_size - 1) / page_size
        } else {
            0
        };
        Self { items, total, pages }
    }
}

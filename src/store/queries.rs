use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use super::models::*;
use crate::config::{ChunkConfig, RetrievalConfig};
use crate::{RagError, Result};

pub struct KbQueries;

impl KbQueries {
    pub async fn create(
        pool: &SqlitePool,
        id: &str,
        collection_name: &str,
        new_kb: &NewKnowledgeBase,
        chunk_config: &ChunkConfig,
        retrieval_config: &RetrievalConfig,
    ) -> Result<KnowledgeBase> {
        let now = Utc::now().naive_utc();
        sqlx::query(
            r#"
            INSERT INTO knowledge_bases (
                id, name, description, embedding_model, embedding_dimension,
                chunk_size, chunk_overlap, respect_sentence_boundary, chinese_aware,
                retrieval_mode, top_k, similarity_threshold, vector_weight, keyword_weight,
                adaptive_min_threshold, adaptive_target_results,
                collection_name, document_count, chunk_count, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?)
            "#,
        )
        .bind(id)
        .bind(&new_kb.name)
        .bind(&new_kb.description)
        .bind(&new_kb.embedding_model)
        .bind(new_kb.embedding_dimension as i64)
        .bind(chunk_config.chunk_size as i64)
        .bind(chunk_config.chunk_overlap as i64)
        .bind(chunk_config.respect_sentence_boundary)
        .bind(chunk_config.chinese_aware)
        .bind(retrieval_config.mode.to_string())
        .bind(retrieval_config.top_k as i64)
        .bind(retrieval_config.similarity_threshold as f64)
        .bind(retrieval_config.vector_weight as f64)
        .bind(retrieval_config.keyword_weight as f64)
        .bind(retrieval_config.adaptive_min_threshold as f64)
        .bind(retrieval_config.adaptive_target_results as i64)
        .bind(collection_name)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                RagError::Conflict(format!("knowledge base '{}' already exists", new_kb.name))
            }
            _ => e.into(),
        })?;

        Self::get(pool, id)
            .await?
            .ok_or_else(|| RagError::Internal("created knowledge base not found".into()))
    }

    pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<KnowledgeBase>> {
        let kb = sqlx::query_as::<_, KnowledgeBase>("SELECT * FROM knowledge_bases WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(kb)
    }

    pub async fn get_by_name(pool: &SqlitePool, name: &str) -> Result<Option<KnowledgeBase>> {
        let kb = sqlx::query_as::<_, KnowledgeBase>("SELECT * FROM knowledge_bases WHERE name = ?")
            .bind(name)
            .fetch_optional(pool)
            .await?;
        Ok(kb)
    }

    /// Paged listing, newest first. Pages are 1-based.
    pub async fn list(pool: &SqlitePool, page: i64, size: i64) -> Result<Page<KnowledgeBase>> {
        let page = page.max(1);
        let size = size.clamp(1, 500);
        let offset = (page - 1) * size;

        let items = sqlx::query_as::<_, KnowledgeBase>(
            "SELECT * FROM knowledge_bases ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(size)
        .bind(offset)
        .fetch_all(pool)
        .await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM knowledge_bases")
            .fetch_one(pool)
            .await?;

        Ok(Page::new(items, total, size))
    }

    /// Apply a patch to the mutable fields. The caller has already rejected
    /// immutable-field changes; this only touches name, description, and the
    /// two config groups.
    pub async fn update(
        pool: &SqlitePool,
        id: &str,
        patch: &KnowledgeBaseUpdate,
    ) -> Result<KnowledgeBase> {
        let existing = Self::get(pool, id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("knowledge base '{id}' does not exist")))?;

        let name = patch.name.clone().unwrap_or(existing.name);
        let description = patch.description.clone().unwrap_or(existing.description);
        let chunk = patch.chunk_config.clone().unwrap_or(existing.chunk_config);
        let retrieval = patch
            .retrieval_config
            .clone()
            .unwrap_or(existing.retrieval_config);
        let updated_at = monotone_now(existing.updated_at);

        sqlx::query(
            r#"
            UPDATE knowledge_bases SET
                name = ?, description = ?,
                chunk_size = ?, chunk_overlap = ?, respect_sentence_boundary = ?, chinese_aware = ?,
                retrieval_mode = ?, top_k = ?, similarity_threshold = ?,
                vector_weight = ?, keyword_weight = ?,
                adaptive_min_threshold = ?, adaptive_target_results = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&name)
        .bind(&description)
        .bind(chunk.chunk_size as i64)
        .bind(chunk.chunk_overlap as i64)
        .bind(chunk.respect_sentence_boundary)
        .bind(chunk.chinese_aware)
        .bind(retrieval.mode.to_string())
        .bind(retrieval.top_k as i64)
        .bind(retrieval.similarity_threshold as f64)
        .bind(retrieval.vector_weight as f64)
        .bind(retrieval.keyword_weight as f64)
        .bind(retrieval.adaptive_min_threshold as f64)
        .bind(retrieval.adaptive_target_results as i64)
        .bind(updated_at)
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                RagError::Conflict(format!("knowledge base '{name}' already exists"))
            }
            _ => e.into(),
        })?;

        Self::get(pool, id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("knowledge base '{id}' does not exist")))
    }

    /// Delete the record; files cascade.
    pub async fn delete(pool: &SqlitePool, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM knowledge_bases WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RagError::NotFound(format!(
                "knowledge base '{id}' does not exist"
            )));
        }
        debug!("Deleted knowledge base '{id}'");
        Ok(())
    }

    /// Bump the monotone document/chunk counters after a successful ingest.
    pub async fn add_counts(
        pool: &SqlitePool,
        id: &str,
        documents: i64,
        chunks: i64,
    ) -> Result<()> {
        let existing = Self::get(pool, id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("knowledge base '{id}' does not exist")))?;
        let updated_at = monotone_now(existing.updated_at);

        sqlx::query(
            "UPDATE knowledge_bases SET document_count = document_count + ?, chunk_count = chunk_count + ?, updated_at = ? WHERE id = ?",
        )
        .bind(documents)
        .bind(chunks)
        .bind(updated_at)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }
}

pub struct FileQueries;

impl FileQueries {
    pub async fn create(pool: &SqlitePool, id: &str, new_file: &NewFileEntity) -> Result<FileEntity> {
        let now = Utc::now().naive_utc();
        sqlx::query(
            r#"
            INSERT INTO files (
                id, kb_id, file_name, file_path, file_size, content_type,
                status, chunk_count, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?)
            "#,
        )
        .bind(id)
        .bind(&new_file.kb_id)
        .bind(&new_file.file_name)
        .bind(&new_file.file_path)
        .bind(new_file.file_size)
        .bind(&new_file.content_type)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        Self::get(pool, &new_file.kb_id, id)
            .await?
            .ok_or_else(|| RagError::Internal("created file record not found".into()))
    }

    pub async fn get(pool: &SqlitePool, kb_id: &str, id: &str) -> Result<Option<FileEntity>> {
        let file = sqlx::query_as::<_, FileEntity>(
            "SELECT * FROM files WHERE kb_id = ? AND id = ?",
        )
        .bind(kb_id)
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(file)
    }

    /// Update a file's lifecycle status, enforcing the legal transitions.
    pub async fn update_status(
        pool: &SqlitePool,
        kb_id: &str,
        id: &str,
        status: FileStatus,
        failed_reason: Option<&str>,
    ) -> Result<FileEntity> {
        let existing = Self::get(pool, kb_id, id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("file '{id}' does not exist")))?;

        if !existing.status.can_transition_to(status) {
            return Err(RagError::Validation(format!(
                "illegal file status transition {} -> {status}",
                existing.status
            )));
        }

        let updated_at = monotone_now(existing.updated_at);
        sqlx::query(
            "UPDATE files SET status = ?, failed_reason = ?, updated_at = ? WHERE kb_id = ? AND id = ?",
        )
        .bind(status)
        .bind(failed_reason)
        .bind(updated_at)
        .bind(kb_id)
        .bind(id)
        .execute(pool)
        .await?;

        Self::get(pool, kb_id, id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("file '{id}' does not exist")))
    }

    /// Record a successful ingest: chunk count plus the source mtime used by
    /// incremental re-indexing.
    pub async fn mark_succeeded(
        pool: &SqlitePool,
        kb_id: &str,
        id: &str,
        chunk_count: i64,
        source_mtime: Option<i64>,
    ) -> Result<FileEntity> {
        let existing = Self::get(pool, kb_id, id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("file '{id}' does not exist")))?;

        if !existing.status.can_transition_to(FileStatus::Succeeded) {
            return Err(RagError::Validation(format!(
                "illegal file status transition {} -> succeeded",
                existing.status
            )));
        }

        let updated_at = monotone_now(existing.updated_at);
        sqlx::query(
            r#"
            UPDATE files SET status = 'succeeded', chunk_count = ?, source_mtime = ?,
                failed_reason = NULL, updated_at = ?
            WHERE kb_id = ? AND id = ?
            "#,
        )
        .bind(chunk_count)
        .bind(source_mtime)
        .bind(updated_at)
        .bind(kb_id)
        .bind(id)
        .execute(pool)
        .await?;

        Self::get(pool, kb_id, id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("file '{id}' does not exist")))
    }

    pub async fn list(
        pool: &SqlitePool,
        kb_id: &str,
        status: Option<FileStatus>,
        name_query: Option<&str>,
        page: i64,
        size: i64,
    ) -> Result<Page<FileEntity>> {
        let page = page.max(1);
        let size = size.clamp(1, 500);
        let offset = (page - 1) * size;

        let pattern = name_query.map(|q| format!("%{q}%"));

        let items = sqlx::query_as::<_, FileEntity>(
            r#"
            SELECT * FROM files
            WHERE kb_id = ?
              AND (? IS NULL OR status = ?)
              AND (? IS NULL OR file_name LIKE ?)
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(kb_id)
        .bind(status)
        .bind(status)
        .bind(&pattern)
        .bind(&pattern)
        .bind(size)
        .bind(offset)
        .fetch_all(pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM files
            WHERE kb_id = ?
              AND (? IS NULL OR status = ?)
              AND (? IS NULL OR file_name LIKE ?)
            "#,
        )
        .bind(kb_id)
        .bind(status)
        .bind(status)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_one(pool)
        .await?;

        Ok(Page::new(items, total, size))
    }

    /// The most recent successfully ingested record for a path, used to skip
    /// unchanged files on incremental re-index.
    pub async fn last_success_for_path(
        pool: &SqlitePool,
        kb_id: &str,
        file_path: &str,
    ) -> Result<Option<FileEntity>> {
        let file = sqlx::query_as::<_, FileEntity>(
            r#"
            SELECT * FROM files
            WHERE kb_id = ? AND file_path = ? AND status = 'succeeded'
            ORDER BY updated_at DESC LIMIT 1
            "#,
        )
        .bind(kb_id)
        .bind(file_path)
        .fetch_optional(pool)
        .await?;
        Ok(file)
    }

    pub async fn delete(pool: &SqlitePool, kb_id: &str, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM files WHERE kb_id = ? AND id = ?")
            .bind(kb_id)
            .bind(id)
            .execute(pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RagError::NotFound(format!("file '{id}' does not exist")));
        }
        Ok(())
    }
}

/// Timestamps never move backwards, even across clock adjustments.
fn monotone_now(previous: NaiveDateTime) -> NaiveDateTime {
    Utc::now().naive_utc().max(previous)
}


use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{validate_chunk_config, validate_retrieval_config, Config};
use crate::pipeline::{IngestFile, IngestionPipeline, IngestionReport};
use crate::retrieval::{RetrievalEngine, SearchHit, SynonymMap};
use crate::store::{
    validate_kb_description, validate_kb_name, Database, FileEntity, FileQueries, FileStatus,
    KbQueries, KnowledgeBase, KnowledgeBaseUpdate, NewFileEntity, NewKnowledgeBase, Page,
};
use crate::vectorstore::VectorStoreClient;
use crate::{RagError, Result};

/// Per-query overrides accepted by the query endpoint; unset fields fall
/// back to the KB's retrieval configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryOverrides {
    pub top_k: Option<usize>,
    pub similarity_threshold: Option<f32>,
}

/// High-level knowledge-base operations: lifecycle, file admission, and
/// query dispatch. Coordinates the metadata store, the vector store, and
/// the ingestion pipeline so that each KB owns exactly one collection.
pub struct KbManager {
    database: Database,
    store: Arc<VectorStoreClient>,
    pipeline: Arc<IngestionPipeline>,
    retrieval: Arc<RetrievalEngine>,
    default_chunking: crate::config::ChunkConfig,
    default_retrieval: crate::config::RetrievalConfig,
    max_query_length: usize,
    uploads_dir: PathBuf,
}

impl KbManager {
    pub fn new(
        database: Database,
        store: Arc<VectorStoreClient>,
        pipeline: Arc<IngestionPipeline>,
        retrieval: Arc<RetrievalEngine>,
        config: &Config,
    ) -> Self {
        Self {
            database,
            store,
            pipeline,
            retrieval,
            default_chunking: config.chunking.clone(),
            default_retrieval: config.retrieval.clone(),
            max_query_length: config.limits.max_query_length,
            uploads_dir: config.base_dir.join("uploads"),
        }
    }

    /// Create a knowledge base and its vector collection. The record is
    /// written first; if collection creation fails it is rolled back so no
    /// orphan record survives.
    pub async fn create_kb(&self, mut spec: NewKnowledgeBase) -> Result<KnowledgeBase> {
        validate_kb_name(&spec.name)?;
        validate_kb_description(&spec.description)?;
        if spec.embedding_dimension == 0 {
            return Err(RagError::Validation(
                "embedding_dimension must be positive".into(),
            ));
        }
        if spec.embedding_model.trim().is_empty() {
            return Err(RagError::Validation("embedding_model must be set".into()));
        }

        let chunk_config = spec
            .chunk_config
            .take()
            .unwrap_or_else(|| self.default_chunking.clone());
        let retrieval_config = spec
            .retrieval_config
            .take()
            .unwrap_or_else(|| self.default_retrieval.clone());
        validate_chunk_config(&chunk_config).map_err(|e| RagError::Validation(e.to_string()))?;
        validate_retrieval_config(&retrieval_config)
            .map_err(|e| RagError::Validation(e.to_string()))?;

        let id = Uuid::new_v4().simple().to_string();
        let collection_name = format!("kb_{id}");

        let kb = KbQueries::create(
            self.database.pool(),
            &id,
            &collection_name,
            &spec,
            &chunk_config,
            &retrieval_config,
        )
        .await?;

        if let Err(err) = self
            .store
            .ensure_collection(&collection_name, kb.embedding_dimension)
            .await
        {
            error!("Collection creation for '{}' failed, rolling back: {err}", kb.name);
            if let Err(rollback_err) = KbQueries::delete(self.database.pool(), &id).await {
                error!("Rollback of knowledge base '{id}' failed: {rollback_err}");
            }
            return Err(err);
        }

        info!("Created knowledge base '{}' ({id})", kb.name);
        Ok(kb)
    }

    pub async fn get_kb(&self, id: &str) -> Result<KnowledgeBase> {
        KbQueries::get(self.database.pool(), id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("knowledge base '{id}' does not exist")))
    }

    pub async fn list_kbs(&self, page: i64, size: i64) -> Result<Page<KnowledgeBase>> {
        KbQueries::list(self.database.pool(), page, size).await
    }

    /// Patch mutable fields. The embedding model and dimension are fixed for
    /// the KB's lifetime; attempts to change them are conflicts.
    pub async fn update_kb(&self, id: &str, patch: KnowledgeBaseUpdate) -> Result<KnowledgeBase> {
        let existing = self.get_kb(id).await?;

        if let Some(model) = &patch.embedding_model {
            if *model != existing.embedding_model {
                return Err(RagError::Conflict(
                    "embedding_model is immutable after creation".into(),
                ));
            }
        }
        if let Some(dimension) = patch.embedding_dimension {
            if dimension != existing.embedding_dimension {
                return Err(RagError::Conflict(
                    "embedding_dimension is immutable after creation".into(),
                ));
            }
        }

        if let Some(name) = &patch.name {
            validate_kb_name(name)?;
        }
        if let Some(description) = &patch.description {
            validate_kb_description(description)?;
        }
        if let Some(chunk_config) = &patch.chunk_config {
            validate_chunk_config(chunk_config).map_err(|e| RagError::Validation(e.to_string()))?;
        }
        if let Some(retrieval_config) = &patch.retrieval_config {
            validate_retrieval_config(retrieval_config)
                .map_err(|e| RagError::Validation(e.to_string()))?;
        }

        KbQueries::update(self.database.pool(), id, &patch).await
    }

    /// Delete the KB. The collection goes first: a crash between the two
    /// steps leaves at most an orphan collection, never an orphan record.
    pub async fn delete_kb(&self, id: &str) -> Result<()> {
        let kb = self.get_kb(id).await?;

        self.store.delete_collection(&kb.collection_name).await?;
        KbQueries::delete(self.database.pool(), id).await?;

        info!("Deleted knowledge base '{}' ({id})", kb.name);
        Ok(())
    }

    /// Persist an uploaded file under the uploads directory and register it
    /// with `pending` status. Processing is a separate step.
    pub async fn register_upload(
        &self,
        kb_id: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<FileEntity> {
        let kb = self.get_kb(kb_id).await?;

        let safe_name = sanitize_file_name(file_name)?;
        let file_id = Uuid::new_v4().simple().to_string();
        let target_dir = self.uploads_dir.join(&kb.id);
        std::fs::create_dir_all(&target_dir)?;
        let target = target_dir.join(format!("{file_id}_{safe_name}"));
        std::fs::write(&target, bytes)?;

        let entity = FileQueries::create(
            self.database.pool(),
            &file_id,
            &NewFileEntity {
                kb_id: kb.id.clone(),
                file_name: safe_name.clone(),
                file_path: target.display().to_string(),
                file_size: bytes.len() as i64,
                content_type: content_type_for(&safe_name),
            },
        )
        .await?;

        info!("Registered upload '{safe_name}' ({file_id}) for knowledge base '{}'", kb.name);
        Ok(entity)
    }

    /// Run the ingestion pipeline for one registered file.
    pub async fn ingest_file(
        &self,
        kb_id: &str,
        file_id: &str,
        force: bool,
    ) -> Result<IngestionReport> {
        let kb = self.get_kb(kb_id).await?;
        let entity = FileQueries::get(self.database.pool(), kb_id, file_id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("file '{file_id}' does not exist")))?;

        let files = vec![IngestFile {
            file_id: entity.id,
            path: PathBuf::from(entity.file_path),
        }];
        self.pipeline.ingest(&kb, &files, force).await
    }

    /// Register and ingest a set of local paths (the CLI entry point).
    pub async fn ingest_paths(
        &self,
        kb_id: &str,
        paths: &[PathBuf],
        force: bool,
    ) -> Result<IngestionReport> {
        let kb = self.get_kb(kb_id).await?;

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let file_id = Uuid::new_v4().simple().to_string();
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());
            FileQueries::create(
                self.database.pool(),
                &file_id,
                &NewFileEntity {
                    kb_id: kb.id.clone(),
                    file_name: file_name.clone(),
                    file_path: path.display().to_string(),
                    file_size: std::fs::metadata(path).map(|m| m.len() as i64).unwrap_or(0),
                    content_type: content_type_for(&file_name),
                },
            )
            .await?;
            files.push(IngestFile {
                file_id,
                path: path.clone(),
            });
        }

        self.pipeline.ingest(&kb, &files, force).await
    }

    pub async fn get_file(&self, kb_id: &str, file_id: &str) -> Result<FileEntity> {
        FileQueries::get(self.database.pool(), kb_id, file_id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("file '{file_id}' does not exist")))
    }

    pub async fn list_files(
        &self,
        kb_id: &str,
        status: Option<FileStatus>,
        name_query: Option<&str>,
        page: i64,
        size: i64,
    ) -> Result<Page<FileEntity>> {
        self.get_kb(kb_id).await?;
        FileQueries::list(self.database.pool(), kb_id, status, name_query, page, size).await
    }

    /// Remove a file's vectors and record. The vectors go first so a crash
    /// cannot leave unsearchable points referenced by a live record.
    pub async fn delete_file(&self, kb_id: &str, file_id: &str) -> Result<()> {
        let kb = self.get_kb(kb_id).await?;
        let entity = self.get_file(kb_id, file_id).await?;

        self.store
            .delete_by_payload(&kb.collection_name, "file_id", file_id)
            .await?;
        FileQueries::delete(self.database.pool(), kb_id, file_id).await?;

        // The stored upload is disposable once unregistered.
        if let Err(err) = std::fs::remove_file(&entity.file_path) {
            warn!("Could not remove stored upload {}: {err}", entity.file_path);
        }

        info!("Deleted file '{}' from knowledge base '{}'", entity.file_name, kb.name);
        Ok(())
    }

    /// Query one KB with its effective retrieval configuration merged with
    /// the caller's overrides.
    pub async fn query(
        &self,
        kb_id: &str,
        query: &str,
        overrides: &QueryOverrides,
        synonyms: &SynonymMap,
    ) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() {
            return Err(RagError::Validation("query must not be empty".into()));
        }
        if query.chars().count() > self.max_query_length {
            return Err(RagError::Validation(format!(
                "query exceeds the maximum length of {} characters",
                self.max_query_length
            )));
        }

        let kb = self.get_kb(kb_id).await?;
        let mut config = kb.retrieval_config.clone();
        if let Some(top_k) = overrides.top_k {
            if top_k == 0 {
                return Err(RagError::Validation("top_k must be positive".into()));
            }
            config.top_k = top_k;
        }
        if let Some(threshold) = overrides.similarity_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(RagError::Validation(
                    "similarity_threshold must be within 0..=1".into(),
                ));
            }
            config.similarity_threshold = threshold;
        }

        self.retrieval
            .search(&kb.collection_name, query, &config, synonyms)
            .await
    }
}

fn sanitize_file_name(file_name: &str) -> Result<String> {
    let name = std::path::Path::new(file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| RagError::Validation(format!("invalid file name '{file_name}'")))?;
    if name.is_empty() || name == "." || name == ".." {
        return Err(RagError::Validation(format!(
            "invalid file name '{file_name}'"
        )));
    }
    Ok(name)
}

fn content_type_for(file_name: &str) -> String {
    let extension = std::path::Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "txt" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => "application/octet-stream",
    }
    .to_string()
}

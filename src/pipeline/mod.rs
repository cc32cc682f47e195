
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::chunker::{Chunk, Chunker};
use crate::embedding::EmbeddingClient;
use crate::loader::LoaderRegistry;
use crate::store::{Database, FileQueries, FileStatus, KbQueries, KnowledgeBase};
use crate::vectorstore::{VectorPoint, VectorStoreClient};
use crate::Result;

/// Outcome of one ingestion run. Always produced, even when every file
/// failed; per-file problems are aggregated rather than raised.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub documents_loaded: usize,
    pub chunks_created: usize,
    pub vectors_uploaded: usize,
    pub failed_files: Vec<String>,
    pub errors: Vec<String>,
    pub total_seconds: f64,
    pub timestamp: NaiveDateTime,
}

impl IngestionReport {
    fn new() -> Self {
        Self {
            documents_loaded: 0,
            chunks_created: 0,
            vectors_uploaded: 0,
            failed_files: Vec::new(),
            errors: Vec::new(),
            total_seconds: 0.0,
            timestamp: Utc::now().naive_utc(),
        }
    }
}

/// One file to ingest, referencing its registered metadata record.
#[derive(Debug, Clone)]
pub struct IngestFile {
    pub file_id: String,
    pub path: PathBuf,
}

/// Orchestrates loader → chunker → embedder → uploader for one knowledge
/// base, with per-file status transitions and partial-failure isolation:
/// a file that fails never aborts its siblings.
pub struct IngestionPipeline {
    loaders: Arc<LoaderRegistry>,
    embedder: Arc<EmbeddingClient>,
    store: Arc<VectorStoreClient>,
    database: Database,
}

impl IngestionPipeline {
    pub fn new(
        loaders: Arc<LoaderRegistry>,
        embedder: Arc<EmbeddingClient>,
        store: Arc<VectorStoreClient>,
        database: Database,
    ) -> Self {
        Self {
            loaders,
            embedder,
            store,
            database,
        }
    }

    /// Ingest the given files into the KB's collection.
    ///
    /// With `force`, the collection is dropped and recreated first and every
    /// file is processed from scratch. Without it, a file whose mtime has
    /// not advanced past its last successful ingest is skipped.
    pub async fn ingest(
        &self,
        kb: &KnowledgeBase,
        files: &[IngestFile],
        force: bool,
    ) -> Result<IngestionReport> {
        let started = Instant::now();
        let mut report = IngestionReport::new();

        info!(
            "Ingesting {} file(s) into knowledge base '{}' (force: {force})",
            files.len(),
            kb.name
        );

        if force {
            self.store.delete_collection(&kb.collection_name).await?;
        }
        self.store
            .ensure_collection(&kb.collection_name, kb.embedding_dimension)
            .await?;

        let chunker = Chunker::new(kb.chunk_config.clone())?;

        for file in files {
            match self.process_file(kb, &chunker, file, force, &mut report).await {
                Ok(()) => {}
                Err(err) => {
                    error!("Ingestion of {} failed: {err}", file.path.display());
                    self.mark_failed(kb, file, &err.to_string()).await;
                    report.failed_files.push(file.path.display().to_string());
                    report.errors.push(format!("{}: {err}", file.path.display()));
                }
            }
        }

        report.total_seconds = started.elapsed().as_secs_f64();
        info!(
            "Ingestion into '{}' finished: {} docs, {} chunks, {} vectors, {} failed file(s) in {:.2}s",
            kb.name,
            report.documents_loaded,
            report.chunks_created,
            report.vectors_uploaded,
            report.failed_files.len(),
            report.total_seconds
        );
        Ok(report)
    }

    async fn process_file(
        &self,
        kb: &KnowledgeBase,
        chunker: &Chunker,
        file: &IngestFile,
        force: bool,
        report: &mut IngestionReport,
    ) -> Result<()> {
        let path_str = file.path.display().to_string();
        let mtime = file_mtime(&file.path);

        if !force {
            if let Some(previous) =
                FileQueries::last_success_for_path(self.database.pool(), &kb.id, &path_str).await?
            {
                if previous.id != file.file_id && mtime.is_some() && previous.source_mtime >= mtime
                {
                    debug!("Skipping {} (unchanged since last ingest)", path_str);
                    self.advance(kb, file, FileStatus::Parsing).await?;
                    self.advance(kb, file, FileStatus::Persisting).await?;
                    FileQueries::mark_succeeded(
                        self.database.pool(),
                        &kb.id,
                        &file.file_id,
                        0,
                        mtime,
                    )
                    .await?;
                    return Ok(());
                }
            }
        }

        self.advance(kb, file, FileStatus::Parsing).await?;
        let documents = self.loaders.load(&file.path)?;
        report.documents_loaded += documents.len();

        let chunks = chunker.split(&documents);
        report.chunks_created += chunks.len();

        if chunks.is_empty() {
            // An empty file ingests successfully with zero vectors.
            self.advance(kb, file, FileStatus::Persisting).await?;
            FileQueries::mark_succeeded(self.database.pool(), &kb.id, &file.file_id, 0, mtime)
                .await?;
            KbQueries::add_counts(self.database.pool(), &kb.id, documents.len() as i64, 0).await?;
            return Ok(());
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self.embedder.embed_documents(texts).await?;

        self.advance(kb, file, FileStatus::Persisting).await?;

        let points = build_points(kb, &file.file_id, &chunks, vectors);
        let uploaded = points.len();
        self.store.upsert(&kb.collection_name, points).await?;
        report.vectors_uploaded += uploaded;

        FileQueries::mark_succeeded(
            self.database.pool(),
            &kb.id,
            &file.file_id,
            chunks.len() as i64,
            mtime,
        )
        .await?;
        KbQueries::add_counts(
            self.database.pool(),
            &kb.id,
            documents.len() as i64,
            chunks.len() as i64,
        )
        .await?;

        debug!(
            "Ingested {}: {} document(s), {} chunk(s)",
            path_str,
            documents.len(),
            chunks.len()
        );
        Ok(())
    }

    async fn advance(&self, kb: &KnowledgeBase, file: &IngestFile, status: FileStatus) -> Result<()> {
        FileQueries::update_status(self.database.pool(), &kb.id, &file.file_id, status, None)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, kb: &KnowledgeBase, file: &IngestFile, reason: &str) {
        let result = FileQueries::update_status(
            self.database.pool(),
            &kb.id,
            &file.file_id,
            FileStatus::Failed,
            Some(reason),
        )
        .await;
        if let Err(err) = result {
            error!(
                "Could not mark {} as failed: {err}",
                file.path.display()
            );
        }
    }
}

fn build_points(
    kb: &KnowledgeBase,
    file_id: &str,
    chunks: &[Chunk],
    vectors: Vec<Vec<f32>>,
) -> Vec<VectorPoint> {
    chunks
        .iter()
        .zip(vectors)
        .map(|(chunk, vector)| {
            let mut payload = chunk.metadata.clone();
            payload.insert("text".to_string(), json!(chunk.content));
            payload.insert("file_id".to_string(), json!(file_id));
            payload.insert("kb_id".to_string(), json!(kb.id));
            VectorPoint {
                id: Uuid::new_v4(),
                vector,
                payload,
            }
        })
        .collect()
}

fn file_mtime(path: &std::path::Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let since_epoch = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(since_epoch.as_secs() as i64)
}

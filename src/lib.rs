use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Loader error: {0}")]
    Loader(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for RagError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                RagError::Conflict(err.to_string())
            }
            sqlx::Error::RowNotFound => RagError::NotFound(err.to_string()),
            _ => RagError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RagError {
    fn from(err: serde_json::Error) -> Self {
        RagError::Internal(format!("JSON serialization failed: {err}"))
    }
}

pub mod agent;
pub mod api;
pub mod chunker;
pub mod commands;
pub mod config;
pub mod embedding;
pub mod flowlog;
pub mod kb;
pub mod loader;
pub mod pipeline;
pub mod retrieval;
pub mod store;
pub mod vectorstore;

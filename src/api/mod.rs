
use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::agent::{ChatMessage, ChatOptions, RagAgent, SearchKnowledgeBaseTool};
use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::flowlog::FlowLogger;
use crate::kb::{KbManager, QueryOverrides};
use crate::loader::LoaderRegistry;
use crate::pipeline::IngestionPipeline;
use crate::retrieval::{RetrievalEngine, SearchHit, SynonymMap};
use crate::store::{
    Database, FileEntity, FileStatus, KnowledgeBase, KnowledgeBaseUpdate, NewKnowledgeBase, Page,
};
use crate::vectorstore::VectorStoreClient;
use crate::{RagError, Result};

/// Shared state behind every route handler. Clients are process-wide
/// singletons created once at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<KbManager>,
    pub agent: Arc<RagAgent>,
    pub llm: Arc<crate::agent::LlmClient>,
    pub store: Arc<VectorStoreClient>,
    pub embedder: Arc<EmbeddingClient>,
    pub flow: FlowLogger,
    /// Bounded ingestion worker pool.
    ingest_pool: Arc<Semaphore>,
    /// Per-session locks so two chats for one session never overlap.
    session_locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

/// Wire up every component from configuration. `init at startup, close at
/// shutdown`: the returned state owns all shared clients.
pub async fn build_state(config: Config) -> Result<AppState> {
    let database = Database::new(&config.database_path()).await?;
    let embedder = Arc::new(EmbeddingClient::new(&config.embedding)?);
    let store = Arc::new(VectorStoreClient::new(&config.vector_store)?);
    let llm = Arc::new(crate::agent::LlmClient::new(&config.llm)?);

    let pipeline = Arc::new(IngestionPipeline::new(
        Arc::new(LoaderRegistry::new(config.limits.max_file_size_bytes)),
        embedder.clone(),
        store.clone(),
        database.clone(),
    ));
    let retrieval = Arc::new(RetrievalEngine::new(embedder.clone(), store.clone()));
    let manager = Arc::new(KbManager::new(
        database,
        store.clone(),
        pipeline,
        retrieval.clone(),
        &config,
    ));

    let flow = FlowLogger::new(
        &config.flow_log_path(),
        config.flow_log.detail_level,
        config.flow_log.queue_capacity,
    )?;

    let search_tool = Arc::new(SearchKnowledgeBaseTool::new(
        manager.clone(),
        retrieval,
        config.vector_store.default_collection.clone(),
        config.retrieval.clone(),
        SynonymMap::new(),
    ));
    let agent = Arc::new(RagAgent::new(
        llm.clone(),
        vec![search_tool],
        flow.clone(),
        config.limits.max_query_length,
    ));

    let ingest_pool = Arc::new(Semaphore::new(config.limits.ingest_worker_pool));

    Ok(AppState {
        config: Arc::new(config),
        manager,
        agent,
        llm,
        store,
        embedder,
        flow,
        ingest_pool,
        session_locks: Arc::new(Mutex::new(HashMap::new())),
    })
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/chat", post(handle_chat))
        .route("/api/v1/health", get(handle_health))
        .route(
            "/api/v1/knowledge-bases",
            get(handle_list_kbs).post(handle_create_kb),
        )
        .route(
            "/api/v1/knowledge-bases/{id}",
            get(handle_get_kb).put(handle_update_kb).delete(handle_delete_kb),
        )
        .route(
            "/api/v1/knowledge-bases/{id}/files",
            get(handle_list_files).post(handle_upload_files),
        )
        .route(
            "/api/v1/knowledge-bases/{id}/files/{fid}",
            axum::routing::delete(handle_delete_file),
        )
        .route("/api/v1/knowledge-bases/{id}/query", post(handle_query_kb))
        .layer(DefaultBodyLimit::max(110 * 1024 * 1024))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the process is terminated.
pub async fn serve(state: AppState) -> Result<()> {
    let bind = state.config.server.bind.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| RagError::Config(format!("cannot bind {bind}: {e}")))?;
    info!("Serving API on http://{bind}");
    axum::serve(listener, app)
        .await
        .map_err(|e| RagError::Internal(format!("server error: {e}")))?;
    Ok(())
}

// ============ Error mapping ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct ApiError(RagError);

impl From<RagError> for ApiError {
    fn from(err: RagError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            RagError::Validation(_) | RagError::Loader(_) => {
                (StatusCode::BAD_REQUEST, "bad_request")
            }
            RagError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            RagError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            RagError::Embedding(_) | RagError::VectorStore(_) | RagError::Llm(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            RagError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Internal error: {}", self.0);
        }

        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============ Chat ============

#[derive(Deserialize)]
struct ChatRequest {
    query: String,
    #[serde(default)]
    history: Vec<ChatMessage>,
    #[serde(default)]
    kb_id: Option<String>,
    #[serde(default)]
    session_id: Option<Uuid>,
}

#[derive(Serialize)]
struct ChatResponse {
    answer: String,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Json<ChatResponse>> {
    // Serialize chats per session; distinct sessions proceed concurrently.
    let session_lock = match request.session_id {
        Some(session_id) => {
            let mut locks = state.session_locks.lock().await;
            Some(
                locks
                    .entry(session_id)
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone(),
            )
        }
        None => None,
    };
    let _guard = match &session_lock {
        Some(lock) => Some(lock.lock().await),
        None => None,
    };

    let answer = state
        .agent
        .chat(
            &request.query,
            ChatOptions {
                history: request.history,
                kb_id: request.kb_id,
                session_id: request.session_id,
                cancellation: None,
            },
        )
        .await?;

    Ok(Json(ChatResponse { answer }))
}

// ============ Health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    components: HealthComponents,
}

#[derive(Serialize)]
struct HealthComponents {
    llm: String,
    vectorstore: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let llm_up = state.llm.check_available().await;
    let vectorstore_up = state.store.healthy().await;

    let up_or_down = |up: bool| if up { "up" } else { "down" }.to_string();
    Json(HealthResponse {
        status: if llm_up && vectorstore_up {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        components: HealthComponents {
            llm: up_or_down(llm_up),
            vectorstore: up_or_down(vectorstore_up),
        },
    })
}

// ============ Knowledge bases ============

#[derive(Deserialize)]
struct PageParams {
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_size")]
    size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_size() -> i64 {
    20
}

async fn handle_list_kbs(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<Page<KnowledgeBase>>> {
    Ok(Json(state.manager.list_kbs(params.page, params.size).await?))
}

async fn handle_create_kb(
    State(state): State<AppState>,
    Json(spec): Json<NewKnowledgeBase>,
) -> ApiResult<(StatusCode, Json<KnowledgeBase>)> {
    let kb = state.manager.create_kb(spec).await?;
    Ok((StatusCode::CREATED, Json(kb)))
}

async fn handle_get_kb(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<KnowledgeBase>> {
    Ok(Json(state.manager.get_kb(&id).await?))
}

async fn handle_update_kb(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<KnowledgeBaseUpdate>,
) -> ApiResult<Json<KnowledgeBase>> {
    Ok(Json(state.manager.update_kb(&id, patch).await?))
}

async fn handle_delete_kb(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.manager.delete_kb(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Files ============

#[derive(Deserialize)]
struct FileListParams {
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_size")]
    size: i64,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    query: Option<String>,
}

async fn handle_list_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<FileListParams>,
) -> ApiResult<Json<Page<FileEntity>>> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<FileStatus>)
        .transpose()?;
    let page = state
        .manager
        .list_files(&id, status, params.query.as_deref(), params.page, params.size)
        .await?;
    Ok(Json(page))
}

async fn handle_upload_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<Vec<FileEntity>>)> {
    let mut entities = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError(RagError::Validation(format!("malformed multipart body: {e}")))
    })? {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field.bytes().await.map_err(|e| {
            ApiError(RagError::Validation(format!("failed to read upload: {e}")))
        })?;
        if bytes.len() as u64 > state.config.limits.max_file_size_bytes {
            return Err(ApiError(RagError::Validation(format!(
                "{file_name} exceeds the maximum file size"
            ))));
        }

        let entity = state.manager.register_upload(&id, &file_name, &bytes).await?;
        entities.push(entity);
    }

    if entities.is_empty() {
        return Err(ApiError(RagError::Validation(
            "multipart body contains no files".into(),
        )));
    }

    // Kick off processing on the bounded worker pool; the response returns
    // immediately with the pending records.
    for entity in &entities {
        let state = state.clone();
        let kb_id = id.clone();
        let file_id = entity.id.clone();
        tokio::spawn(async move {
            let Ok(_permit) = state.ingest_pool.clone().acquire_owned().await else {
                return;
            };
            if let Err(err) = state.manager.ingest_file(&kb_id, &file_id, false).await {
                error!("Background ingestion of file {file_id} failed: {err}");
            }
        });
    }

    Ok((StatusCode::CREATED, Json(entities)))
}

async fn handle_delete_file(
    State(state): State<AppState>,
    Path((id, fid)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.manager.delete_file(&id, &fid).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Query ============

#[derive(Deserialize)]
struct KbQueryRequest {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    similarity_threshold: Option<f32>,
}

async fn handle_query_kb(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<KbQueryRequest>,
) -> ApiResult<Json<Vec<SearchHit>>> {
    let hits = state
        .manager
        .query(
            &id,
            &request.query,
            &QueryOverrides {
                top_k: request.top_k,
                similarity_threshold: request.similarity_threshold,
            },
            &SynonymMap::new(),
        )
        .await?;
    Ok(Json(hits))
}

//! Dieah Sync Server
//!
//! HTTP API for the coordination engine.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dieah_sync::{
    agent::{Agent, AgentConfig, AgentStatus},
    config::Config,
    conflict::{Conflict, ManualChoice},
    coordinator::{Coordinator, CoordinatorStatus, MemoryAllocation, MemorySlice, MemoryUpdate, NewMemory},
    error::{Error, ErrorKind},
    memory::{MemoryRecord, MemoryType},
    retrieval::ScoredMemory,
    sharing::SharingRule,
    slice::QueryFilter,
    sync::{MultiSyncReport, SyncReport, SyncStatistics},
};

/// Application state shared across handlers
struct AppState {
    coordinator: Coordinator,
}

type SharedState = Arc<AppState>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;
    tracing::info!("Starting Dieah Sync Server on port {}", config.server_port);
    tracing::info!("Data directory: {:?}", config.data_dir);

    let port = config.server_port;
    let coordinator = Coordinator::open(config)?;
    let background = coordinator.start_background_sync();

    let state = Arc::new(AppState { coordinator });

    // Build router
    let app = Router::new()
        // Health and reporting
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/statistics", get(statistics))
        .route("/allocation/:user_id", get(allocation))
        // Agents
        .route("/agents", get(list_agents).post(register_agent))
        .route("/agents/:agent_id", get(get_agent).delete(deregister_agent))
        .route("/agents/:agent_id/status", post(set_agent_status))
        // Memories
        .route("/agents/:agent_id/memories", post(store_memory))
        .route(
            "/agents/:agent_id/memories/:memory_id",
            get(get_memory).patch(update_memory).delete(delete_memory),
        )
        .route("/agents/:agent_id/search", post(search_memories))
        .route("/agents/:agent_id/slice/:user_id", get(memory_slice))
        // Sync and conflicts
        .route("/agents/:agent_id/sync", post(sync_agent))
        .route("/sync", post(sync_all))
        .route("/conflicts", get(list_conflicts))
        .route("/conflicts/:conflict_id/resolve", post(resolve_conflict))
        .route("/sharing-rules", get(sharing_rules).put(reload_sharing_rules))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("Server listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    background.shutdown().await;
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

// === Errors ===

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AlreadyRegistered => StatusCode::CONFLICT,
            ErrorKind::AgentInactive => StatusCode::FORBIDDEN,
            ErrorKind::ResourceBusy => StatusCode::LOCKED,
            ErrorKind::Timeout => StatusCode::REQUEST_TIMEOUT,
            ErrorKind::InvalidToken => StatusCode::FORBIDDEN,
            ErrorKind::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::ConflictPending => StatusCode::CONFLICT,
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::Config | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(kind = %kind, error = %self.0, "Request failed");
        }

        let body = ErrorResponse {
            error: kind.to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// === Handlers ===

async fn health() -> &'static str {
    "ok"
}

async fn status(State(state): State<SharedState>) -> ApiResult<CoordinatorStatus> {
    Ok(Json(state.coordinator.get_coordinator_status()?))
}

async fn statistics(State(state): State<SharedState>) -> Json<SyncStatistics> {
    Json(state.coordinator.get_sync_statistics())
}

async fn allocation(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
) -> ApiResult<MemoryAllocation> {
    Ok(Json(state.coordinator.get_memory_allocation(&user_id)?))
}

// --- Agent handlers ---

async fn list_agents(State(state): State<SharedState>) -> Json<Vec<Agent>> {
    Json(state.coordinator.list_agents())
}

async fn register_agent(
    State(state): State<SharedState>,
    Json(config): Json<AgentConfig>,
) -> Result<(StatusCode, Json<Agent>), ApiError> {
    let agent = state.coordinator.register_agent(config)?;
    Ok((StatusCode::CREATED, Json(agent)))
}

async fn get_agent(
    State(state): State<SharedState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Agent> {
    Ok(Json(state.coordinator.get_agent(&agent_id)?))
}

async fn deregister_agent(
    State(state): State<SharedState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Agent> {
    Ok(Json(state.coordinator.deregister_agent(&agent_id)?))
}

#[derive(Debug, Deserialize)]
struct AgentStatusRequest {
    status: AgentStatus,
}

async fn set_agent_status(
    State(state): State<SharedState>,
    Path(agent_id): Path<String>,
    Json(req): Json<AgentStatusRequest>,
) -> ApiResult<Agent> {
    Ok(Json(state.coordinator.set_agent_status(&agent_id, req.status)?))
}

// --- Memory handlers ---

#[derive(Debug, Deserialize)]
struct StoreMemoryRequest {
    user_id: String,
    #[serde(flatten)]
    memory: NewMemory,
}

#[derive(Debug, Serialize)]
struct StoreMemoryResponse {
    memory_id: String,
}

async fn store_memory(
    State(state): State<SharedState>,
    Path(agent_id): Path<String>,
    Json(req): Json<StoreMemoryRequest>,
) -> Result<(StatusCode, Json<StoreMemoryResponse>), ApiError> {
    let memory_id = state
        .coordinator
        .store_agent_memory(&agent_id, &req.user_id, req.memory)
        .await?;
    Ok((StatusCode::CREATED, Json(StoreMemoryResponse { memory_id })))
}

async fn get_memory(
    State(state): State<SharedState>,
    Path((agent_id, memory_id)): Path<(String, String)>,
) -> ApiResult<MemoryResponse> {
    let record = state.coordinator.get_agent_memory(&agent_id, &memory_id)?;
    Ok(Json(MemoryResponse::from(record)))
}

async fn update_memory(
    State(state): State<SharedState>,
    Path((agent_id, memory_id)): Path<(String, String)>,
    Json(update): Json<MemoryUpdate>,
) -> ApiResult<MemoryResponse> {
    let record = state
        .coordinator
        .update_agent_memory(&agent_id, &memory_id, update)
        .await?;
    Ok(Json(MemoryResponse::from(record)))
}

async fn delete_memory(
    State(state): State<SharedState>,
    Path((agent_id, memory_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .coordinator
        .delete_agent_memory(&agent_id, &memory_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    user_id: String,
    query: String,
    #[serde(default = "default_true")]
    include_shared: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    memories: Vec<ScoredMemory>,
    formatted_context: String,
}

async fn search_memories(
    State(state): State<SharedState>,
    Path(agent_id): Path<String>,
    Json(req): Json<SearchRequest>,
) -> ApiResult<SearchResponse> {
    let results = state
        .coordinator
        .search_agent_memories(&agent_id, &req.user_id, &req.query, req.include_shared)
        .await?;
    Ok(Json(SearchResponse {
        formatted_context: results.format_for_prompt(),
        memories: results.memories,
    }))
}

#[derive(Debug, Deserialize)]
struct SliceQuery {
    memory_type: Option<String>,
    category: Option<String>,
    session_id: Option<String>,
    include_shared: Option<bool>,
    include_deleted: Option<bool>,
}

async fn memory_slice(
    State(state): State<SharedState>,
    Path((agent_id, user_id)): Path<(String, String)>,
    Query(query): Query<SliceQuery>,
) -> ApiResult<MemorySlice> {
    let mut filter = QueryFilter::new()
        .include_shared(query.include_shared.unwrap_or(true))
        .include_deleted(query.include_deleted.unwrap_or(false));
    if let Some(memory_type) = query.memory_type {
        filter = filter.memory_type(memory_type.parse::<MemoryType>()?);
    }
    if let Some(category) = query.category {
        filter = filter.category(category);
    }
    if let Some(session_id) = query.session_id {
        filter = filter.session(session_id);
    }

    Ok(Json(
        state
            .coordinator
            .get_agent_memory_slice(&agent_id, &user_id, &filter)?,
    ))
}

// --- Sync handlers ---

#[derive(Debug, Default, Deserialize)]
struct SyncRequest {
    #[serde(default)]
    force_sync: bool,
}

async fn sync_agent(
    State(state): State<SharedState>,
    Path(agent_id): Path<String>,
    body: Option<Json<SyncRequest>>,
) -> ApiResult<SyncReport> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(
        state
            .coordinator
            .sync_agent_memories(&agent_id, req.force_sync)
            .await?,
    ))
}

async fn sync_all(
    State(state): State<SharedState>,
    body: Option<Json<SyncRequest>>,
) -> Json<MultiSyncReport> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    Json(state.coordinator.sync_all_agents(req.force_sync).await)
}

#[derive(Debug, Deserialize)]
struct ConflictQuery {
    pending_only: Option<bool>,
}

async fn list_conflicts(
    State(state): State<SharedState>,
    Query(query): Query<ConflictQuery>,
) -> Json<Vec<Conflict>> {
    Json(
        state
            .coordinator
            .list_conflicts(query.pending_only.unwrap_or(false)),
    )
}

async fn resolve_conflict(
    State(state): State<SharedState>,
    Path(conflict_id): Path<String>,
    Json(choice): Json<ManualChoice>,
) -> ApiResult<Conflict> {
    Ok(Json(
        state
            .coordinator
            .resolve_conflict(&conflict_id, choice)
            .await?,
    ))
}

async fn sharing_rules(State(state): State<SharedState>) -> ApiResult<Vec<SharingRule>> {
    Ok(Json(state.coordinator.sharing_rules()?))
}

async fn reload_sharing_rules(
    State(state): State<SharedState>,
    Json(rules): Json<Vec<SharingRule>>,
) -> Result<StatusCode, ApiError> {
    state.coordinator.reload_sharing_rules(rules)?;
    Ok(StatusCode::NO_CONTENT)
}

// === Response types ===

/// A record plus the agents holding a shadow of it, which the record's own
/// serialization leaves out
#[derive(Debug, Serialize)]
struct MemoryResponse {
    #[serde(flatten)]
    record: MemoryRecord,
    shared_with: Vec<String>,
}

impl From<MemoryRecord> for MemoryResponse {
    fn from(mut record: MemoryRecord) -> Self {
        let shared_with = std::mem::take(&mut record.shared_with).into_iter().collect();
        Self {
            record,
            shared_with,
        }
    }
}

//! HTTP surface over the orchestrator.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

use crate::agent::{AgentHealth, AgentSummary, RequestContext};
use crate::error::PlatformError;
use crate::events::PlatformEvent;
use crate::memory::tier_manager::RecallHit;
use crate::memory::{MemoryItem, Tier, TierStats};
use crate::middleware::{
    create_body_limit_layer, create_cors_layer, create_rate_limiter, rate_limit_middleware,
    request_logging_middleware, security_headers_middleware,
};
use crate::monitoring::AgentMetricsSnapshot;
use crate::orchestrator::{Orchestrator, RememberOptions, Response as InvokeResponse, Task};
use crate::resilience::{CircuitSnapshot, CircuitState};
use crate::settings::Settings;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub started: Instant,
}

/// `PlatformError` rendered as a JSON body with its mapped status.
pub struct ApiError(PlatformError);

impl From<PlatformError> for ApiError {
    fn from(err: PlatformError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        let body = json!({ "error": self.0.kind(), "message": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    agent_count: usize,
    open_circuits: usize,
    pending_retries: usize,
    memory: TierStats,
    agents: BTreeMap<String, AgentHealth>,
}

#[derive(Deserialize)]
struct CreateAgentRequest {
    id: String,
    #[serde(rename = "type")]
    type_tag: String,
    #[serde(default)]
    config: Value,
}

#[derive(Deserialize)]
struct InvokeRequest {
    #[serde(flatten)]
    task: Task,
    #[serde(default)]
    context: RequestContext,
}

#[derive(Deserialize)]
struct RememberRequest {
    content: String,
    #[serde(default)]
    context: RequestContext,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    tier: Option<Tier>,
    #[serde(default)]
    ttl_secs: Option<u64>,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

#[derive(Serialize)]
struct RememberResponse {
    memory_id: String,
}

#[derive(Deserialize)]
struct RecallRequest {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    context: RequestContext,
}

#[derive(Deserialize)]
struct EventsQuery {
    #[serde(default = "default_event_limit")]
    limit: usize,
}

fn default_event_limit() -> usize {
    100
}

pub fn create_router(state: AppState) -> Router {
    let security = state.orchestrator.settings().security.clone();

    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/agents", get(list_agents).post(create_agent))
        .route("/invoke", post(invoke))
        .route("/memory", post(remember))
        .route("/memory/recall", post(recall))
        .route("/memory/:id", get(get_memory).delete(delete_memory))
        .route("/circuits", get(list_circuits))
        .route("/circuits/:agent_id", get(circuit_status))
        .route("/metrics/agents", get(agent_metrics))
        .route("/events", get(recent_events))
        .with_state(state);

    if security.enable_rate_limiting {
        app = app.layer(middleware::from_fn_with_state(
            create_rate_limiter(&security),
            rate_limit_middleware,
        ));
    }

    app.layer(middleware::from_fn(security_headers_middleware))
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(create_cors_layer(&security))
        .layer(create_body_limit_layer(security.max_request_size_mb))
        .layer(TraceLayer::new_for_http())
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let orchestrator = &state.orchestrator;
    let open_circuits = orchestrator
        .circuits()
        .iter()
        .filter(|c| c.state != CircuitState::Closed)
        .count();

    let agents = orchestrator.agent_health().await;
    let degraded = open_circuits > 0 || agents.values().any(|h| !h.is_healthy());

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "healthy" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started.elapsed().as_secs(),
        agent_count: orchestrator.list_agents().len(),
        open_circuits,
        pending_retries: orchestrator.pending_retries().len(),
        memory: orchestrator.memory_stats(),
        agents,
    })
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentSummary>> {
    Json(state.orchestrator.list_agents())
}

#[instrument(skip(state, request), fields(agent_id = %request.id))]
async fn create_agent(
    State(state): State<AppState>,
    Json(request): Json<CreateAgentRequest>,
) -> ApiResult<(StatusCode, Json<AgentSummary>)> {
    let summary = state
        .orchestrator
        .create_agent(&request.type_tag, &request.id, &request.config)?;
    info!("Created agent {} of type {}", request.id, request.type_tag);
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn invoke(
    State(state): State<AppState>,
    Json(request): Json<InvokeRequest>,
) -> ApiResult<Json<InvokeResponse>> {
    let response = state.orchestrator.invoke(request.task, request.context).await?;
    Ok(Json(response))
}

async fn remember(
    State(state): State<AppState>,
    Json(request): Json<RememberRequest>,
) -> ApiResult<(StatusCode, Json<RememberResponse>)> {
    let options = RememberOptions {
        metadata: request.metadata,
        tier: request.tier,
        ttl: request.ttl_secs.map(Duration::from_secs),
        embedding: request.embedding,
    };
    let memory_id = state
        .orchestrator
        .remember_with(&request.context, &request.content, options)
        .await?;
    Ok((StatusCode::CREATED, Json(RememberResponse { memory_id })))
}

async fn recall(
    State(state): State<AppState>,
    Json(request): Json<RecallRequest>,
) -> ApiResult<Json<Vec<RecallHit>>> {
    let hits = state
        .orchestrator
        .recall_scored(&request.context, &request.query, request.top_k)
        .await?;
    Ok(Json(hits))
}

async fn get_memory(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<MemoryItem>> {
    Ok(Json(state.orchestrator.get_memory(&id).await?))
}

async fn delete_memory(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.orchestrator.delete_memory(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_circuits(State(state): State<AppState>) -> Json<Vec<CircuitSnapshot>> {
    Json(state.orchestrator.circuits())
}

async fn circuit_status(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<CircuitSnapshot>> {
    Ok(Json(state.orchestrator.get_circuit_status(&agent_id)?))
}

async fn agent_metrics(State(state): State<AppState>) -> Json<Vec<AgentMetricsSnapshot>> {
    Json(state.orchestrator.agent_metrics())
}

async fn recent_events(State(state): State<AppState>, Query(query): Query<EventsQuery>) -> Json<Vec<PlatformEvent>> {
    Json(state.orchestrator.recent_events(query.limit))
}

/// Start the HTTP server and run until SIGINT/SIGTERM.
pub async fn serve(settings: Settings, addr: Option<SocketAddr>) -> Result<()> {
    let addr = match addr {
        Some(addr) => addr,
        None => format!("{}:{}", settings.server.host, settings.server.port)
            .parse()
            .context("Invalid server address")?,
    };

    let orchestrator = Arc::new(
        Orchestrator::new(settings)
            .await
            .context("Orchestrator initialization failed")?,
    );
    let app = create_router(AppState {
        orchestrator: orchestrator.clone(),
        started: Instant::now(),
    });

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("HTTP server listening on {}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await;

    orchestrator.shutdown().await;
    served.context("HTTP server error")?;
    info!("HTTP server shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down gracefully"),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully"),
    }
}

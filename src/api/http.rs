//! HTTP API Server
//!
//! Management endpoints for the backend set, plus a JSON SQL endpoint that
//! runs statements through the cluster like any other client.

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cluster::DatabaseCluster;
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::executor::Value;
use crate::proxy::StatementResult;
use crate::state::{BackendStatus, SyncRecord};
use crate::sync::{SyncReport, SyncStrategy};

/// Shared application state
pub struct AppState {
    /// Node ID
    pub node_id: String,
    /// The cluster served by this node
    pub cluster: Arc<DatabaseCluster>,
    /// When the server was created
    pub started: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, node_id: String, cluster: Arc<DatabaseCluster>) -> Self {
        let state = Arc::new(AppState {
            node_id,
            cluster,
            started: Instant::now(),
        });
        Self { config, state }
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Create the router
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/backends", get(handle_list_backends))
            .route("/backends/:name", get(handle_backend))
            .route("/backends/:name/deactivate", post(handle_deactivate))
            .route("/backends/:name/activate", post(handle_activate))
            .route("/backends/:name/resync", post(handle_resync))
            .route("/backends/:name/plan", get(handle_plan))
            .route("/sql", post(handle_sql))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state));

        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        self.serve(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves
    pub async fn serve(&self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub cluster_id: String,
    pub active_backends: usize,
    pub total_backends: usize,
}

/// Status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub cluster_id: String,
    pub uptime_seconds: u64,
    pub backends: Vec<BackendHealth>,
}

/// A backend's state and whether it answers its health check
#[derive(Debug, Serialize, Deserialize)]
pub struct BackendHealth {
    #[serde(flatten)]
    pub status: BackendStatus,
    pub reachable: bool,
}

/// One backend with its synchronization history
#[derive(Debug, Serialize, Deserialize)]
pub struct BackendDetail {
    #[serde(flatten)]
    pub status: BackendStatus,
    pub last_sync: Option<SyncRecord>,
}

/// Deactivation response
#[derive(Debug, Serialize, Deserialize)]
pub struct DeactivateResponse {
    pub backend: String,
    /// `false` when the backend was not active
    pub deactivated: bool,
}

/// Activation response
#[derive(Debug, Serialize, Deserialize)]
pub struct ActivateResponse {
    pub backend: String,
    /// `None` when the backend was already active
    pub report: Option<SyncReport>,
}

/// Resynchronization request
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ResyncRequest {
    /// Defaults to the configured strategy
    pub strategy: Option<SyncStrategy>,
    /// Defaults to the primary, else the first active backend
    pub reference: Option<String>,
}

/// Plan query
#[derive(Debug, Deserialize)]
pub struct PlanQuery {
    pub reference: Option<String>,
}

/// SQL request
#[derive(Debug, Serialize, Deserialize)]
pub struct SqlRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
}

/// SQL response
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SqlResponse {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
    },
    Update {
        rows_affected: u64,
        last_insert_id: Option<i64>,
        generated_key_divergent: bool,
    },
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(err: Error) -> Response {
    let (status, code) = match &err {
        Error::BackendNotFound(_) => (StatusCode::NOT_FOUND, "backend_not_found"),
        Error::LastActiveBackend(_) => (StatusCode::CONFLICT, "last_active_backend"),
        Error::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
        Error::State(_) => (StatusCode::CONFLICT, "invalid_state"),
        Error::Synchronization { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "synchronization_failed"),
        Error::Schema(_) => (StatusCode::CONFLICT, "schema_mismatch"),
        Error::LockTimeout { .. } => (StatusCode::SERVICE_UNAVAILABLE, "lock_timeout"),
        Error::NoActiveBackend => (StatusCode::SERVICE_UNAVAILABLE, "no_active_backend"),
        Error::QueryExecution(_) => (StatusCode::BAD_REQUEST, "query_failed"),
        Error::ClusterExhausted { .. } => (StatusCode::BAD_REQUEST, "cluster_exhausted"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let backends = state.cluster.list_backends().await;
    let active = state.cluster.registry().active_backends().await.len();
    let response = HealthResponse {
        healthy: active > 0,
        node_id: state.node_id.clone(),
        cluster_id: state.cluster.cluster_id().to_string(),
        active_backends: active,
        total_backends: backends.len(),
    };
    let status = if response.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let reachable = state.cluster.health().await;
    let backends = state
        .cluster
        .list_backends()
        .await
        .into_iter()
        .map(|status| BackendHealth {
            reachable: reachable
                .iter()
                .any(|(name, alive)| *name == status.name && *alive),
            status,
        })
        .collect();

    Json(StatusResponse {
        node_id: state.node_id.clone(),
        cluster_id: state.cluster.cluster_id().to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
        backends,
    })
}

async fn handle_list_backends(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.cluster.list_backends().await)
}

async fn handle_backend(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    let status = state
        .cluster
        .list_backends()
        .await
        .into_iter()
        .find(|b| b.name == name);
    let Some(status) = status else {
        return error_response(Error::BackendNotFound(name));
    };
    match state.cluster.last_sync(&name).await {
        Ok(last_sync) => Json(BackendDetail { status, last_sync }).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_deactivate(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.cluster.deactivate(&name).await {
        Ok(deactivated) => Json(DeactivateResponse {
            backend: name,
            deactivated,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_activate(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.cluster.activate(&name).await {
        Ok(report) => Json(ActivateResponse {
            backend: name,
            report,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_resync(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Option<Json<ResyncRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let strategy = request
        .strategy
        .unwrap_or_else(|| state.cluster.default_strategy());

    let result = match &request.reference {
        Some(reference) => {
            state
                .cluster
                .resynchronize_from(&name, reference, strategy)
                .await
        }
        None => state.cluster.resynchronize(&name, strategy).await,
    };
    match result {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_plan(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<PlanQuery>,
) -> Response {
    match state.cluster.plan(&name, query.reference.as_deref()).await {
        Ok(plan) => Json(plan).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_sql(State(state): State<Arc<AppState>>, Json(req): Json<SqlRequest>) -> Response {
    let params: Vec<Value> = req.params.iter().map(json_to_value).collect();
    let mut session = state.cluster.session();
    tracing::debug!("HTTP SQL: {}", req.sql);

    match session.run(&req.sql, &params).await {
        Ok(StatementResult::Rows(rows)) => Json(SqlResponse::Rows {
            columns: rows.columns,
            rows: rows
                .rows
                .iter()
                .map(|row| row.iter().map(value_to_json).collect())
                .collect(),
        })
        .into_response(),
        Ok(StatementResult::Update(result)) => Json(SqlResponse::Update {
            rows_affected: result.rows_affected,
            last_insert_id: result.last_insert_id,
            generated_key_divergent: result.generated_key_divergent,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

// ============ Helper Functions ============

fn json_to_value(v: &serde_json::Value) -> Value {
    match v {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(0.0)),
        },
        serde_json::Value::String(s) => Value::String(s.clone()),
        other => Value::String(other.to_string()),
    }
}

fn value_to_json(v: &Value) -> serde_json::Value {
    match v {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Value::from(*f),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => {
            serde_json::Value::String(b.iter().map(|byte| format!("{:02x}", byte)).collect())
        }
    }
}

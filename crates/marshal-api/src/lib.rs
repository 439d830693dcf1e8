//! HTTP API for the marshal task store.
//!
//! Serves any [`TaskStore`] as JSON so that schedulers on other hosts can
//! share it through `marshal_runner::http_store`. Every mutating route takes
//! the version the caller last observed.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use marshal_core::error::StoreError;
use marshal_core::project::{NewProject, Project, ProjectId};
use marshal_core::store::{ClaimRequest, NewTask, TaskFilter, TaskStore};
use marshal_core::task::{Task, TaskId};
use marshal_core::wire::{ErrorBody, MutationBody, RejectBody};
use serde::Serialize;
use std::path::Path as FsPath;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared application state for API handlers.
pub struct ApiState {
    pub store: Arc<dyn TaskStore>,
}

impl ApiState {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Serve the redb database at `db_path`.
    pub fn open(db_path: &FsPath) -> anyhow::Result<Self> {
        let store = marshal_db::RedbStore::open(db_path)?;
        Ok(Self::new(Arc::new(store)))
    }
}

pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_check))
        .route("/api/v1/tasks", post(create_task))
        .route("/api/v1/tasks/search", post(search_tasks))
        .route("/api/v1/tasks/claim", post(claim_task))
        .route("/api/v1/tasks/{id}", get(get_task))
        .route("/api/v1/tasks/{id}/submit", post(submit_task))
        .route("/api/v1/tasks/{id}/accept", post(accept_task))
        .route("/api/v1/tasks/{id}/reject", post(reject_task))
        .route("/api/v1/tasks/{id}/update", post(update_task))
        .route("/api/v1/projects", get(list_projects).post(create_project))
        .route("/api/v1/projects/{id}", get(get_project))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the API server; stops accepting connections when `shutdown` fires
/// and finishes in-flight requests.
pub async fn serve(
    state: Arc<ApiState>,
    bind_addr: &str,
    shutdown: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let app = api_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "starting task store API");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    tracing::info!("task store API shut down");
    Ok(())
}

// ─── Error type ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct AppError(StoreError);

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            StoreError::VersionConflict { .. } | StoreError::DuplicateClaim { .. } => {
                StatusCode::CONFLICT
            }
            StoreError::NotFound(_) | StoreError::ProjectNotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            StoreError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = ?self.0, "store request failed");
        } else {
            tracing::debug!(kind = self.0.kind(), error = %self.0, "store request refused");
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        Self(e)
    }
}

// ─── Health ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ─── Tasks ───────────────────────────────────────────────────────────────

async fn create_task(
    State(state): State<Arc<ApiState>>,
    Json(new): Json<NewTask>,
) -> Result<(StatusCode, Json<Task>), AppError> {
    let task = state.store.create(new).await?;
    tracing::info!(task = %task.id, queue = %task.queue, "task created via API");
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.store.get(TaskId(id)).await?))
}

async fn search_tasks(
    State(state): State<Arc<ApiState>>,
    Json(filter): Json<TaskFilter>,
) -> Result<Json<Vec<Task>>, AppError> {
    Ok(Json(state.store.list(&filter).await?))
}

/// 200 with the claimed task, or 204 when nothing is claimable.
async fn claim_task(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<ClaimRequest>,
) -> Result<Response, AppError> {
    match state.store.claim(&req).await? {
        Some(task) => Ok((StatusCode::OK, Json(task)).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn submit_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(body): Json<MutationBody>,
) -> Result<Json<Task>, AppError> {
    let task = state
        .store
        .submit(TaskId(id), body.expected_version, body.patch)
        .await?;
    Ok(Json(task))
}

async fn accept_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(body): Json<MutationBody>,
) -> Result<Json<Task>, AppError> {
    let task = state
        .store
        .accept(TaskId(id), body.expected_version, body.patch)
        .await?;
    Ok(Json(task))
}

async fn reject_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(body): Json<RejectBody>,
) -> Result<Json<Task>, AppError> {
    let task = state
        .store
        .reject(TaskId(id), body.expected_version, body.feedback, body.patch)
        .await?;
    Ok(Json(task))
}

async fn update_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(body): Json<MutationBody>,
) -> Result<Json<Task>, AppError> {
    let task = state
        .store
        .update(TaskId(id), body.expected_version, body.patch)
        .await?;
    Ok(Json(task))
}

// ─── Projects ────────────────────────────────────────────────────────────

async fn create_project(
    State(state): State<Arc<ApiState>>,
    Json(new): Json<NewProject>,
) -> Result<(StatusCode, Json<Project>), AppError> {
    let project = state.store.create_project(new).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn list_projects(State(state): State<Arc<ApiState>>) -> Result<Json<Vec<Project>>, AppError> {
    Ok(Json(state.store.list_projects().await?))
}

async fn get_project(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<Project>, AppError> {
    Ok(Json(state.store.get_project(ProjectId(id)).await?))
}

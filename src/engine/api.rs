//! LiveBundle API Module
//! Dev control REST API over the update coordinator

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::engine::error::UpdateError;
use crate::engine::updater::{
    ActivePointer, BundleSource, CacheEntry, CheckOutcome, UpdateCoordinator, UpdatePhase,
    VersionId,
};

/// Runs after every check made through the API, e.g. to apply an activation policy
pub type CheckHook = Arc<dyn Fn(&CheckOutcome) -> crate::engine::Result<()> + Send + Sync>;

pub struct ApiState<S> {
    pub coordinator: Arc<UpdateCoordinator<S>>,
    pub on_checked: Option<CheckHook>,
}

impl<S> ApiState<S> {
    pub fn new(coordinator: Arc<UpdateCoordinator<S>>) -> Self {
        Self {
            coordinator,
            on_checked: None,
        }
    }

    pub fn with_check_hook(mut self, hook: CheckHook) -> Self {
        self.on_checked = Some(hook);
        self
    }
}

impl<S> Clone for ApiState<S> {
    fn clone(&self) -> Self {
        Self {
            coordinator: Arc::clone(&self.coordinator),
            on_checked: self.on_checked.clone(),
        }
    }
}

pub fn create_router<S: BundleSource + 'static>(state: ApiState<S>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/status", get(status::<S>))
        .route("/api/check", post(check::<S>))
        .route("/api/activate/{version}", post(activate::<S>))
        .route("/api/rollback", post(rollback::<S>))
        .route("/api/reset", post(reset::<S>))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Update errors as JSON bodies with a status that fits the failure
pub struct ApiError {
    status: StatusCode,
    error: UpdateError,
}

impl ApiError {
    fn bad_request(error: UpdateError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error,
        }
    }
}

impl From<UpdateError> for ApiError {
    fn from(error: UpdateError) -> Self {
        let status = match &error {
            UpdateError::Busy => StatusCode::CONFLICT,
            UpdateError::NotFound(_) | UpdateError::Activation { .. } => StatusCode::NOT_FOUND,
            UpdateError::InvalidLocation(_) => StatusCode::BAD_REQUEST,
            UpdateError::Network(_)
            | UpdateError::ChecksumMismatch { .. }
            | UpdateError::InvalidMetadata(_)
            | UpdateError::InvalidSignature => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, error }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.error.code(),
            "message": self.error.to_string(),
        }));
        (self.status, body).into_response()
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub phase: UpdatePhase,
    pub pointer: ActivePointer,
    pub active: Option<CacheEntry>,
    pub cached: Vec<VersionId>,
}

async fn status<S: BundleSource + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<StatusResponse>, ApiError> {
    let coordinator = &state.coordinator;
    let cached = coordinator
        .cache()
        .list()?
        .into_iter()
        .map(|e| e.version_id)
        .collect();
    Ok(Json(StatusResponse {
        phase: coordinator.phase(),
        pointer: coordinator.pointer(),
        active: coordinator.active_entry(),
        cached,
    }))
}

async fn check<S: BundleSource + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Response, ApiError> {
    let outcome = state.coordinator.check_for_update().await?;
    if let Some(hook) = &state.on_checked {
        hook(&outcome)?;
    }
    let status = match outcome {
        CheckOutcome::Busy => StatusCode::CONFLICT,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)).into_response())
}

async fn activate<S: BundleSource + 'static>(
    State(state): State<ApiState<S>>,
    Path(version): Path<String>,
) -> Result<Json<ActivePointer>, ApiError> {
    let version = VersionId::new(&version).map_err(ApiError::bad_request)?;
    state.coordinator.activate(&version)?;
    Ok(Json(state.coordinator.pointer()))
}

async fn rollback<S: BundleSource + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<ActivePointer>, ApiError> {
    state.coordinator.rollback()?;
    Ok(Json(state.coordinator.pointer()))
}

async fn reset<S: BundleSource + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<ActivePointer>, ApiError> {
    state.coordinator.reset()?;
    Ok(Json(state.coordinator.pointer()))
}

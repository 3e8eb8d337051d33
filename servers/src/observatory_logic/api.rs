//! Administrative HTTP API over the subscription store and the registry.
//!
//! - `POST /observers`: create and register a subscription.
//! - `GET /observers`: list every persisted subscription.
//! - `GET /observers/{id}`: one subscription.
//! - `DELETE /observers/{id}`: invalidate and deregister.
//! - `GET /health`: liveness.

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use lib_observatory::{
    FilterError, RegistryError, StoreError, Subscription, SubscriptionDetail, SubscriptionId, SubscriptionStore,
    compile,
};

use super::state::AppState;

/// Everything a request can fail with.
#[derive(Debug)]
pub enum AppError {
    /// The request body is not a subscription.
    InvalidBody(String),
    /// The filter carries a pattern that does not compile.
    InvalidFilter(FilterError),
    /// No such subscription.
    NotFound(SubscriptionId),
    /// The subscription was already invalidated.
    AlreadyInvalid(SubscriptionId),
    /// The store failed.
    Store(StoreError),
    /// The registry refused the operation.
    Registry(RegistryError),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => AppError::NotFound(id),
            other => AppError::Store(other),
        }
    }
}

impl From<RegistryError> for AppError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => AppError::NotFound(id),
            RegistryError::AlreadyInvalid(id) => AppError::AlreadyInvalid(id),
            RegistryError::Filter { source, .. } => AppError::InvalidFilter(source),
            RegistryError::Store(e) => e.into(),
            other => AppError::Registry(other),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::InvalidBody(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            AppError::InvalidBody(_) => (StatusCode::BAD_REQUEST, "InvalidRequestBody"),
            AppError::InvalidFilter(_) => (StatusCode::BAD_REQUEST, "InvalidFilter"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            AppError::AlreadyInvalid(_) => (StatusCode::CONFLICT, "AlreadyInvalid"),
            AppError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "StoreError"),
            AppError::Registry(_) => (StatusCode::INTERNAL_SERVER_ERROR, "RegistryError"),
        };
        if status.is_server_error() {
            error!("{}", self);
        } else {
            warn!("{}", self);
        }
        let body = json!({
            "error_type": error_type,
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::InvalidBody(s) => write!(f, "Invalid request body: {}", s),
            AppError::InvalidFilter(e) => write!(f, "Invalid filter: {}", e),
            AppError::NotFound(id) => write!(f, "Subscription {} not found", id),
            AppError::AlreadyInvalid(id) => write!(f, "Subscription {} is already invalid", id),
            AppError::Store(e) => write!(f, "Store error: {}", e),
            AppError::Registry(e) => write!(f, "Registry error: {}", e),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::InvalidFilter(e) => Some(e),
            AppError::Store(e) => Some(e),
            AppError::Registry(e) => Some(e),
            AppError::InvalidBody(_) | AppError::NotFound(_) | AppError::AlreadyInvalid(_) => None,
        }
    }
}

async fn create_observer(
    State(state): State<AppState>,
    payload: Result<Json<SubscriptionDetail>, JsonRejection>,
) -> Result<(StatusCode, Json<Subscription>), AppError> {
    let Json(detail) = payload?;
    // Reject bad patterns before anything is persisted.
    compile(&detail.filter).map_err(AppError::InvalidFilter)?;

    let id = state.store.create(detail).await?;
    let subscription = state.store.get(id).await?;
    if let Err(e) = state.registry.add(subscription.clone()).await {
        // Persisted but not running: leave no valid orphan behind.
        if let Err(store_err) = state.store.invalidate(id).await {
            error!("Subscription {} could not be rolled back: {}", id, store_err);
        }
        return Err(e.into());
    }

    info!("Created subscription {} for {}", id, subscription.detail.hook_url);
    Ok((StatusCode::CREATED, Json(subscription)))
}

async fn list_observers(State(state): State<AppState>) -> Result<Json<Vec<Subscription>>, AppError> {
    Ok(Json(state.store.list_all().await?))
}

async fn get_observer(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
) -> Result<Json<Subscription>, AppError> {
    Ok(Json(state.store.get(id).await?))
}

async fn delete_observer(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
) -> Result<Json<Subscription>, AppError> {
    let exit = match state.registry.remove(id).await {
        Ok(exit) => exit,
        // Not running: the store decides between 404, 409 and a plain invalidation.
        Err(RegistryError::NotFound(_)) => return invalidate_unregistered(&state, id).await.map(Json),
        Err(e) => return Err(e.into()),
    };
    tokio::spawn(async move {
        if let Some(report) = exit.wait().await {
            info!(
                "Subscriber {} drained: {} events, {} matched, {} delivered",
                id, report.processed, report.matched, report.delivered
            );
        }
    });
    Ok(Json(state.store.get(id).await?))
}

/// Handles DELETE of a stored subscription with no running agent, e.g. one
/// skipped at startup because its filter does not compile.
async fn invalidate_unregistered(state: &AppState, id: SubscriptionId) -> Result<Subscription, AppError> {
    let subscription = state.store.get(id).await?;
    if !subscription.valid {
        return Err(AppError::AlreadyInvalid(id));
    }
    state.store.invalidate(id).await?;
    info!("Invalidated unregistered subscription {}", id);
    Ok(state.store.get(id).await?)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "subscribers": state.registry.len().await,
    }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/observers", get(list_observers).post(create_observer))
        .route("/observers/{id}", get(get_observer).delete(delete_observer))
        .route("/health", get(health))
        .with_state(state)
}

/// Serves the API on `port` until the shutdown signal fires.
pub async fn run(port: u16, state: AppState, mut shutdown_rx: broadcast::Receiver<()>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Admin API listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("Admin API shutting down.");
        })
        .await?;
    Ok(())
}

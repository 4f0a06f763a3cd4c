//! HTTP control plane: bootstrap, subscriptions and health.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `POST /acquire` | Filtered snapshot as `{nodes, rels}` |
//! | `POST /acquire-stream` | Same snapshot as NDJSON, one entity per line |
//! | `POST /subscription` | Announce a query, then return its snapshot |
//! | `DELETE /subscription/{queryNodeId}/{queryId}` | Announce query removal |
//! | `POST /deprovision` | Forget every partition cursor and the sequence checkpoint |
//! | `GET /health` | Supervisor and worker states, 503 unless running |
//!
//! Subscription control events go to the same `{sourceId}-change` topic as
//! data changes and are stamped from the same sequence generator, so
//! consumers see them ordered with the data.

use crate::bootstrap::BootstrapService;
use crate::cursor::CursorStore;
use crate::error::ReactivatorError;
use crate::metrics;
use crate::model::{
    now_ms, BootstrapSnapshot, MappedChange, SubscriptionRequest, CONTROL_DB, TABLE_SUBSCRIPTION,
};
use crate::publisher::ChangePublisher;
use crate::sequence::{SequenceGenerator, SEQUENCE_KEY};
use crate::supervisor::{HealthMonitor, SupervisorHealth};
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::{stream, StreamExt, TryStreamExt};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    source_id: Arc<str>,
    sequence: Arc<SequenceGenerator>,
    publisher: Arc<dyn ChangePublisher>,
    bootstrap: BootstrapService,
    health: HealthMonitor,
    persisted: Option<PersistedState>,
}

/// Keys a deprovision clears.
#[derive(Clone)]
struct PersistedState {
    cursors: Arc<dyn CursorStore>,
    keys: Arc<[String]>,
}

impl AppState {
    pub fn new(
        source_id: impl Into<Arc<str>>,
        sequence: Arc<SequenceGenerator>,
        publisher: Arc<dyn ChangePublisher>,
        bootstrap: BootstrapService,
        health: HealthMonitor,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            sequence,
            publisher,
            bootstrap,
            health,
            persisted: None,
        }
    }

    /// Let `POST /deprovision` clear the cursors of `partitions` and the
    /// sequence checkpoint. Without this the route is a no-op.
    pub fn with_deprovision(mut self, cursors: Arc<dyn CursorStore>, partitions: &[String]) -> Self {
        let keys = partitions
            .iter()
            .cloned()
            .chain(std::iter::once(SEQUENCE_KEY.to_string()))
            .collect();
        self.persisted = Some(PersistedState { cursors, keys });
        self
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Handler error rendered as `{"error": ...}` with a mapped status.
#[derive(Debug)]
pub struct ApiError(ReactivatorError);

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            ReactivatorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ReactivatorError::Bootstrap(_)
            | ReactivatorError::Source { .. }
            | ReactivatorError::Auth(_) => StatusCode::BAD_GATEWAY,
            ReactivatorError::Publish { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ReactivatorError> for ApiError {
    fn from(err: ReactivatorError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(ReactivatorError::InvalidRequest(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (code, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/acquire", post(acquire))
        .route("/acquire-stream", post(acquire_stream))
        .route("/subscription", post(subscribe))
        .route("/subscription/{query_node_id}/{query_id}", delete(unsubscribe))
        .route("/deprovision", post(deprovision))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP server listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

fn parse_request(
    payload: std::result::Result<Json<SubscriptionRequest>, JsonRejection>,
) -> ApiResult<SubscriptionRequest> {
    let Json(request) = payload?;
    request.validate()?;
    Ok(request)
}

#[tracing::instrument(skip_all)]
async fn acquire(
    State(state): State<AppState>,
    payload: std::result::Result<Json<SubscriptionRequest>, JsonRejection>,
) -> ApiResult<Json<BootstrapSnapshot>> {
    let request = parse_request(payload)?;
    Ok(Json(state.bootstrap.acquire(&request).await?))
}

#[tracing::instrument(skip_all)]
async fn acquire_stream(
    State(state): State<AppState>,
    payload: std::result::Result<Json<SubscriptionRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let request = parse_request(payload)?;
    let mut entities = state
        .bootstrap
        .stream(request.node_labels.clone(), request.rel_labels.clone());

    // Pull the first entity before committing to a 200 so an unreachable
    // source still gets a proper error status.
    let first = entities.try_next().await?;

    let query_id = request.query_id;
    let lines = stream::iter(first.map(Ok))
        .chain(entities)
        .map(|item| -> std::result::Result<Vec<u8>, String> {
            let entity = item.map_err(|e| e.to_string())?;
            let mut line = serde_json::to_vec(&entity).map_err(|e| e.to_string())?;
            line.push(b'\n');
            Ok(line)
        })
        .inspect_err(move |e| warn!(query_id = %query_id, error = %e, "Snapshot stream aborted"));

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

#[tracing::instrument(skip_all)]
async fn subscribe(
    State(state): State<AppState>,
    payload: std::result::Result<Json<SubscriptionRequest>, JsonRejection>,
) -> ApiResult<Json<BootstrapSnapshot>> {
    let request = parse_request(payload)?;
    info!(query_id = %request.query_id, query_node_id = %request.query_node_id, "New subscription");

    let change = MappedChange::insert(request.control_entity(), now_ms()).with_table(TABLE_SUBSCRIPTION);
    publish_control(&state, change).await?;

    Ok(Json(state.bootstrap.acquire(&request).await?))
}

#[tracing::instrument(skip_all, fields(%query_node_id, %query_id))]
async fn unsubscribe(
    State(state): State<AppState>,
    Path((query_node_id, query_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let request = SubscriptionRequest {
        query_id,
        query_node_id,
        ..Default::default()
    };
    request.validate()?;

    let change = MappedChange::delete(request.control_entity(), now_ms()).with_table(TABLE_SUBSCRIPTION);
    publish_control(&state, change).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(skip_all)]
async fn deprovision(State(state): State<AppState>) -> ApiResult<StatusCode> {
    let Some(persisted) = &state.persisted else {
        info!("Deprovision requested, no persisted state attached");
        return Ok(StatusCode::NO_CONTENT);
    };
    for key in persisted.keys.iter() {
        persisted.cursors.delete(key).await?;
    }
    info!(keys = persisted.keys.len(), "Deprovisioned, persisted state cleared");
    Ok(StatusCode::NO_CONTENT)
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<SupervisorHealth>) {
    let health = state.health.health();
    let code = if health.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(health))
}

async fn publish_control(state: &AppState, change: MappedChange) -> crate::error::Result<()> {
    let op = change.op();
    let sequence = state.sequence.next().await;
    let notification = change.into_notification(sequence, CONTROL_DB, TABLE_SUBSCRIPTION, None);
    state.publisher.publish(&state.source_id, &[notification]).await?;
    metrics::record_control_event(&op.to_string());
    info!(op = %op, sequence, "Published subscription control event");
    Ok(())
}

//! Operator HTTP API.
//!
//! Requires the `http` feature. Uses axum for routing.
//!
//! ## Routes
//!
//! - `GET /health`: `{ "ok": bool, "halted": [...] }`, 503 while any partition is halted.
//! - `GET /partitions`: status of every partition of both consumers.
//! - `POST /partitions/:consumer/:partition/remediate`: body is a `Remediation`,
//!   e.g. `{ "action": "reset_checkpoint", "sequence": 4 }`.
//! - `GET /checkpoints/:consumer`: stored checkpoints of one consumer.
//! - `GET /dead-letters`: every dead letter.
//! - `POST /dead-letters/:consumer/:partition/drain`: remove and return one partition's dead letters.
//!
//! Consumer calls block, so handlers run them on the blocking pool.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::info;

use crate::config::HttpConfig;
use crate::consumer::{ConsumerError, Remediation};
use crate::error::Error;
use crate::pipeline::PipelineHandle;
use crate::stream::PartitionId;

/// Build an axum `Router` over a running pipeline.
pub fn router(handle: Arc<PipelineHandle>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/partitions", get(partitions_handler))
        .route(
            "/partitions/:consumer/:partition/remediate",
            post(remediate_handler),
        )
        .route("/checkpoints/:consumer", get(checkpoints_handler))
        .route("/dead-letters", get(dead_letters_handler))
        .route(
            "/dead-letters/:consumer/:partition/drain",
            post(drain_handler),
        )
        .with_state(handle)
}

/// Serve the operator API on `config.addr`.
pub async fn serve(handle: Arc<PipelineHandle>, config: &HttpConfig) -> Result<(), std::io::Error> {
    let app = router(handle);
    let listener = tokio::net::TcpListener::bind(config.addr.as_str()).await?;
    info!(addr = %config.addr, "operator api listening");
    axum::serve(listener, app).await
}

fn error_response(error: Error) -> Response {
    let status = match &error {
        Error::UnknownConsumer(_) => StatusCode::NOT_FOUND,
        Error::Consumer(ConsumerError::InvalidRemediation(_)) => StatusCode::CONFLICT,
        Error::Consumer(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        Error::Sink(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}

async fn blocking<T, F>(handle: Arc<PipelineHandle>, call: F) -> Response
where
    T: serde::Serialize + Send + 'static,
    F: FnOnce(&PipelineHandle) -> Result<T, Error> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || call(&handle)).await {
        Ok(Ok(value)) => (StatusCode::OK, Json(value)).into_response(),
        Ok(Err(e)) => error_response(e),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn health_handler(State(handle): State<Arc<PipelineHandle>>) -> impl IntoResponse {
    let halted: Vec<_> = handle
        .status()
        .into_iter()
        .filter(|s| s.state.is_halted())
        .map(|s| json!({ "consumer": s.consumer, "partition": s.partition, "state": s.state }))
        .collect();
    let status = if halted.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "ok": halted.is_empty(), "halted": halted })))
}

async fn partitions_handler(State(handle): State<Arc<PipelineHandle>>) -> impl IntoResponse {
    Json(handle.status())
}

async fn remediate_handler(
    State(handle): State<Arc<PipelineHandle>>,
    Path((consumer, partition)): Path<(String, u32)>,
    Json(remediation): Json<Remediation>,
) -> Response {
    blocking(handle, move |handle| {
        let state = handle.remediate(&consumer, PartitionId(partition), remediation)?;
        Ok(json!({ "consumer": consumer, "partition": partition, "state": state }))
    })
    .await
}

async fn checkpoints_handler(
    State(handle): State<Arc<PipelineHandle>>,
    Path(consumer): Path<String>,
) -> Response {
    blocking(handle, move |handle| handle.checkpoints(&consumer)).await
}

async fn dead_letters_handler(State(handle): State<Arc<PipelineHandle>>) -> Response {
    blocking(handle, |handle| handle.dead_letters()).await
}

async fn drain_handler(
    State(handle): State<Arc<PipelineHandle>>,
    Path((consumer, partition)): Path<(String, u32)>,
) -> Response {
    blocking(handle, move |handle| {
        handle.drain_dead_letters(&consumer, PartitionId(partition))
    })
    .await
}

//! Shard node HTTP API.
//!
//! Multipart upload, streaming download with checksum headers, idempotent
//! delete, sidecar listing, and the health/info/metrics probes.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

use crate::common::metrics::ShardMetrics;
use crate::common::{trace, Error};
use crate::shard::store::{parse_shard_type, PutShardRequest, ShardStore};

const MAX_SHARD_BYTES: usize = 256 * 1024 * 1024;

/// Shared state for the shard HTTP handlers
#[derive(Clone)]
pub struct ShardState {
    pub store: Arc<ShardStore>,
    pub metrics: Arc<ShardMetrics>,
    pub node_id: String,
}

pub fn router(state: ShardState) -> Router {
    Router::new()
        .route("/shard/upload", post(upload_shard))
        .route("/shard/download/:shard_id", get(download_shard))
        .route("/shard/delete/:shard_id", delete(delete_shard))
        .route("/shard/list", get(list_shards))
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/metrics", get(metrics))
        .layer(DefaultBodyLimit::max(MAX_SHARD_BYTES))
        .layer(middleware::from_fn(trace::request_tracing))
        .with_state(state)
}

fn error_response(err: &Error) -> Response {
    (
        err.to_http_status(),
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

async fn upload_shard(State(state): State<ShardState>, mut multipart: Multipart) -> Response {
    let start = Instant::now();

    let mut shard_id = None;
    let mut bucket = None;
    let mut object_key = None;
    let mut shard_type = None;
    let mut index = None;
    let mut total_shards = None;
    let mut data: Option<Vec<u8>> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return error_response(&Error::InvalidRequest(format!(
                    "malformed multipart body: {}",
                    e
                )))
            }
        };

        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "shard_id" => shard_id = field.text().await.ok(),
            "bucket" => bucket = field.text().await.ok(),
            "object_key" => object_key = field.text().await.ok(),
            "shard_type" => shard_type = field.text().await.ok(),
            "index" => index = field.text().await.ok(),
            "total_shards" => total_shards = field.text().await.ok(),
            "shard" => data = field.bytes().await.ok().map(|b| b.to_vec()),
            other => {
                tracing::debug!(field = other, "ignoring unknown upload field");
            }
        }
    }

    let (Some(shard_id), Some(bucket), Some(object_key), Some(data)) =
        (shard_id, bucket, object_key, data)
    else {
        return error_response(&Error::InvalidRequest(
            "missing required fields: shard_id, bucket, object_key, shard".into(),
        ));
    };

    let shard_type = match shard_type.as_deref().map(parse_shard_type) {
        Some(Ok(t)) => t,
        Some(Err(e)) => return error_response(&e),
        None => return error_response(&Error::InvalidRequest("missing shard_type".into())),
    };

    let Some(Ok(index)) = index.as_deref().map(str::parse::<usize>) else {
        return error_response(&Error::InvalidRequest("invalid index".into()));
    };
    let Some(Ok(total_shards)) = total_shards.as_deref().map(str::parse::<usize>) else {
        return error_response(&Error::InvalidRequest("invalid total_shards".into()));
    };

    let request = PutShardRequest {
        shard_id,
        bucket,
        object_key,
        shard_type,
        index,
        total_shards,
    };

    match state.store.put(&request, &data) {
        Ok(descriptor) => {
            state.metrics.bytes_stored_total.add(descriptor.size);
            state
                .metrics
                .upload_duration
                .observe(start.elapsed().as_secs_f64() * 1000.0);

            (
                StatusCode::CREATED,
                Json(json!({
                    "shardId": descriptor.shard_id,
                    "size": descriptor.size,
                    "checksum": descriptor.checksum,
                })),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(shard = %request.shard_id, "shard write failed: {}", e);
            error_response(&e)
        }
    }
}

#[derive(Debug, Deserialize)]
struct ShardScope {
    bucket: String,
    object: String,
}

async fn download_shard(
    State(state): State<ShardState>,
    Path(shard_id): Path<String>,
    Query(scope): Query<ShardScope>,
) -> Response {
    let start = Instant::now();

    match state.store.get(&scope.bucket, &scope.object, &shard_id) {
        Ok((data, descriptor)) => {
            state.metrics.bytes_served_total.add(data.len() as u64);
            state
                .metrics
                .download_duration
                .observe(start.elapsed().as_secs_f64() * 1000.0);

            (
                [
                    (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                    (
                        header::HeaderName::from_static("x-shard-checksum"),
                        descriptor.checksum.clone(),
                    ),
                    (
                        header::HeaderName::from_static("x-shard-type"),
                        descriptor.shard_type.as_str().to_string(),
                    ),
                ],
                data,
            )
                .into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn delete_shard(
    State(state): State<ShardState>,
    Path(shard_id): Path<String>,
    Query(scope): Query<ShardScope>,
) -> Response {
    match state.store.delete(&scope.bucket, &scope.object, &shard_id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct ListScope {
    #[serde(default)]
    bucket: Option<String>,
    #[serde(default)]
    object: Option<String>,
}

async fn list_shards(State(state): State<ShardState>, Query(scope): Query<ListScope>) -> Response {
    let result = match (scope.bucket, scope.object) {
        (Some(bucket), Some(object)) => state.store.list_object(&bucket, &object),
        _ => state.store.list_all(),
    };

    match result {
        Ok(shards) => Json(json!({
            "count": shards.len(),
            "shards": shards,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn health(State(state): State<ShardState>) -> Response {
    match state.store.writable() {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("data dir not writable: {}", e),
        )
            .into_response(),
    }
}

async fn info(State(state): State<ShardState>) -> Response {
    Json(json!({
        "nodeId": state.node_id,
        "tier": state.store.tier(),
        "dataDir": state.store.root().display().to_string(),
        "shardCount": state.metrics.shard_count.get(),
        "uptimeSecs": state.metrics.uptime_seconds(),
    }))
    .into_response()
}

async fn metrics(State(state): State<ShardState>) -> Response {
    (StatusCode::OK, state.metrics.to_prometheus()).into_response()
}

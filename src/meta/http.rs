//! Metadata HTTP API.
//!
//! Translates REST verbs into catalog commands. Writes route to the raft
//! leader: a follower answers `307` with the leader's address in `Location`,
//! `503` when no leader is known, `504` when the apply deadline passes, and
//! `409` when the FSM rejects the command. Reads are served from the local
//! applied state and are eventually consistent on followers.
//!
//! The raft peer RPC endpoints (`/raft/*`) share this listener.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::common::metrics::MetaMetrics;
use crate::common::{trace, validate_bucket_name, validate_object_key, Error};
use crate::meta::fsm::MetadataFsm;
use crate::meta::nodes::{NodeDirectory, StorageNode};
use crate::meta::raft::RaftNode;
use crate::meta::rpc::{
    AppendRequest, InstallSnapshotRequest, JoinRequest, VoteRequest,
};
use crate::meta::types::{Command, Permission, ShardInfo, Tier};

/// Shared state for the metadata HTTP handlers
#[derive(Clone)]
pub struct MetaState {
    pub fsm: Arc<RwLock<MetadataFsm>>,
    pub raft: Arc<RaftNode>,
    pub nodes: Arc<NodeDirectory>,
    pub metrics: Arc<MetaMetrics>,
    pub data_dir: PathBuf,
    pub apply_timeout: Duration,
}

/// Build the metadata router with all public and raft endpoints
pub fn router(state: MetaState) -> Router {
    Router::new()
        .route("/buckets", post(create_bucket).get(list_buckets))
        .route("/buckets/:bucket", get(get_bucket).delete(delete_bucket))
        .route(
            "/buckets/:bucket/objects",
            post(create_object).get(list_objects),
        )
        .route(
            "/buckets/:bucket/objects/*key",
            get(get_object)
                .patch(update_object)
                .delete(delete_object)
                .post(touch_object),
        )
        .route("/auth/login", post(login))
        .route("/cluster/status", get(cluster_status))
        .route("/cluster/leader", get(cluster_leader))
        .route("/nodes", get(list_nodes))
        .route("/nodes/register", post(register_node))
        .route("/raft/vote", post(raft_vote))
        .route("/raft/append", post(raft_append))
        .route("/raft/snapshot", post(raft_snapshot))
        .route("/raft/join", post(raft_join))
        .route("/raft/timeout-now", post(raft_timeout_now))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            track_metrics,
        ))
        .layer(middleware::from_fn(trace::request_tracing))
        .with_state(state)
}

async fn track_metrics(
    State(state): State<MetaState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    let response = next.run(request).await;
    state
        .metrics
        .record_request(start.elapsed(), !response.status().is_server_error());
    response
}

fn error_response(err: &Error) -> Response {
    (
        err.to_http_status(),
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

fn redirect_to_leader(leader: &str, path: &str) -> Response {
    let location = format!("{}{}", leader.trim_end_matches('/'), path);
    (
        StatusCode::TEMPORARY_REDIRECT,
        [(header::LOCATION, location)],
    )
        .into_response()
}

/// Route a command through consensus, translating the failure modes into
/// the HTTP response discipline above.
async fn submit(state: &MetaState, cmd: &Command, path: &str) -> Result<(), Response> {
    if !state.raft.is_leader() {
        return Err(match state.raft.leader_addr() {
            Some(leader) => redirect_to_leader(&leader, path),
            None => error_response(&Error::NoLeader),
        });
    }

    let bytes = serde_json::to_vec(cmd).expect("commands always encode");
    match state.raft.apply(bytes, state.apply_timeout).await {
        Ok(()) => Ok(()),
        Err(Error::NotLeader(leader)) => Err(redirect_to_leader(&leader, path)),
        Err(e) => Err(error_response(&e)),
    }
}

// === Bucket operations ===

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBucketRequest {
    name: String,
    owner: String,
    #[serde(default)]
    acl: BTreeMap<String, Permission>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

async fn create_bucket(
    State(state): State<MetaState>,
    Json(req): Json<CreateBucketRequest>,
) -> Response {
    if let Err(e) = validate_bucket_name(&req.name) {
        return error_response(&e);
    }

    let cmd = Command::CreateBucket {
        name: req.name.clone(),
        owner: req.owner,
        acl: req.acl,
        metadata: req.metadata,
    };

    match submit(&state, &cmd, "/buckets").await {
        Ok(()) => (
            StatusCode::CREATED,
            Json(json!({ "name": req.name, "message": "bucket created" })),
        )
            .into_response(),
        Err(resp) => resp,
    }
}

async fn delete_bucket(State(state): State<MetaState>, Path(bucket): Path<String>) -> Response {
    let cmd = Command::DeleteBucket {
        name: bucket.clone(),
    };

    match submit(&state, &cmd, &format!("/buckets/{}", bucket)).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(resp) => resp,
    }
}

async fn get_bucket(State(state): State<MetaState>, Path(bucket): Path<String>) -> Response {
    let fsm = state.fsm.read().unwrap();
    match fsm.get_bucket(&bucket) {
        Some(meta) => Json(meta.clone()).into_response(),
        None => error_response(&Error::NotFound(format!("bucket: {}", bucket))),
    }
}

async fn list_buckets(State(state): State<MetaState>) -> Response {
    let fsm = state.fsm.read().unwrap();
    let buckets: Vec<_> = fsm.list_buckets().into_iter().cloned().collect();
    Json(buckets).into_response()
}

// === Object operations ===

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateObjectRequest {
    object_key: String,
    size: u64,
    tier: Tier,
    shards: Vec<ShardInfo>,
    encryption_key_ref: String,
    checksum: String,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

async fn create_object(
    State(state): State<MetaState>,
    Path(bucket): Path<String>,
    Json(req): Json<CreateObjectRequest>,
) -> Response {
    if let Err(e) = validate_object_key(&req.object_key) {
        return error_response(&e);
    }

    // Advisory pre-check for the documented 404; the FSM remains the
    // authority at apply time
    if state.fsm.read().unwrap().get_bucket(&bucket).is_none() {
        return error_response(&Error::NotFound(format!("bucket: {}", bucket)));
    }

    let path = format!("/buckets/{}/objects", bucket);
    let cmd = Command::CreateObject {
        bucket_name: bucket.clone(),
        object_key: req.object_key.clone(),
        size: req.size,
        tier: req.tier,
        shards: req.shards,
        encryption_key_ref: req.encryption_key_ref,
        checksum: req.checksum,
        content_type: req
            .content_type
            .unwrap_or_else(|| "application/octet-stream".to_string()),
        metadata: req.metadata,
    };

    match submit(&state, &cmd, &path).await {
        Ok(()) => (
            StatusCode::CREATED,
            Json(json!({
                "bucket": bucket,
                "key": req.object_key,
                "message": "object created"
            })),
        )
            .into_response(),
        Err(resp) => resp,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateObjectRequest {
    #[serde(default)]
    tier: Option<Tier>,
    #[serde(default)]
    last_accessed: Option<u64>,
    #[serde(default)]
    shards: Option<Vec<ShardInfo>>,
}

async fn update_object(
    State(state): State<MetaState>,
    Path((bucket, key)): Path<(String, String)>,
    Json(req): Json<UpdateObjectRequest>,
) -> Response {
    if state.fsm.read().unwrap().get_object(&bucket, &key).is_none() {
        return error_response(&Error::NotFound(format!("object: {}/{}", bucket, key)));
    }

    let path = format!("/buckets/{}/objects/{}", bucket, crate::common::encode_path(&key));
    let cmd = Command::UpdateObject {
        bucket_name: bucket,
        object_key: key,
        tier: req.tier,
        last_accessed: req.last_accessed,
        shards: req.shards,
    };

    match submit(&state, &cmd, &path).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(resp) => resp,
    }
}

async fn delete_object(
    State(state): State<MetaState>,
    Path((bucket, key)): Path<(String, String)>,
) -> Response {
    let path = format!("/buckets/{}/objects/{}", bucket, crate::common::encode_path(&key));
    let cmd = Command::DeleteObject {
        bucket_name: bucket,
        object_key: key,
    };

    match submit(&state, &cmd, &path).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(resp) => resp,
    }
}

async fn get_object(
    State(state): State<MetaState>,
    Path((bucket, key)): Path<(String, String)>,
) -> Response {
    let fsm = state.fsm.read().unwrap();
    match fsm.get_object(&bucket, &key) {
        Some(meta) => Json(meta.clone()).into_response(),
        None => error_response(&Error::NotFound(format!("object: {}/{}", bucket, key))),
    }
}

/// Record a read hit: consensus-replicated so replay stays deterministic
async fn touch_object(
    State(state): State<MetaState>,
    Path((bucket, key)): Path<(String, String)>,
) -> Response {
    if state.fsm.read().unwrap().get_object(&bucket, &key).is_none() {
        return error_response(&Error::NotFound(format!("object: {}/{}", bucket, key)));
    }

    let path = format!("/buckets/{}/objects/{}", bucket, crate::common::encode_path(&key));
    let cmd = Command::UpdateAccessTime {
        bucket_name: bucket,
        object_key: key,
    };

    match submit(&state, &cmd, &path).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(resp) => resp,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListObjectsQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    start_after: Option<String>,
}

async fn list_objects(
    State(state): State<MetaState>,
    Path(bucket): Path<String>,
    Query(query): Query<ListObjectsQuery>,
) -> Response {
    let fsm = state.fsm.read().unwrap();
    if fsm.get_bucket(&bucket).is_none() {
        return error_response(&Error::NotFound(format!("bucket: {}", bucket)));
    }

    let limit = query.limit.unwrap_or(1000).min(10_000);
    let objects: Vec<_> = fsm
        .list_objects(&bucket, query.start_after.as_deref(), limit)
        .into_iter()
        .cloned()
        .collect();
    Json(objects).into_response()
}

// === Authentication ===

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

/// Development-grade token issuance so the CLI `login` flow works against a
/// bare cluster. The issued token is opaque and not validated by this
/// service; production deployments front the API with their identity
/// provider and point the CLI's auth URL at it instead.
async fn login(Json(req): Json<LoginRequest>) -> Response {
    if req.username.is_empty() || req.password.is_empty() {
        return error_response(&Error::InvalidRequest(
            "username and password are required".into(),
        ));
    }

    let token = uuid::Uuid::new_v4().simple().to_string();
    tracing::info!(user = %req.username, "issued development token");

    Json(json!({
        "token": token,
        "username": req.username,
    }))
    .into_response()
}

// === Cluster introspection ===

async fn cluster_status(State(state): State<MetaState>) -> Response {
    Json(state.raft.status()).into_response()
}

async fn cluster_leader(State(state): State<MetaState>) -> Response {
    Json(json!({
        "leader": state.raft.leader_addr(),
        "state": state.raft.state().to_string(),
    }))
    .into_response()
}

// === Storage-node directory ===

async fn register_node(
    State(state): State<MetaState>,
    Json(node): Json<StorageNode>,
) -> Response {
    state.nodes.register(node);
    StatusCode::NO_CONTENT.into_response()
}

async fn list_nodes(State(state): State<MetaState>) -> Response {
    state.nodes.evict_expired();
    Json(state.nodes.alive()).into_response()
}

// === Raft peer RPC ===

async fn raft_vote(State(state): State<MetaState>, Json(req): Json<VoteRequest>) -> Response {
    Json(state.raft.handle_vote(req)).into_response()
}

async fn raft_append(State(state): State<MetaState>, Json(req): Json<AppendRequest>) -> Response {
    Json(state.raft.handle_append(req)).into_response()
}

async fn raft_snapshot(
    State(state): State<MetaState>,
    Json(req): Json<InstallSnapshotRequest>,
) -> Response {
    Json(state.raft.handle_install_snapshot(req)).into_response()
}

async fn raft_join(State(state): State<MetaState>, Json(req): Json<JoinRequest>) -> Response {
    Json(state.raft.handle_join(req).await).into_response()
}

async fn raft_timeout_now(State(state): State<MetaState>) -> Response {
    state.raft.handle_timeout_now();
    StatusCode::NO_CONTENT.into_response()
}

// === Probes ===

async fn health(State(state): State<MetaState>) -> Response {
    let sentinel = state.data_dir.join(".health");
    match std::fs::write(&sentinel, b"ok").and_then(|_| std::fs::remove_file(&sentinel)) {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("data dir not writable: {}", e),
        )
            .into_response(),
    }
}

async fn metrics(State(state): State<MetaState>) -> Response {
    (StatusCode::OK, state.metrics.to_prometheus()).into_response()
}

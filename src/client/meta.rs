//! Typed client for the metadata HTTP API.
//!
//! Redirects are handled explicitly: a write landing on a follower comes
//! back `307` with the leader in `Location`, and the client retries there.
//! Automatic redirect following is disabled so the retry is visible and
//! bounded.

use reqwest::{header, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::common::{Error, Result, RuntimeConfig};
use crate::meta::nodes::StorageNode;
use crate::meta::types::{BucketMeta, ObjectMeta, ShardInfo, Tier};

const MAX_REDIRECTS: usize = 3;

/// Body for `POST /buckets/{bucket}/objects`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewObject {
    pub object_key: String,
    pub size: u64,
    pub tier: Tier,
    pub shards: Vec<ShardInfo>,
    pub encryption_key_ref: String,
    pub checksum: String,
    pub content_type: String,
}

/// Body for `PATCH /buckets/{bucket}/objects/{key}`
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shards: Option<Vec<ShardInfo>>,
}

/// Leader/health view from `GET /cluster/status`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatusView {
    pub state: String,
    pub leader: Option<String>,
    pub last_index: u64,
    pub applied_index: u64,
}

#[derive(Clone)]
pub struct MetaClient {
    base: String,
    http: reqwest::Client,
    token: Option<String>,
}

impl MetaClient {
    pub fn new(base: &str) -> Self {
        Self::with_runtime(base, &RuntimeConfig::default())
    }

    pub fn with_runtime(base: &str, runtime: &RuntimeConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(runtime.request_timeout)
            .connect_timeout(runtime.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client");

        Self {
            base: base.trim_end_matches('/').to_string(),
            http,
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let mut url = format!("{}{}", self.base, path);

        for _ in 0..=MAX_REDIRECTS {
            let mut request = self.http.request(method.clone(), &url);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = &body {
                request = request.json(body);
            }

            let response = request.send().await?;
            let status = response.status();

            if status == StatusCode::TEMPORARY_REDIRECT {
                let Some(location) = response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    return Err(Error::Http("redirect without Location header".into()));
                };
                tracing::debug!(to = location, "following leader redirect");
                url = location.to_string();
                continue;
            }

            if status.is_success() {
                return Ok(response);
            }

            let detail = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or_else(|| status.to_string());

            return Err(match status {
                StatusCode::NOT_FOUND => Error::NotFound(detail),
                StatusCode::CONFLICT => Error::StateConflict(detail),
                StatusCode::BAD_REQUEST => Error::InvalidRequest(detail),
                StatusCode::GATEWAY_TIMEOUT => Error::ApplyTimeout(Duration::from_secs(10)),
                StatusCode::SERVICE_UNAVAILABLE => Error::UpstreamUnavailable(detail),
                _ => Error::Http(format!("{}: {}", status, detail)),
            });
        }

        Err(Error::Http("too many leader redirects".into()))
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        Ok(self.send(method, path, body).await?.json().await?)
    }

    // === Buckets ===

    pub async fn create_bucket(&self, name: &str, owner: &str) -> Result<()> {
        self.send(
            Method::POST,
            "/buckets",
            Some(serde_json::json!({ "name": name, "owner": owner })),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_bucket(&self, name: &str) -> Result<()> {
        self.send(Method::DELETE, &format!("/buckets/{}", name), None)
            .await?;
        Ok(())
    }

    pub async fn list_buckets(&self) -> Result<Vec<BucketMeta>> {
        self.fetch(Method::GET, "/buckets", None).await
    }

    pub async fn get_bucket(&self, name: &str) -> Result<BucketMeta> {
        self.fetch(Method::GET, &format!("/buckets/{}", name), None)
            .await
    }

    // === Objects ===

    pub async fn create_object(&self, bucket: &str, object: &NewObject) -> Result<()> {
        self.send(
            Method::POST,
            &format!("/buckets/{}/objects", bucket),
            Some(serde_json::to_value(object).expect("object encodes")),
        )
        .await?;
        Ok(())
    }

    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta> {
        self.fetch(
            Method::GET,
            &format!("/buckets/{}/objects/{}", bucket, crate::common::encode_path(key)),
            None,
        )
        .await
    }

    pub async fn list_objects(&self, bucket: &str) -> Result<Vec<ObjectMeta>> {
        self.fetch(Method::GET, &format!("/buckets/{}/objects", bucket), None)
            .await
    }

    pub async fn update_object(&self, bucket: &str, key: &str, patch: &ObjectPatch) -> Result<()> {
        self.send(
            Method::PATCH,
            &format!("/buckets/{}/objects/{}", bucket, crate::common::encode_path(key)),
            Some(serde_json::to_value(patch).expect("patch encodes")),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.send(
            Method::DELETE,
            &format!("/buckets/{}/objects/{}", bucket, crate::common::encode_path(key)),
            None,
        )
        .await?;
        Ok(())
    }

    /// Record a read hit (used fire-and-forget by the read path)
    pub async fn touch_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.send(
            Method::POST,
            &format!("/buckets/{}/objects/{}", bucket, crate::common::encode_path(key)),
            None,
        )
        .await?;
        Ok(())
    }

    // === Node directory & cluster ===

    pub async fn list_nodes(&self) -> Result<Vec<StorageNode>> {
        self.fetch(Method::GET, "/nodes", None).await
    }

    pub async fn register_node(&self, node: &StorageNode) -> Result<()> {
        self.send(
            Method::POST,
            "/nodes/register",
            Some(serde_json::to_value(node).expect("node encodes")),
        )
        .await?;
        Ok(())
    }

    pub async fn cluster_status(&self) -> Result<ClusterStatusView> {
        self.fetch(Method::GET, "/cluster/status", None).await
    }
}

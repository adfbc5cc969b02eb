//! Client-side write/read pipeline.
//!
//! Writes encrypt the object with AES-256-GCM under a fresh nonce, record
//! the SHA-256 of the plaintext, erasure-encode the ciphertext, and fan the
//! k+m shards out to storage nodes in parallel. The catalog commit happens
//! only after every shard is durable; any upload failure triggers a
//! best-effort cleanup of the shards already placed, and nothing is
//! committed.
//!
//! Reads fetch the recorded shards in parallel, tolerate up to m failures,
//! reconstruct and verify the ciphertext, decrypt, and hand back the
//! exact-size plaintext. The access-time update is fire-and-forget.

use futures::future::join_all;
use std::sync::Arc;

use crate::client::meta::{MetaClient, NewObject};
use crate::common::crypto::{self, KeyProvider};
use crate::common::erasure::ErasureCodec;
use crate::common::{Error, Result, RuntimeConfig};
use crate::meta::nodes::StorageNode;
use crate::meta::types::{ObjectMeta, ShardInfo, Tier};

/// HTTP client for shard-node data traffic
#[derive(Clone)]
pub struct ShardClient {
    http: reqwest::Client,
}

impl ShardClient {
    pub fn new(runtime: &RuntimeConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(runtime.request_timeout)
            .connect_timeout(runtime.connect_timeout)
            .build()
            .expect("reqwest client");
        Self { http }
    }

    /// Upload one shard; returns the node-confirmed size and checksum
    pub async fn upload(
        &self,
        node: &StorageNode,
        shard_id: &str,
        bucket: &str,
        object_key: &str,
        shard_type: &str,
        index: usize,
        total_shards: usize,
        data: Vec<u8>,
    ) -> Result<ShardInfo> {
        let form = reqwest::multipart::Form::new()
            .text("shard_id", shard_id.to_string())
            .text("bucket", bucket.to_string())
            .text("object_key", object_key.to_string())
            .text("shard_type", shard_type.to_string())
            .text("index", index.to_string())
            .text("total_shards", total_shards.to_string())
            .part(
                "shard",
                reqwest::multipart::Part::bytes(data).file_name(format!("{}.shard", shard_id)),
            );

        let url = format!("{}/shard/upload", node.addr.trim_end_matches('/'));
        let response = self.http.post(&url).multipart(form).send().await?;

        if response.status() != reqwest::StatusCode::CREATED {
            return Err(Error::Http(format!(
                "shard upload to {} failed: {}",
                node.node_id,
                response.status()
            )));
        }

        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct UploadResponse {
            size: u64,
            checksum: String,
        }
        let confirmed: UploadResponse = response.json().await?;

        Ok(ShardInfo {
            shard_id: shard_id.to_string(),
            node_id: node.node_id.clone(),
            node_addr: node.addr.clone(),
            shard_type: crate::shard::store::parse_shard_type(shard_type)?,
            index,
            size: confirmed.size,
            checksum: confirmed.checksum,
        })
    }

    /// Download one shard's bytes
    pub async fn download(
        &self,
        node_addr: &str,
        shard_id: &str,
        bucket: &str,
        object_key: &str,
    ) -> Result<Vec<u8>> {
        let url = format!(
            "{}/shard/download/{}",
            node_addr.trim_end_matches('/'),
            crate::common::encode_key(shard_id)
        );
        let response = self
            .http
            .get(&url)
            .query(&[("bucket", bucket), ("object", object_key)])
            .send()
            .await?;

        match response.status() {
            reqwest::StatusCode::OK => Ok(response.bytes().await?.to_vec()),
            reqwest::StatusCode::NOT_FOUND => {
                Err(Error::NotFound(format!("shard: {}", shard_id)))
            }
            status => Err(Error::Http(format!(
                "shard download failed: {}",
                status
            ))),
        }
    }

    /// Best-effort shard delete (idempotent on the node)
    pub async fn delete(
        &self,
        node_addr: &str,
        shard_id: &str,
        bucket: &str,
        object_key: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/shard/delete/{}",
            node_addr.trim_end_matches('/'),
            crate::common::encode_key(shard_id)
        );
        self.http
            .delete(&url)
            .query(&[("bucket", bucket), ("object", object_key)])
            .send()
            .await?;
        Ok(())
    }
}

/// The end-to-end object pipeline
pub struct Pipeline {
    meta: MetaClient,
    shards: ShardClient,
    codec: Arc<ErasureCodec>,
    keys: Arc<dyn KeyProvider>,
}

impl Pipeline {
    pub fn new(
        meta: MetaClient,
        shards: ShardClient,
        codec: Arc<ErasureCodec>,
        keys: Arc<dyn KeyProvider>,
    ) -> Self {
        Self {
            meta,
            shards,
            codec,
            keys,
        }
    }

    pub fn meta(&self) -> &MetaClient {
        &self.meta
    }

    pub fn codec(&self) -> &ErasureCodec {
        &self.codec
    }

    /// Pick the placement pool: nodes of the requested tier when that tier
    /// can hold a full shard set, any live node otherwise.
    fn placement_pool(
        &self,
        nodes: Vec<StorageNode>,
        tier: Tier,
    ) -> Result<Vec<StorageNode>> {
        let total = self.codec.total_shards();

        let tiered: Vec<StorageNode> = nodes
            .iter()
            .filter(|n| n.tier == tier.as_str())
            .cloned()
            .collect();
        let pool = if tiered.len() >= total { tiered } else { nodes };

        if pool.len() < total {
            return Err(Error::InsufficientNodes {
                needed: total,
                available: pool.len(),
            });
        }
        Ok(pool)
    }

    /// Fan out a full shard set: shard `i` goes to node `i mod n` with id
    /// `<bucket>-<key>-<i>`. On any failure the already-placed shards are
    /// deleted best-effort and the original error surfaces.
    pub async fn place_shards(
        &self,
        bucket: &str,
        object_key: &str,
        shard_data: Vec<Vec<u8>>,
        pool: &[StorageNode],
    ) -> Result<Vec<ShardInfo>> {
        let total = shard_data.len();

        let uploads = shard_data.into_iter().enumerate().map(|(i, data)| {
            let node = &pool[i % pool.len()];
            let shard_id = format!("{}-{}-{}", bucket, object_key, i);
            let kind = self.codec.shard_kind(i);
            async move {
                self.shards
                    .upload(
                        node,
                        &shard_id,
                        bucket,
                        object_key,
                        kind.as_str(),
                        i,
                        total,
                        data,
                    )
                    .await
            }
        });

        let results = join_all(uploads).await;

        let mut placed = Vec::with_capacity(total);
        let mut first_error = None;
        for result in results {
            match result {
                Ok(info) => placed.push(info),
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(_) => {}
            }
        }

        if let Some(error) = first_error {
            tracing::warn!(
                bucket,
                key = object_key,
                placed = placed.len(),
                "shard fan-out failed, cleaning up"
            );
            self.delete_object_shards(bucket, object_key, &placed).await;
            return Err(error);
        }

        placed.sort_by_key(|s| s.index);
        Ok(placed)
    }

    /// Write path: returns the committed object metadata view
    pub async fn upload(
        &self,
        bucket: &str,
        object_key: &str,
        data: &[u8],
        tier: Tier,
        content_type: &str,
    ) -> Result<NewObject> {
        let scope = format!("{}/{}", bucket, object_key);
        let (key_ref, key) = self.keys.generate_key(&scope)?;

        let ciphertext = crypto::seal(data, &key)?;
        let checksum = crypto::sha256_hex(data);
        let shard_data = self.codec.encode(&ciphertext)?;

        // Node discovery is an external collaborator: retried with backoff
        // inside a 30s budget before surfacing
        let nodes = crate::common::utils::retry_with_backoff(
            || self.meta.list_nodes(),
            std::time::Duration::from_secs(30),
            std::time::Duration::from_millis(500),
        )
        .await?;
        let pool = self.placement_pool(nodes, tier)?;

        let shards = self
            .place_shards(bucket, object_key, shard_data, &pool)
            .await?;

        let object = NewObject {
            object_key: object_key.to_string(),
            size: data.len() as u64,
            tier,
            shards,
            encryption_key_ref: key_ref,
            checksum,
            content_type: content_type.to_string(),
        };

        if let Err(e) = self.meta.create_object(bucket, &object).await {
            // Nothing may be half-committed: unwind the placement
            self.delete_object_shards(bucket, object_key, &object.shards)
                .await;
            return Err(e);
        }

        tracing::info!(
            bucket,
            key = object_key,
            size = object.size,
            shards = object.shards.len(),
            "object uploaded"
        );
        Ok(object)
    }

    /// Parallel fetch of an object's shards into index slots; failures
    /// leave `None` holes for reconstruction
    pub async fn fetch_shards(&self, object: &ObjectMeta) -> Vec<Option<Vec<u8>>> {
        let total = self.codec.total_shards();
        let mut slots: Vec<Option<Vec<u8>>> = vec![None; total];

        let fetches = object.shards.iter().map(|shard| {
            let bucket = object.bucket_name.clone();
            let key = object.object_key.clone();
            async move {
                let result = self
                    .shards
                    .download(&shard.node_addr, &shard.shard_id, &bucket, &key)
                    .await;
                (shard.index, result)
            }
        });

        for (index, result) in join_all(fetches).await {
            match result {
                Ok(data) if index < total => slots[index] = Some(data),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(index, "shard fetch failed: {}", e);
                }
            }
        }

        slots
    }

    /// Read path: returns the plaintext
    pub async fn download(&self, bucket: &str, object_key: &str) -> Result<Vec<u8>> {
        let object = self.meta.get_object(bucket, object_key).await?;

        let mut slots = self.fetch_shards(&object).await;

        let ciphertext_len = crypto::sealed_len(object.size as usize);
        let ciphertext = self.codec.decode(&mut slots, ciphertext_len)?;

        let key = self.keys.unwrap_key(&object.encryption_key_ref)?;
        let plaintext = crypto::open(&ciphertext, &key)?;

        if crypto::sha256_hex(&plaintext) != object.checksum {
            return Err(Error::IntegrityFailure(
                "plaintext checksum does not match catalog".into(),
            ));
        }

        // Record the read hit; failure never affects the read result
        let meta = self.meta.clone();
        let bucket = bucket.to_string();
        let key_owned = object_key.to_string();
        tokio::spawn(async move {
            if let Err(e) = meta.touch_object(&bucket, &key_owned).await {
                tracing::debug!("access-time update failed: {}", e);
            }
        });

        Ok(plaintext)
    }

    /// Delete: metadata first, then best-effort shard removal; anything
    /// missed is swept by the shard nodes' orphan cleanup
    pub async fn delete(&self, bucket: &str, object_key: &str) -> Result<()> {
        let object = match self.meta.get_object(bucket, object_key).await {
            Ok(object) => Some(object),
            Err(Error::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        self.meta.delete_object(bucket, object_key).await?;

        if let Some(object) = object {
            self.delete_object_shards(bucket, object_key, &object.shards)
                .await;
        }

        Ok(())
    }

    /// Best-effort deletion of a placement
    pub async fn delete_object_shards(&self, bucket: &str, object_key: &str, shards: &[ShardInfo]) {
        let deletes = shards.iter().map(|shard| async move {
            if let Err(e) = self
                .shards
                .delete(&shard.node_addr, &shard.shard_id, bucket, object_key)
                .await
            {
                tracing::debug!(shard = %shard.shard_id, "shard delete failed: {}", e);
            }
        });
        join_all(deletes).await;
    }
}

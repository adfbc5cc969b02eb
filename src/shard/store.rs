//! On-disk shard storage.
//!
//! Layout: `<root>/shards/<bucket>/<object>/<shard_id>.{shard,meta}` where
//! the object-key and shard-id path segments are percent-encoded, keeping
//! `/`-style keys on a single directory level.
//!
//! A shard is durable once both the blob and its sidecar exist; deletion
//! removes the sidecar first, so a read racing a delete resolves to
//! `NotFound`, which the read path absorbs through reconstruction. A crash
//! between blob and sidecar writes leaves an orphan blob for the cleanup
//! sweeper.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::common::{encode_key, timestamp_now_millis, Error, Result};
use crate::meta::types::ShardType;

/// Sidecar descriptor colocated with each shard blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardDescriptor {
    pub shard_id: String,
    pub bucket: String,
    pub object_key: String,
    pub shard_type: ShardType,
    pub index: usize,
    pub total_shards: usize,
    pub size: u64,
    pub checksum: String,
    /// Epoch milliseconds at upload
    pub uploaded_at: u64,
    /// Tier label of the node that stored it
    pub tier: String,
}

/// Fields identifying an incoming shard upload
#[derive(Debug, Clone)]
pub struct PutShardRequest {
    pub shard_id: String,
    pub bucket: String,
    pub object_key: String,
    pub shard_type: ShardType,
    pub index: usize,
    pub total_shards: usize,
}

/// Filesystem-backed shard store for one node
pub struct ShardStore {
    root: PathBuf,
    tier: String,
}

impl ShardStore {
    pub fn open(root: impl AsRef<Path>, tier: &str) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("shards"))?;
        Ok(Self {
            root,
            tier: tier.to_string(),
        })
    }

    pub fn tier(&self) -> &str {
        &self.tier
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_dir(&self, bucket: &str, object_key: &str) -> PathBuf {
        self.root
            .join("shards")
            .join(encode_key(bucket))
            .join(encode_key(object_key))
    }

    fn blob_path(&self, bucket: &str, object_key: &str, shard_id: &str) -> PathBuf {
        self.object_dir(bucket, object_key)
            .join(format!("{}.shard", encode_key(shard_id)))
    }

    fn sidecar_path(&self, bucket: &str, object_key: &str, shard_id: &str) -> PathBuf {
        self.object_dir(bucket, object_key)
            .join(format!("{}.meta", encode_key(shard_id)))
    }

    /// Store a shard blob and its sidecar. Returns the descriptor with the
    /// computed size and SHA-256 checksum.
    pub fn put(&self, req: &PutShardRequest, data: &[u8]) -> Result<ShardDescriptor> {
        let dir = self.object_dir(&req.bucket, &req.object_key);
        fs::create_dir_all(&dir)?;

        let mut hasher = Sha256::new();
        hasher.update(data);
        let checksum = hex::encode(hasher.finalize());

        let blob_path = self.blob_path(&req.bucket, &req.object_key, &req.shard_id);
        fs::write(&blob_path, data)?;

        let descriptor = ShardDescriptor {
            shard_id: req.shard_id.clone(),
            bucket: req.bucket.clone(),
            object_key: req.object_key.clone(),
            shard_type: req.shard_type,
            index: req.index,
            total_shards: req.total_shards,
            size: data.len() as u64,
            checksum,
            uploaded_at: timestamp_now_millis(),
            tier: self.tier.clone(),
        };

        // The shard is durable only once the sidecar lands
        let sidecar_path = self.sidecar_path(&req.bucket, &req.object_key, &req.shard_id);
        fs::write(
            &sidecar_path,
            serde_json::to_vec(&descriptor).expect("descriptor encodes"),
        )?;

        tracing::info!(
            shard = %req.shard_id,
            bucket = %req.bucket,
            key = %req.object_key,
            size = descriptor.size,
            "shard stored"
        );

        Ok(descriptor)
    }

    /// Fetch a shard blob and its descriptor
    pub fn get(
        &self,
        bucket: &str,
        object_key: &str,
        shard_id: &str,
    ) -> Result<(Vec<u8>, ShardDescriptor)> {
        let sidecar_path = self.sidecar_path(bucket, object_key, shard_id);
        let descriptor: ShardDescriptor = match fs::read(&sidecar_path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::Internal(format!("corrupt sidecar {}: {}", shard_id, e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("shard: {}", shard_id)));
            }
            Err(e) => return Err(e.into()),
        };

        let blob_path = self.blob_path(bucket, object_key, shard_id);
        let data = match fs::read(&blob_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("shard: {}", shard_id)));
            }
            Err(e) => return Err(e.into()),
        };

        Ok((data, descriptor))
    }

    /// Remove a shard. Idempotent: a missing shard is a success. The sidecar
    /// goes first so concurrent reads fail clean.
    pub fn delete(&self, bucket: &str, object_key: &str, shard_id: &str) -> Result<()> {
        let sidecar_path = self.sidecar_path(bucket, object_key, shard_id);
        match fs::remove_file(&sidecar_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let blob_path = self.blob_path(bucket, object_key, shard_id);
        match fs::remove_file(&blob_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // Drop the per-object directory once its last shard is gone
        let dir = self.object_dir(bucket, object_key);
        if let Ok(mut entries) = fs::read_dir(&dir) {
            if entries.next().is_none() {
                let _ = fs::remove_dir(&dir);
            }
        }

        tracing::info!(shard = %shard_id, "shard deleted");
        Ok(())
    }

    /// Descriptors for one object's shards on this node
    pub fn list_object(&self, bucket: &str, object_key: &str) -> Result<Vec<ShardDescriptor>> {
        let dir = self.object_dir(bucket, object_key);
        let mut out = Vec::new();
        Self::collect_sidecars(&dir, &mut out)?;
        out.sort_by_key(|d| d.index);
        Ok(out)
    }

    /// Every descriptor on this node
    pub fn list_all(&self) -> Result<Vec<ShardDescriptor>> {
        let shards_root = self.root.join("shards");
        let mut out = Vec::new();

        for bucket_entry in read_dir_or_empty(&shards_root)? {
            let bucket_path = bucket_entry?.path();
            if !bucket_path.is_dir() {
                continue;
            }
            for object_entry in read_dir_or_empty(&bucket_path)? {
                let object_path = object_entry?.path();
                if object_path.is_dir() {
                    Self::collect_sidecars(&object_path, &mut out)?;
                }
            }
        }

        Ok(out)
    }

    fn collect_sidecars(dir: &Path, out: &mut Vec<ShardDescriptor>) -> Result<()> {
        for entry in read_dir_or_empty(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("meta") {
                continue;
            }
            match fs::read(&path).ok().and_then(|bytes| {
                serde_json::from_slice::<ShardDescriptor>(&bytes).ok()
            }) {
                Some(descriptor) => out.push(descriptor),
                None => tracing::warn!(path = %path.display(), "skipping unreadable sidecar"),
            }
        }
        Ok(())
    }

    /// Total bytes under the shard root (blobs + sidecars)
    pub fn disk_usage(&self) -> Result<u64> {
        fn walk(dir: &Path) -> std::io::Result<u64> {
            let mut total = 0;
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let metadata = entry.metadata()?;
                if metadata.is_dir() {
                    total += walk(&entry.path())?;
                } else {
                    total += metadata.len();
                }
            }
            Ok(total)
        }

        Ok(walk(&self.root.join("shards"))?)
    }

    /// Liveness probe: the data directory must accept writes
    pub fn writable(&self) -> Result<()> {
        let sentinel = self.root.join(".health");
        fs::write(&sentinel, b"ok")?;
        fs::remove_file(&sentinel)?;
        Ok(())
    }
}

fn read_dir_or_empty(dir: &Path) -> Result<Box<dyn Iterator<Item = std::io::Result<fs::DirEntry>>>> {
    match fs::read_dir(dir) {
        Ok(entries) => Ok(Box::new(entries)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Box::new(std::iter::empty())),
        Err(e) => Err(e.into()),
    }
}

/// Parse a tier-controller/on-wire shard type field
pub fn parse_shard_type(s: &str) -> Result<ShardType> {
    match s {
        "data" => Ok(ShardType::Data),
        "parity" => Ok(ShardType::Parity),
        other => Err(Error::InvalidRequest(format!(
            "unknown shard type: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::crypto::sha256_hex;
    use tempfile::tempdir;

    fn put_req(shard_id: &str, bucket: &str, key: &str, index: usize) -> PutShardRequest {
        PutShardRequest {
            shard_id: shard_id.into(),
            bucket: bucket.into(),
            object_key: key.into(),
            shard_type: if index < 6 {
                ShardType::Data
            } else {
                ShardType::Parity
            },
            index,
            total_shards: 9,
        }
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let store = ShardStore::open(dir.path(), "hot").unwrap();

        let desc = store
            .put(&put_req("b1-x-0", "b1", "x", 0), b"shard bytes")
            .unwrap();
        assert_eq!(desc.size, 11);
        assert_eq!(desc.checksum, sha256_hex(b"shard bytes"));
        assert_eq!(desc.tier, "hot");

        let (data, read_desc) = store.get("b1", "x", "b1-x-0").unwrap();
        assert_eq!(data, b"shard bytes");
        assert_eq!(read_desc, desc);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let store = ShardStore::open(dir.path(), "hot").unwrap();

        assert!(matches!(
            store.get("b1", "x", "ghost"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_idempotent_and_removes_dir() {
        let dir = tempdir().unwrap();
        let store = ShardStore::open(dir.path(), "hot").unwrap();

        store
            .put(&put_req("b1-x-0", "b1", "x", 0), b"bytes")
            .unwrap();

        store.delete("b1", "x", "b1-x-0").unwrap();
        assert!(matches!(
            store.get("b1", "x", "b1-x-0"),
            Err(Error::NotFound(_))
        ));

        // Empty per-object directory is gone
        assert!(!dir.path().join("shards").join("b1").join("x").exists());

        // Second delete still succeeds
        store.delete("b1", "x", "b1-x-0").unwrap();
    }

    #[test]
    fn test_list_scoped_and_global() {
        let dir = tempdir().unwrap();
        let store = ShardStore::open(dir.path(), "cold").unwrap();

        for i in 0..3 {
            store
                .put(
                    &put_req(&format!("b1-x-{}", i), "b1", "x", i),
                    &[i as u8; 4],
                )
                .unwrap();
        }
        store
            .put(&put_req("b2-y-0", "b2", "y", 0), b"other")
            .unwrap();

        let scoped = store.list_object("b1", "x").unwrap();
        assert_eq!(scoped.len(), 3);
        assert_eq!(scoped[0].index, 0);
        assert_eq!(scoped[2].index, 2);

        let all = store.list_all().unwrap();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_slash_keys_stay_flat() {
        let dir = tempdir().unwrap();
        let store = ShardStore::open(dir.path(), "hot").unwrap();

        let req = put_req("b1-docs/2024/report.pdf-0", "b1", "docs/2024/report.pdf", 0);
        store.put(&req, b"nested key").unwrap();

        let (data, _) = store
            .get("b1", "docs/2024/report.pdf", "b1-docs/2024/report.pdf-0")
            .unwrap();
        assert_eq!(data, b"nested key");

        // One directory level per (bucket, object)
        let object_dirs: Vec<_> = fs::read_dir(dir.path().join("shards").join("b1"))
            .unwrap()
            .collect();
        assert_eq!(object_dirs.len(), 1);
    }

    #[test]
    fn test_disk_usage_counts_blob_and_sidecar() {
        let dir = tempdir().unwrap();
        let store = ShardStore::open(dir.path(), "hot").unwrap();

        assert_eq!(store.disk_usage().unwrap(), 0);
        store
            .put(&put_req("b1-x-0", "b1", "x", 0), &[0u8; 100])
            .unwrap();
        assert!(store.disk_usage().unwrap() > 100);
    }

    #[test]
    fn test_writable_probe() {
        let dir = tempdir().unwrap();
        let store = ShardStore::open(dir.path(), "hot").unwrap();
        assert!(store.writable().is_ok());
    }
}

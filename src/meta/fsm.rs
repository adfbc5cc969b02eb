//! Deterministic in-memory catalog.
//!
//! The FSM exclusively owns catalog state. All mutations arrive as
//! [`Command`]s from the consensus layer, in log order, carrying the log
//! entry's apply-time clock; nothing here reads the local wall clock, so
//! replaying the same log on two fresh instances yields identical state.
//!
//! Maps are `BTreeMap`s: iteration and snapshot serialization are ordered,
//! which makes snapshots byte-identical across replicas.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::common::{Error, Result};
use crate::meta::types::{BucketMeta, Command, ObjectMeta, ShardType};

/// Snapshot document: the entire catalog in one serialized unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsmSnapshot {
    pub objects: BTreeMap<String, ObjectMeta>,
    pub buckets: BTreeMap<String, BucketMeta>,
}

/// The metadata state machine
pub struct MetadataFsm {
    /// Expected number of data shards per object (k)
    data_shards: usize,
    /// Expected total shards per object (k+m)
    total_shards: usize,

    /// Objects keyed by `<bucket>/<object_key>`
    objects: BTreeMap<String, ObjectMeta>,
    /// Buckets keyed by name
    buckets: BTreeMap<String, BucketMeta>,
}

impl MetadataFsm {
    pub fn new(data_shards: usize, total_shards: usize) -> Self {
        Self {
            data_shards,
            total_shards,
            objects: BTreeMap::new(),
            buckets: BTreeMap::new(),
        }
    }

    /// Apply a command at the given log-entry timestamp (epoch millis).
    /// Returns `StateConflict` for rejected commands; rejected commands leave
    /// the state untouched.
    pub fn apply(&mut self, cmd: &Command, now_ms: u64) -> Result<()> {
        match cmd {
            Command::CreateBucket {
                name,
                owner,
                acl,
                metadata,
            } => self.apply_create_bucket(name, owner, acl, metadata, now_ms),
            Command::DeleteBucket { name } => {
                self.apply_delete_bucket(name);
                Ok(())
            }
            Command::CreateObject {
                bucket_name,
                object_key,
                size,
                tier,
                shards,
                encryption_key_ref,
                checksum,
                content_type,
                metadata,
            } => self.apply_create_object(
                bucket_name,
                object_key,
                *size,
                *tier,
                shards,
                encryption_key_ref,
                checksum,
                content_type,
                metadata,
                now_ms,
            ),
            Command::UpdateObject {
                bucket_name,
                object_key,
                tier,
                last_accessed,
                shards,
            } => self.apply_update_object(bucket_name, object_key, *tier, *last_accessed, shards),
            Command::DeleteObject {
                bucket_name,
                object_key,
            } => {
                self.apply_delete_object(bucket_name, object_key);
                Ok(())
            }
            Command::UpdateAccessTime {
                bucket_name,
                object_key,
            } => self.apply_update_access_time(bucket_name, object_key, now_ms),
        }
    }

    fn apply_create_bucket(
        &mut self,
        name: &str,
        owner: &str,
        acl: &BTreeMap<String, crate::meta::types::Permission>,
        metadata: &BTreeMap<String, String>,
        now_ms: u64,
    ) -> Result<()> {
        if self.buckets.contains_key(name) {
            return Err(Error::StateConflict(format!(
                "bucket already exists: {}",
                name
            )));
        }

        self.buckets.insert(
            name.to_string(),
            BucketMeta {
                name: name.to_string(),
                owner: owner.to_string(),
                acl: acl.clone(),
                created_at: now_ms,
                object_count: 0,
                total_size: 0,
                metadata: metadata.clone(),
            },
        );

        tracing::info!(bucket = name, "created bucket");
        Ok(())
    }

    /// Missing bucket is a no-op. Removal cascades to every object keyed by
    /// the bucket.
    fn apply_delete_bucket(&mut self, name: &str) {
        if self.buckets.remove(name).is_none() {
            return;
        }

        let prefix = format!("{}/", name);
        let doomed: Vec<String> = self
            .objects
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &doomed {
            self.objects.remove(key);
        }

        tracing::info!(bucket = name, objects = doomed.len(), "deleted bucket");
    }

    fn validate_shard_list(&self, shards: &[crate::meta::types::ShardInfo]) -> Result<()> {
        if shards.len() != self.total_shards {
            return Err(Error::StateConflict(format!(
                "shard list has {} entries, expected {}",
                shards.len(),
                self.total_shards
            )));
        }

        for (i, shard) in shards.iter().enumerate() {
            if shard.index != i {
                return Err(Error::StateConflict(format!(
                    "shard at position {} has index {}",
                    i, shard.index
                )));
            }

            let expected = if i < self.data_shards {
                ShardType::Data
            } else {
                ShardType::Parity
            };
            if shard.shard_type != expected {
                return Err(Error::StateConflict(format!(
                    "shard {} has wrong type for its position",
                    i
                )));
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_create_object(
        &mut self,
        bucket_name: &str,
        object_key: &str,
        size: u64,
        tier: crate::meta::types::Tier,
        shards: &[crate::meta::types::ShardInfo],
        encryption_key_ref: &str,
        checksum: &str,
        content_type: &str,
        metadata: &BTreeMap<String, String>,
        now_ms: u64,
    ) -> Result<()> {
        if !self.buckets.contains_key(bucket_name) {
            return Err(Error::StateConflict(format!(
                "bucket does not exist: {}",
                bucket_name
            )));
        }

        let key = format!("{}/{}", bucket_name, object_key);
        if self.objects.contains_key(&key) {
            return Err(Error::StateConflict(format!(
                "object already exists: {}",
                key
            )));
        }

        self.validate_shard_list(shards)?;

        self.objects.insert(
            key,
            ObjectMeta {
                bucket_name: bucket_name.to_string(),
                object_key: object_key.to_string(),
                size,
                tier,
                created_at: now_ms,
                last_accessed: now_ms,
                shards: shards.to_vec(),
                encryption_key_ref: encryption_key_ref.to_string(),
                checksum: checksum.to_string(),
                content_type: content_type.to_string(),
                metadata: metadata.clone(),
            },
        );

        let bucket = self.buckets.get_mut(bucket_name).unwrap();
        bucket.object_count += 1;
        bucket.total_size += size;

        tracing::info!(bucket = bucket_name, key = object_key, size, "created object");
        Ok(())
    }

    fn apply_update_object(
        &mut self,
        bucket_name: &str,
        object_key: &str,
        tier: Option<crate::meta::types::Tier>,
        last_accessed: Option<u64>,
        shards: &Option<Vec<crate::meta::types::ShardInfo>>,
    ) -> Result<()> {
        if let Some(list) = shards {
            self.validate_shard_list(list)?;
        }

        let key = format!("{}/{}", bucket_name, object_key);
        let object = self.objects.get_mut(&key).ok_or_else(|| {
            Error::StateConflict(format!("object does not exist: {}", key))
        })?;

        if let Some(tier) = tier {
            object.tier = tier;
        }
        if let Some(last_accessed) = last_accessed {
            object.last_accessed = last_accessed;
        }
        if let Some(list) = shards {
            object.shards = list.clone();
        }

        tracing::info!(bucket = bucket_name, key = object_key, "updated object");
        Ok(())
    }

    /// Missing object is a no-op
    fn apply_delete_object(&mut self, bucket_name: &str, object_key: &str) {
        let key = format!("{}/{}", bucket_name, object_key);
        let Some(object) = self.objects.remove(&key) else {
            return;
        };

        if let Some(bucket) = self.buckets.get_mut(bucket_name) {
            bucket.object_count = bucket.object_count.saturating_sub(1);
            bucket.total_size = bucket.total_size.saturating_sub(object.size);
        }

        tracing::info!(bucket = bucket_name, key = object_key, "deleted object");
    }

    fn apply_update_access_time(
        &mut self,
        bucket_name: &str,
        object_key: &str,
        now_ms: u64,
    ) -> Result<()> {
        let key = format!("{}/{}", bucket_name, object_key);
        let object = self.objects.get_mut(&key).ok_or_else(|| {
            Error::StateConflict(format!("object does not exist: {}", key))
        })?;

        object.last_accessed = now_ms;
        Ok(())
    }

    // === Read-side queries ===

    pub fn get_bucket(&self, name: &str) -> Option<&BucketMeta> {
        self.buckets.get(name)
    }

    pub fn list_buckets(&self) -> Vec<&BucketMeta> {
        self.buckets.values().collect()
    }

    pub fn get_object(&self, bucket_name: &str, object_key: &str) -> Option<&ObjectMeta> {
        self.objects.get(&format!("{}/{}", bucket_name, object_key))
    }

    /// Objects in a bucket in key order, starting strictly after
    /// `start_after` when given, up to `limit` entries.
    pub fn list_objects(
        &self,
        bucket_name: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Vec<&ObjectMeta> {
        let prefix = format!("{}/", bucket_name);
        let from = match start_after {
            Some(after) => format!("{}/{}\u{0}", bucket_name, after),
            None => prefix.clone(),
        };

        self.objects
            .range(from..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .take(limit)
            .map(|(_, v)| v)
            .collect()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    // === Snapshot / restore ===

    /// Snapshot the entire state as one document
    pub fn snapshot(&self) -> FsmSnapshot {
        FsmSnapshot {
            objects: self.objects.clone(),
            buckets: self.buckets.clone(),
        }
    }

    /// Replace current state wholesale
    pub fn restore(&mut self, snapshot: FsmSnapshot) {
        self.objects = snapshot.objects;
        self.buckets = snapshot.buckets;
        tracing::info!(
            objects = self.objects.len(),
            buckets = self.buckets.len(),
            "restored catalog from snapshot"
        );
    }
}

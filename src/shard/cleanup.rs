//! Orphaned-shard cleanup.
//!
//! A shard is an orphan when its owning object no longer exists in the
//! catalog (a delete that never reached this node, or a crash mid-upload).
//! The sweeper walks local sidecars on an interval, asks the metadata
//! service about each owning object, and removes shards that have been
//! orphaned for longer than the grace period. When the metadata service is
//! unreachable the round is skipped: uncertainty never deletes data.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::client::MetaClient;
use crate::common::metrics::ShardMetrics;
use crate::common::{timestamp_now_millis, Error};
use crate::shard::store::ShardStore;

pub struct CleanupTask {
    store: Arc<ShardStore>,
    meta: MetaClient,
    metrics: Arc<ShardMetrics>,
    interval: Duration,
    grace: Duration,
}

impl CleanupTask {
    pub fn new(
        store: Arc<ShardStore>,
        meta: MetaClient,
        metrics: Arc<ShardMetrics>,
        interval: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            store,
            meta,
            metrics,
            interval,
            grace,
        }
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    _ = shutdown.changed() => break,
                }
                self.sweep().await;
            }
        })
    }

    async fn sweep(&self) {
        let descriptors = match self.store.list_all() {
            Ok(descriptors) => descriptors,
            Err(e) => {
                tracing::warn!("cleanup scan failed: {}", e);
                return;
            }
        };

        let owners: BTreeSet<(String, String)> = descriptors
            .iter()
            .map(|d| (d.bucket.clone(), d.object_key.clone()))
            .collect();

        let grace_ms = self.grace.as_millis() as u64;
        let now = timestamp_now_millis();
        let mut removed = 0u64;

        for (bucket, object_key) in owners {
            match self.meta.get_object(&bucket, &object_key).await {
                Ok(_) => continue,
                Err(Error::NotFound(_)) => {}
                Err(e) => {
                    tracing::warn!("cleanup skipping round, metadata unavailable: {}", e);
                    return;
                }
            }

            let shards: Vec<_> = descriptors
                .iter()
                .filter(|d| d.bucket == bucket && d.object_key == object_key)
                .collect();

            // Only remove once every shard of the object has aged past the
            // grace period; a fresh upload may not be committed yet
            let aged_out = shards
                .iter()
                .all(|d| now.saturating_sub(d.uploaded_at) > grace_ms);
            if !aged_out {
                continue;
            }

            for descriptor in shards {
                match self
                    .store
                    .delete(&bucket, &object_key, &descriptor.shard_id)
                {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        tracing::warn!(shard = %descriptor.shard_id, "orphan delete failed: {}", e)
                    }
                }
            }
        }

        if removed > 0 {
            self.metrics.orphans_removed.add(removed);
            tracing::info!(removed, "cleanup removed orphaned shards");
        }
    }
}

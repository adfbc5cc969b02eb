//! Data-plane tier migration.
//!
//! Safety pattern: the new placement is fully written and committed before
//! the old one is touched. The object stays reconstructable at every commit
//! boundary: either placement is complete, and the catalog flips from one
//! to the other in a single applied command.
//!
//! Tiers map to disjoint node sets (a node carries exactly one tier label),
//! so the new placement reuses the object's shard ids without collision.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use tokio::task::AbortHandle;

use crate::client::{ObjectPatch, Pipeline};
use crate::common::{Error, Result};
use crate::meta::types::Tier;
use crate::tier::events::TieringRequest;

/// Observable state of one migration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationState::Running => write!(f, "running"),
            MigrationState::Succeeded => write!(f, "succeeded"),
            MigrationState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub state: MigrationState,
    pub error: Option<String>,
}

/// Poll/cancel interface over a running migration
pub struct MigrationHandle {
    status: Arc<Mutex<MigrationStatus>>,
    abort: AbortHandle,
}

impl MigrationHandle {
    /// Build a handle over an externally managed status slot. Custom
    /// [`Migrator`] implementations use this to expose their own tasks.
    pub fn new(status: Arc<Mutex<MigrationStatus>>, abort: AbortHandle) -> Self {
        Self { status, abort }
    }

    pub fn status(&self) -> MigrationStatus {
        self.status.lock().unwrap().clone()
    }

    /// Cancel the data-plane work. The catalog is untouched unless the
    /// final commit already landed.
    pub fn cancel(&self) {
        self.abort.abort();
    }
}

/// The migration-engine seam between the controller's accounting and the
/// data plane. `start` errors with `StateConflict` when the object is
/// already migrating (the controller counts that as skipped); any other
/// error is a creation failure.
#[async_trait]
pub trait Migrator: Send + Sync {
    async fn start(&self, request: &TieringRequest) -> Result<MigrationHandle>;
}

/// Migrator that drives the object pipeline directly
pub struct PipelineMigrator {
    pipeline: Arc<Pipeline>,
    active: Arc<DashMap<String, ()>>,
}

impl PipelineMigrator {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    async fn run_migration(
        pipeline: Arc<Pipeline>,
        bucket: String,
        object_key: String,
        target: Tier,
    ) -> Result<()> {
        let object = pipeline.meta().get_object(&bucket, &object_key).await?;

        // A replayed event may arrive after the flip already happened
        if object.tier == target {
            tracing::info!(bucket, key = %object_key, tier = %target, "already on target tier");
            return Ok(());
        }

        // Rebuild the full shard set from the current placement
        let mut slots = pipeline.fetch_shards(&object).await;
        pipeline.codec().reconstruct(&mut slots)?;
        let full: Vec<Vec<u8>> = slots
            .into_iter()
            .map(|s| s.expect("reconstruct fills all shards"))
            .collect();
        if !pipeline.codec().verify(&full)? {
            return Err(Error::IntegrityFailure(
                "source placement failed erasure verification".into(),
            ));
        }

        // Migration is strict about tier placement: no fallback pool
        let nodes = crate::common::utils::retry_with_backoff(
            || pipeline.meta().list_nodes(),
            std::time::Duration::from_secs(30),
            std::time::Duration::from_millis(500),
        )
        .await?;
        let pool: Vec<_> = nodes
            .into_iter()
            .filter(|n| n.tier == target.as_str())
            .collect();
        let needed = pipeline.codec().total_shards();
        if pool.len() < needed {
            return Err(Error::InsufficientNodes {
                needed,
                available: pool.len(),
            });
        }

        let new_shards = pipeline
            .place_shards(&bucket, &object_key, full, &pool)
            .await?;

        // One applied command flips the tier and swaps the placement
        let patch = ObjectPatch {
            tier: Some(target),
            last_accessed: None,
            shards: Some(new_shards.clone()),
        };
        if let Err(e) = pipeline
            .meta()
            .update_object(&bucket, &object_key, &patch)
            .await
        {
            // Old placement is still authoritative; unwind the new one
            pipeline
                .delete_object_shards(&bucket, &object_key, &new_shards)
                .await;
            return Err(e);
        }

        // Old shards are now garbage; sweeper catches whatever this misses
        pipeline
            .delete_object_shards(&bucket, &object_key, &object.shards)
            .await;

        tracing::info!(bucket, key = %object_key, tier = %target, "migration committed");
        Ok(())
    }
}

#[async_trait]
impl Migrator for PipelineMigrator {
    async fn start(&self, request: &TieringRequest) -> Result<MigrationHandle> {
        let key = format!("{}/{}", request.bucket_name, request.object_key);
        if self.active.contains_key(&key) {
            return Err(Error::StateConflict(format!(
                "migration already in progress: {}",
                key
            )));
        }
        self.active.insert(key.clone(), ());

        let status = Arc::new(Mutex::new(MigrationStatus {
            state: MigrationState::Running,
            error: None,
        }));

        let work = tokio::spawn(Self::run_migration(
            Arc::clone(&self.pipeline),
            request.bucket_name.clone(),
            request.object_key.clone(),
            request.recommended_tier,
        ));
        let abort = work.abort_handle();

        // The supervisor outlives cancellation, so the active-set entry and
        // the status always resolve
        let active = Arc::clone(&self.active);
        let status_writer = Arc::clone(&status);
        tokio::spawn(async move {
            let outcome = match work.await {
                Ok(Ok(())) => MigrationStatus {
                    state: MigrationState::Succeeded,
                    error: None,
                },
                Ok(Err(e)) => MigrationStatus {
                    state: MigrationState::Failed,
                    error: Some(e.to_string()),
                },
                Err(join_error) => MigrationStatus {
                    state: MigrationState::Failed,
                    error: Some(if join_error.is_cancelled() {
                        "cancelled".to_string()
                    } else {
                        join_error.to_string()
                    }),
                },
            };
            // Clear the in-flight entry before publishing the terminal
            // state, so an observer of the status can immediately restart
            active.remove(&key);
            *status_writer.lock().unwrap() = outcome;
        });

        Ok(MigrationHandle { status, abort })
    }
}

//! Shard node wiring: store + HTTP API + background loops.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::client::MetaClient;
use crate::common::metrics::ShardMetrics;
use crate::common::{Result, ShardConfig};
use crate::meta::nodes::StorageNode;
use crate::shard::cleanup::CleanupTask;
use crate::shard::http::{router, ShardState};
use crate::shard::store::ShardStore;

pub struct ShardServer {
    config: ShardConfig,
    node_id: String,
}

impl ShardServer {
    pub fn new(config: ShardConfig, node_id: String) -> Self {
        Self { config, node_id }
    }

    pub async fn serve(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!("starting shard node: {}", self.node_id);
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!("  data dir: {}", self.config.data_dir.display());
        tracing::info!("  tier: {}", self.config.tier);
        tracing::info!("  metadata service: {}", self.config.meta_addr);

        let store = Arc::new(ShardStore::open(&self.config.data_dir, &self.config.tier)?);
        let metrics = Arc::new(ShardMetrics::new());
        let meta = MetaClient::new(&self.config.meta_addr);

        // Prime the gauges before the first walk interval elapses
        if let Ok(usage) = store.disk_usage() {
            metrics.disk_usage_bytes.set(usage);
        }
        if let Ok(all) = store.list_all() {
            metrics.shard_count.set(all.len() as u64);
        }

        let walker = self.spawn_disk_walker(Arc::clone(&store), Arc::clone(&metrics), &shutdown);
        let heartbeat = self.spawn_heartbeat(meta.clone(), Arc::clone(&metrics), &shutdown);
        let cleanup = CleanupTask::new(
            Arc::clone(&store),
            meta,
            Arc::clone(&metrics),
            Duration::from_secs(self.config.cleanup_interval_secs),
            Duration::from_secs(self.config.cleanup_grace_secs),
        )
        .spawn(shutdown.clone());

        let state = ShardState {
            store,
            metrics,
            node_id: self.node_id.clone(),
        };
        let app = router(state);

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("shard node ready");

        let mut http_shutdown = shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.changed().await;
            })
            .await?;

        let _ = tokio::join!(walker, heartbeat, cleanup);
        tracing::info!("shard node stopped");
        Ok(())
    }

    fn spawn_disk_walker(
        &self,
        store: Arc<ShardStore>,
        metrics: Arc<ShardMetrics>,
        shutdown: &watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs(self.config.disk_walk_interval_secs);
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }

                match store.disk_usage() {
                    Ok(usage) => metrics.disk_usage_bytes.set(usage),
                    Err(e) => tracing::warn!("disk usage walk failed: {}", e),
                }
                match store.list_all() {
                    Ok(all) => metrics.shard_count.set(all.len() as u64),
                    Err(e) => tracing::warn!("shard count walk failed: {}", e),
                }
            }
        })
    }

    fn spawn_heartbeat(
        &self,
        meta: MetaClient,
        metrics: Arc<ShardMetrics>,
        shutdown: &watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs(self.config.heartbeat_interval_secs);
        let node_id = self.node_id.clone();
        let addr = self.config.advertise_addr.clone();
        let tier = self.config.tier.clone();
        let mut shutdown = shutdown.clone();

        tokio::spawn(async move {
            loop {
                let node = StorageNode {
                    node_id: node_id.clone(),
                    addr: addr.clone(),
                    tier: tier.clone(),
                    capacity_bytes: 0,
                    used_bytes: metrics.disk_usage_bytes.get(),
                    shard_count: metrics.shard_count.get(),
                };

                if let Err(e) = meta.register_node(&node).await {
                    tracing::warn!("heartbeat registration failed: {}", e);
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

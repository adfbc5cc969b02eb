//! Metadata node wiring: FSM + consensus + HTTP API in one process.

use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;

use crate::common::metrics::MetaMetrics;
use crate::common::{ErasureConfig, MetaConfig, Result};
use crate::meta::fsm::MetadataFsm;
use crate::meta::http::{router, MetaState};
use crate::meta::nodes::NodeDirectory;
use crate::meta::raft::{RaftNode, RaftOptions};

pub struct MetaServer {
    config: MetaConfig,
    erasure: ErasureConfig,
    node_id: String,
}

impl MetaServer {
    pub fn new(config: MetaConfig, erasure: ErasureConfig, node_id: String) -> Self {
        Self {
            config,
            erasure,
            node_id,
        }
    }

    /// Run until the shutdown signal flips. A leader transfers leadership
    /// before draining in-flight requests.
    pub async fn serve(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!("starting metadata node: {}", self.node_id);
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!("  advertised: {}", self.config.advertise_addr);
        tracing::info!("  data dir: {}", self.config.data_dir.display());
        match &self.config.join_addr {
            Some(addr) => tracing::info!("  joining via: {}", addr),
            None => tracing::info!("  bootstrapping new cluster"),
        }

        std::fs::create_dir_all(&self.config.data_dir)?;

        let metrics = Arc::new(MetaMetrics::new());
        let fsm = Arc::new(RwLock::new(MetadataFsm::new(
            self.erasure.data_shards,
            self.erasure.total_shards(),
        )));

        let raft = RaftNode::new(
            RaftOptions::from_config(&self.node_id, &self.config),
            Arc::clone(&fsm),
            Arc::clone(&metrics),
        )?;
        let raft_driver = raft.start(shutdown.clone());

        let nodes = Arc::new(NodeDirectory::new(Duration::from_secs(
            self.config.node_lease_secs,
        )));

        let state = MetaState {
            fsm,
            raft,
            nodes,
            metrics,
            data_dir: self.config.data_dir.clone(),
            apply_timeout: self.config.apply_timeout(),
        };
        let app = router(state);

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("metadata node ready");

        let mut http_shutdown = shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.changed().await;
            })
            .await?;

        // The raft driver saw the same signal; wait for leadership transfer
        let _ = raft_driver.await;

        tracing::info!("metadata node stopped");
        Ok(())
    }
}

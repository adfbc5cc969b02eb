//! In-process cluster harness for integration tests: one metadata node plus
//! a set of hot/cold shard nodes on ephemeral ports.

#![allow(dead_code)] // not every test binary uses every helper

use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::watch;

use tierstore::client::{MetaClient, Pipeline, ShardClient};
use tierstore::common::crypto::DerivedKeyProvider;
use tierstore::common::erasure::ErasureCodec;
use tierstore::common::{ErasureConfig, MetaConfig, RuntimeConfig, ShardConfig};
use tierstore::{MetaServer, ShardServer};

pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub struct TestCluster {
    pub meta_url: String,
    pub master_key: String,
    pub erasure: ErasureConfig,
    pub shard_dirs: Vec<(String, TempDir)>,
    _meta_dir: TempDir,
    _shutdown: watch::Sender<bool>,
}

impl TestCluster {
    pub fn meta_client(&self) -> MetaClient {
        MetaClient::new(&self.meta_url)
    }

    pub fn pipeline(&self) -> Pipeline {
        let runtime = RuntimeConfig::default();
        Pipeline::new(
            MetaClient::with_runtime(&self.meta_url, &runtime),
            ShardClient::new(&runtime),
            Arc::new(
                ErasureCodec::new(self.erasure.data_shards, self.erasure.parity_shards).unwrap(),
            ),
            Arc::new(DerivedKeyProvider::new(&self.master_key).unwrap()),
        )
    }
}

pub async fn start_cluster(erasure: ErasureConfig, hot_nodes: usize, cold_nodes: usize) -> TestCluster {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Metadata node, single voter, fast elections
    let meta_port = free_port();
    let meta_url = format!("http://127.0.0.1:{}", meta_port);
    let meta_dir = TempDir::new().unwrap();
    let meta_config = MetaConfig {
        bind_addr: format!("127.0.0.1:{}", meta_port).parse().unwrap(),
        advertise_addr: meta_url.clone(),
        data_dir: meta_dir.path().to_path_buf(),
        join_addr: None,
        election_timeout_ms: 50,
        heartbeat_interval_ms: 20,
        snapshot_threshold: 10_000,
        apply_timeout_secs: 5,
        node_lease_secs: 30,
    };

    let server = MetaServer::new(meta_config, erasure, "meta-1".into());
    let rx = shutdown_rx.clone();
    tokio::spawn(async move {
        let _ = server.serve(rx).await;
    });

    let meta = MetaClient::new(&meta_url);
    wait_for(Duration::from_secs(10), || async {
        matches!(
            meta.cluster_status().await,
            Ok(status) if status.state == "leader"
        )
    })
    .await;

    // Shard nodes
    let mut shard_dirs = Vec::new();
    let total = hot_nodes + cold_nodes;
    for i in 0..total {
        let tier = if i < hot_nodes { "hot" } else { "cold" };
        let port = free_port();
        let dir = TempDir::new().unwrap();
        let node_id = format!("shard-{}", i);

        let config = ShardConfig {
            bind_addr: format!("127.0.0.1:{}", port).parse().unwrap(),
            advertise_addr: format!("http://127.0.0.1:{}", port),
            data_dir: dir.path().to_path_buf(),
            tier: tier.to_string(),
            meta_addr: meta_url.clone(),
            heartbeat_interval_secs: 1,
            cleanup_interval_secs: 3600,
            cleanup_grace_secs: 3600,
            disk_walk_interval_secs: 3600,
        };

        let server = ShardServer::new(config, node_id.clone());
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let _ = server.serve(rx).await;
        });

        shard_dirs.push((node_id, dir));
    }

    // Wait until the whole fleet has registered
    let meta = MetaClient::new(&meta_url);
    wait_for(Duration::from_secs(10), || async {
        matches!(meta.list_nodes().await, Ok(nodes) if nodes.len() == total)
    })
    .await;

    TestCluster {
        meta_url,
        master_key: DerivedKeyProvider::generate_master_key(),
        erasure,
        shard_dirs,
        _meta_dir: meta_dir,
        _shutdown: shutdown_tx,
    }
}

pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        if Instant::now() >= deadline {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

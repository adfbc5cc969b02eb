//! Storage-node directory.
//!
//! Shard nodes register and refresh a lease via `POST /nodes/register`; the
//! write pipeline and tier controller read the live set via `GET /nodes`.
//! Deliberately outside consensus: heartbeats would flood the log, and the
//! discovery contract only promises bounded staleness.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use crate::common::timestamp_now_millis;

/// A registered shard node as seen by clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageNode {
    pub node_id: String,
    /// HTTP base URL of the shard service
    pub addr: String,
    /// Tier label the node serves ("hot" or "cold")
    pub tier: String,
    #[serde(default)]
    pub capacity_bytes: u64,
    #[serde(default)]
    pub used_bytes: u64,
    #[serde(default)]
    pub shard_count: u64,
}

struct Lease {
    node: StorageNode,
    refreshed_at_ms: u64,
}

/// Lease-based registry of shard nodes
pub struct NodeDirectory {
    lease_ttl: Duration,
    nodes: RwLock<HashMap<String, Lease>>,
}

impl NodeDirectory {
    pub fn new(lease_ttl: Duration) -> Self {
        Self {
            lease_ttl,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Register a node or refresh its lease
    pub fn register(&self, node: StorageNode) {
        let mut nodes = self.nodes.write().unwrap();
        let id = node.node_id.clone();
        let existed = nodes
            .insert(
                id.clone(),
                Lease {
                    node,
                    refreshed_at_ms: timestamp_now_millis(),
                },
            )
            .is_some();
        if !existed {
            tracing::info!(node = %id, "storage node registered");
        }
    }

    /// Nodes with a live lease
    pub fn alive(&self) -> Vec<StorageNode> {
        let ttl_ms = self.lease_ttl.as_millis() as u64;
        let now = timestamp_now_millis();
        let mut alive: Vec<StorageNode> = self
            .nodes
            .read()
            .unwrap()
            .values()
            .filter(|lease| now.saturating_sub(lease.refreshed_at_ms) <= ttl_ms)
            .map(|lease| lease.node.clone())
            .collect();
        alive.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        alive
    }

    /// Live nodes serving a given tier
    pub fn alive_in_tier(&self, tier: &str) -> Vec<StorageNode> {
        self.alive()
            .into_iter()
            .filter(|n| n.tier == tier)
            .collect()
    }

    /// Drop expired leases (called opportunistically)
    pub fn evict_expired(&self) {
        let ttl_ms = self.lease_ttl.as_millis() as u64;
        let now = timestamp_now_millis();
        let mut nodes = self.nodes.write().unwrap();
        nodes.retain(|id, lease| {
            let live = now.saturating_sub(lease.refreshed_at_ms) <= ttl_ms;
            if !live {
                tracing::warn!(node = %id, "storage node lease expired");
            }
            live
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, tier: &str) -> StorageNode {
        StorageNode {
            node_id: id.into(),
            addr: format!("http://{}:8080", id),
            tier: tier.into(),
            capacity_bytes: 0,
            used_bytes: 0,
            shard_count: 0,
        }
    }

    #[test]
    fn test_register_and_list() {
        let dir = NodeDirectory::new(Duration::from_secs(30));
        dir.register(node("shard-2", "cold"));
        dir.register(node("shard-1", "hot"));

        let alive = dir.alive();
        assert_eq!(alive.len(), 2);
        // Deterministic ordering for stable placement
        assert_eq!(alive[0].node_id, "shard-1");

        assert_eq!(dir.alive_in_tier("hot").len(), 1);
        assert_eq!(dir.alive_in_tier("cold").len(), 1);
        assert!(dir.alive_in_tier("warm").is_empty());
    }

    #[test]
    fn test_lease_expiry() {
        let dir = NodeDirectory::new(Duration::from_millis(0));
        dir.register(node("shard-1", "hot"));

        std::thread::sleep(Duration::from_millis(5));
        assert!(dir.alive().is_empty());

        dir.evict_expired();
        assert!(dir.nodes.read().unwrap().is_empty());
    }

    #[test]
    fn test_reregistration_refreshes() {
        let dir = NodeDirectory::new(Duration::from_secs(30));
        dir.register(node("shard-1", "hot"));

        let mut updated = node("shard-1", "hot");
        updated.shard_count = 42;
        dir.register(updated);

        let alive = dir.alive();
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].shard_count, 42);
    }
}

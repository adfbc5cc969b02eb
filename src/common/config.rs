//! Configuration for tierstore components

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier)
    pub node_id: String,

    /// Role (meta, shard, or tier controller)
    pub role: NodeRole,

    /// Erasure coding schema, fixed across the deployment
    #[serde(default)]
    pub erasure: ErasureConfig,

    /// Metadata-node specific config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<MetaConfig>,

    /// Shard-node specific config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardConfig>,

    /// Tier-controller specific config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<TierConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Meta,
    Shard,
    Tier,
}

/// Erasure coding schema: k data shards + m parity shards
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ErasureConfig {
    #[serde(default = "default_data_shards")]
    pub data_shards: usize,

    #[serde(default = "default_parity_shards")]
    pub parity_shards: usize,
}

fn default_data_shards() -> usize {
    6
}
fn default_parity_shards() -> usize {
    3
}

impl Default for ErasureConfig {
    fn default() -> Self {
        Self {
            data_shards: default_data_shards(),
            parity_shards: default_parity_shards(),
        }
    }
}

impl ErasureConfig {
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }
}

/// Metadata node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    /// Bind address for the HTTP API (public REST + raft peer RPC)
    pub bind_addr: SocketAddr,

    /// Externally reachable HTTP address of this node, as other nodes
    /// and redirected clients should see it
    pub advertise_addr: String,

    /// Data directory (raft log, raft state, snapshots)
    pub data_dir: PathBuf,

    /// Address of an existing cluster member to join; empty bootstraps
    /// a new single-voter cluster
    #[serde(default)]
    pub join_addr: Option<String>,

    /// Raft election timeout base (randomized 1x-2x)
    #[serde(default = "default_election_timeout")]
    pub election_timeout_ms: u64,

    /// Raft heartbeat interval
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Applied entries between snapshots
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,

    /// Apply deadline for write commands
    #[serde(default = "default_apply_timeout")]
    pub apply_timeout_secs: u64,

    /// Storage-node lease: nodes missing heartbeats this long drop out
    /// of the directory
    #[serde(default = "default_node_lease")]
    pub node_lease_secs: u64,
}

fn default_election_timeout() -> u64 {
    300
}
fn default_heartbeat_interval() -> u64 {
    50
}
fn default_snapshot_threshold() -> u64 {
    1000
}
fn default_apply_timeout() -> u64 {
    10
}
fn default_node_lease() -> u64 {
    30
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7000".parse().unwrap(),
            advertise_addr: "http://localhost:7000".to_string(),
            data_dir: PathBuf::from("./meta-data"),
            join_addr: None,
            election_timeout_ms: default_election_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            snapshot_threshold: default_snapshot_threshold(),
            apply_timeout_secs: default_apply_timeout(),
            node_lease_secs: default_node_lease(),
        }
    }
}

impl MetaConfig {
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }
}

/// Shard node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Bind address for the shard HTTP API
    pub bind_addr: SocketAddr,

    /// Externally reachable address of this node
    pub advertise_addr: String,

    /// Root data directory for shard blobs and sidecars
    pub data_dir: PathBuf,

    /// Tier label this node serves ("hot" or "cold")
    #[serde(default = "default_tier_label")]
    pub tier: String,

    /// Metadata service base URL
    #[serde(default = "default_meta_addr")]
    pub meta_addr: String,

    /// Heartbeat / registration interval
    #[serde(default = "default_shard_heartbeat")]
    pub heartbeat_interval_secs: u64,

    /// Orphan cleanup scan interval
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Grace period before an orphaned shard may be removed
    #[serde(default = "default_cleanup_grace")]
    pub cleanup_grace_secs: u64,

    /// Disk usage walk interval
    #[serde(default = "default_disk_walk_interval")]
    pub disk_walk_interval_secs: u64,
}

fn default_tier_label() -> String {
    "hot".to_string()
}
fn default_meta_addr() -> String {
    "http://localhost:7000".to_string()
}
fn default_shard_heartbeat() -> u64 {
    10
}
fn default_cleanup_interval() -> u64 {
    300
}
fn default_cleanup_grace() -> u64 {
    600
}
fn default_disk_walk_interval() -> u64 {
    30
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().unwrap(),
            advertise_addr: "http://localhost:8080".to_string(),
            data_dir: PathBuf::from("./shard-data"),
            tier: default_tier_label(),
            meta_addr: default_meta_addr(),
            heartbeat_interval_secs: default_shard_heartbeat(),
            cleanup_interval_secs: default_cleanup_interval(),
            cleanup_grace_secs: default_cleanup_grace(),
            disk_walk_interval_secs: default_disk_walk_interval(),
        }
    }
}

/// Tier controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Metadata service base URL
    #[serde(default = "default_meta_addr")]
    pub meta_addr: String,

    /// Worker pool size
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Minimum model confidence to act on a recommendation
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Deadline for a single migration
    #[serde(default = "default_migration_timeout")]
    pub migration_timeout_secs: u64,

    /// Migration status poll interval
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_concurrency() -> usize {
    5
}
fn default_confidence_threshold() -> f64 {
    0.80
}
fn default_migration_timeout() -> u64 {
    30 * 60
}
fn default_poll_interval() -> u64 {
    10
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            meta_addr: default_meta_addr(),
            concurrency: default_concurrency(),
            confidence_threshold: default_confidence_threshold(),
            migration_timeout_secs: default_migration_timeout(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl TierConfig {
    pub fn migration_timeout(&self) -> Duration {
        Duration::from_secs(self.migration_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Bounded migration queue capacity
    pub fn queue_capacity(&self) -> usize {
        self.concurrency * 2
    }
}

/// Client-side runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Outbound HTTP request timeout
    pub request_timeout: Duration,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Backoff budget for calls to external collaborators
    pub upstream_retry_budget: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            upstream_retry_budget: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| crate::Error::InvalidConfig(format!("failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Save to file
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| crate::Error::InvalidConfig(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node_id.is_empty() {
            return Err(crate::Error::InvalidConfig("node_id is required".into()));
        }

        if self.erasure.data_shards == 0 || self.erasure.parity_shards == 0 {
            return Err(crate::Error::InvalidConfig(
                "erasure schema requires at least one data and one parity shard".into(),
            ));
        }

        match self.role {
            NodeRole::Meta => {
                if self.meta.is_none() {
                    return Err(crate::Error::InvalidConfig("meta config required".into()));
                }
            }
            NodeRole::Shard => {
                let shard = self
                    .shard
                    .as_ref()
                    .ok_or_else(|| crate::Error::InvalidConfig("shard config required".into()))?;
                if shard.tier != "hot" && shard.tier != "cold" {
                    return Err(crate::Error::InvalidConfig(format!(
                        "unknown tier label: {}",
                        shard.tier
                    )));
                }
            }
            NodeRole::Tier => {
                let tier = self
                    .tier
                    .as_ref()
                    .ok_or_else(|| crate::Error::InvalidConfig("tier config required".into()))?;
                if !(0.0..=1.0).contains(&tier.confidence_threshold) {
                    return Err(crate::Error::InvalidConfig(
                        "confidence_threshold must be within [0, 1]".into(),
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_roles() {
        let mut config = Config {
            node_id: "meta-1".into(),
            role: NodeRole::Meta,
            erasure: ErasureConfig::default(),
            meta: Some(MetaConfig::default()),
            shard: None,
            tier: None,
            log_level: "info".into(),
        };
        assert!(config.validate().is_ok());

        config.meta = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_tier_label() {
        let config = Config {
            node_id: "shard-1".into(),
            role: NodeRole::Shard,
            erasure: ErasureConfig::default(),
            meta: None,
            shard: Some(ShardConfig {
                tier: "warm".into(),
                ..Default::default()
            }),
            tier: None,
            log_level: "info".into(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_erasure_defaults() {
        let erasure = ErasureConfig::default();
        assert_eq!(erasure.data_shards, 6);
        assert_eq!(erasure.parity_shards, 3);
        assert_eq!(erasure.total_shards(), 9);
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config {
            node_id: "tier-1".into(),
            role: NodeRole::Tier,
            erasure: ErasureConfig::default(),
            meta: None,
            shard: None,
            tier: Some(TierConfig::default()),
            log_level: "debug".into(),
        };
        config.to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.node_id, "tier-1");
        assert_eq!(loaded.tier.unwrap().concurrency, 5);
    }
}

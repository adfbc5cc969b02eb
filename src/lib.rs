//! # tierstore
//!
//! A distributed object store that erasure-codes each object into shards
//! spread across storage nodes, keeps the metadata catalog replicated under
//! raft consensus, and continuously re-tiers objects between hot and cold
//! storage driven by ML tiering recommendations.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │         Metadata Cluster                 │
//! │  (raft consensus over the catalog)       │
//! │   - Leader: applies catalog commands     │
//! │   - Followers: replicate, serve reads    │
//! └───────────┬──────────────────────────────┘
//!             │ HTTP
//!   ┌─────────┴──────────┬───────────────┐
//!   │                    │               │
//! ┌─▼──────────┐  ┌──────▼─────┐  ┌──────▼─────┐
//! │ Shard node │  │ Shard node │  │ Shard node │
//! │  (hot)     │  │  (hot)     │  │  (cold)    │
//! └────────────┘  └────────────┘  └────────────┘
//!         ▲
//!         │ k+m shard fan-out (client pipeline)
//!   ┌─────┴─────┐        ┌────────────────────┐
//!   │    CLI    │        │  Tier controller   │◄── tiering events
//!   └───────────┘        └────────────────────┘
//! ```
//!
//! Write path: the client encrypts the object (AES-256-GCM), erasure-encodes
//! the ciphertext into k data + m parity shards, uploads them in parallel,
//! and only then commits the object to the catalog. Reads tolerate up to m
//! lost shards. The tier controller consumes recommendation events and moves
//! objects between tiers with bounded concurrency.
//!
//! ## Usage
//!
//! ### Start a metadata node
//! ```bash
//! tierstore-meta serve --id meta-1 --bind 0.0.0.0:7000 \
//!   --advertise http://meta-1:7000 --data ./meta-data
//! ```
//!
//! ### Start a shard node
//! ```bash
//! tierstore-shard serve --id shard-1 --bind 0.0.0.0:8080 \
//!   --advertise http://shard-1:8080 --data ./shard-data \
//!   --tier hot --meta http://meta-1:7000
//! ```
//!
//! ### Start the tier controller
//! ```bash
//! tierstore-tierd run --meta http://meta-1:7000 --concurrency 5
//! ```
//!
//! ### Use the CLI
//! ```bash
//! tierstore bucket create photos
//! tierstore object upload photos vacation.jpg ./vacation.jpg --tier hot
//! tierstore object download photos vacation.jpg ./out.jpg
//! tierstore object migrate-tier photos vacation.jpg cold
//! ```

pub mod client;
pub mod common;
pub mod meta;
pub mod shard;
pub mod tier;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use meta::MetaServer;
pub use shard::ShardServer;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Metadata plane: the replicated catalog and its HTTP API.

pub mod fsm;
pub mod http;
pub mod log;
pub mod nodes;
pub mod raft;
pub mod rpc;
pub mod server;
pub mod types;

pub use fsm::MetadataFsm;
pub use server::MetaServer;
pub use types::{BucketMeta, Command, ObjectMeta, ShardInfo, ShardType, Tier};

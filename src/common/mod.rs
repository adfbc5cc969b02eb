//! Common utilities and types shared across tierstore

pub mod config;
pub mod crypto;
pub mod erasure;
pub mod error;
pub mod metrics;
pub mod trace;
pub mod utils;

pub use config::{Config, ErasureConfig, MetaConfig, NodeRole, RuntimeConfig, ShardConfig, TierConfig};
pub use error::{Error, Result};
pub use utils::{
    crc32, decode_key, encode_key, encode_path, format_bytes, timestamp_now,
    timestamp_now_millis, validate_bucket_name, validate_object_key,
};

//! Client side: the typed metadata client and the object pipeline.

pub mod meta;
pub mod pipeline;

pub use meta::{MetaClient, NewObject, ObjectPatch};
pub use pipeline::{Pipeline, ShardClient};

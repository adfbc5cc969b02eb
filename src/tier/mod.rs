//! Tier plane: migration events, the migration engine, and the controller.

pub mod controller;
pub mod events;
pub mod migrate;

pub use controller::TierController;
pub use events::{ChannelSource, EventSource, TieringRequest};
pub use migrate::{MigrationHandle, MigrationState, MigrationStatus, Migrator, PipelineMigrator};

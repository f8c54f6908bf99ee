//! Mirrors change-tracked CRM entity types into relational reporting tables.
//!
//! The pieces, in data-flow order:
//! - [`feed`] yields pages of changes per entity type and owns the cursor.
//! - [`schema`] derives one table per entity type from source metadata.
//! - [`engine`] applies upserts and deletes to the target store.
//! - [`orchestrator`] polls the feed on a timer and drives the engine.

pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod metadata;
pub mod model;
pub mod orchestrator;
pub mod schema;

pub use config::{Config, ConfigError};
pub use engine::{connect_backend, BulkSyncEngine, MirrorBackend};
pub use error::{ProjectionError, SourceError, SyncError, SyncResult};
pub use orchestrator::{FailurePolicy, OrchestratorOptions, SyncOrchestrator};

//! Error types shared across the mirror.

use std::path::PathBuf;

use thiserror::Error;

use crate::metadata::AttributeType;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors raised while deriving a table schema or projecting values into it.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// The attribute's declared type has no projection rule.
    #[error("Unsupported attribute type {kind:?} for {entity}.{attribute}")]
    UnsupportedAttributeType {
        entity: String,
        attribute: String,
        kind: AttributeType,
    },

    /// A table or column name failed the identifier allow-list.
    #[error("Invalid SQL identifier: '{0}'")]
    InvalidIdentifier(String),

    /// Two attributes project onto the same column name.
    #[error("Duplicate column '{column}' in table '{table}'")]
    DuplicateColumn { table: String, column: String },

    /// The metadata names a primary id attribute the entity does not declare.
    #[error("Primary id attribute '{attribute}' not found on entity '{entity}'")]
    MissingPrimaryId { entity: String, attribute: String },

    /// A raw value does not have the shape the column's rule expects.
    #[error("Column '{column}' expects {expected}, got {found}")]
    ValueMismatch {
        column: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Errors from the remote source collaborators (metadata and change feed).
#[derive(Debug, Error)]
pub enum SourceError {
    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Non-success response from the source
    #[error("Source returned {status}: {message}")]
    Api { status: u16, message: String },

    /// Response parsed but did not have the expected shape
    #[error("Unexpected response: {0}")]
    Parse(String),

    /// The entity type is unknown to the source
    #[error("Unknown entity type: {0}")]
    UnknownEntity(String),

    /// Reading or writing a persisted watermark failed
    #[error("Watermark I/O error for {}: {}", .0.display(), .1)]
    Watermark(PathBuf, std::io::Error),

    /// A scope key or entity name cannot be used as a path component
    #[error("Invalid watermark key: {0}")]
    InvalidWatermarkKey(String),
}

impl SourceError {
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }
}

/// Errors raised by the bulk sync engine and the orchestrator.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Startup: the source does not track changes for a configured entity type.
    #[error("Change tracking is not enabled for entity type '{0}'")]
    ChangeTrackingNotEnabled(String),

    #[error("Projection error: {0}")]
    Projection(#[from] ProjectionError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The feed yielded an item that is neither an upsert nor a removal.
    #[error("Unexpected change type '{kind}' in feed for '{entity}'")]
    UnexpectedChangeType { entity: String, kind: String },

    /// A unique constraint was violated and the row could not be excluded.
    #[error("Unique constraint violation on '{table}' ({}): {detail}", .constraint.as_deref().unwrap_or("unknown constraint"))]
    UniqueViolation {
        table: String,
        constraint: Option<String>,
        detail: String,
        #[source]
        source: sqlx::Error,
    },

    /// The target connection string names a store no backend supports.
    #[error("Unsupported target store: {0}")]
    UnsupportedTarget(String),

    /// Orchestrator options that cannot drive a poll loop.
    #[error("Invalid orchestrator options: {0}")]
    InvalidOptions(String),

    /// Shutdown was requested before the work completed.
    #[error("Operation cancelled")]
    Cancelled,
}

impl SyncError {
    /// True if this error only reports a requested shutdown.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}


//! Change feed seam: the source of per-entity-type change pages.
//!
//! A feed owns its cursor. Consumers only pull pages in order; pulling the
//! next page acknowledges the previous one, and only acknowledged pages may
//! move the persisted cursor forward. A consumer that stops early therefore
//! sees the unacknowledged page again on its next session.

pub mod dataverse;
pub mod memory;
pub mod watermark;

use async_trait::async_trait;

use crate::error::SourceError;
use crate::model::{ChangeBatch, Watermark};

pub use dataverse::DataverseClient;
pub use memory::MemorySource;
pub use watermark::WatermarkStore;

/// Parameters of one change session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRequest {
    /// Namespace separating independent consumers of the same feed.
    pub scope_key: String,
    pub entity_type: String,
    /// Attributes to include in upserted entities; `None` means all.
    pub columns: Option<Vec<String>>,
    /// Start from this position instead of the persisted cursor.
    pub since: Option<Watermark>,
    pub page_size: Option<u32>,
}

impl ChangeRequest {
    pub fn new(scope_key: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            scope_key: scope_key.into(),
            entity_type: entity_type.into(),
            columns: None,
            since: None,
            page_size: None,
        }
    }

    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = Some(columns);
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn since(mut self, watermark: Watermark) -> Self {
        self.since = Some(watermark);
        self
    }
}

/// Opens change sessions.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn get_changes(&self, request: ChangeRequest)
        -> Result<Box<dyn ChangePages>, SourceError>;
}

/// A lazy, finite sequence of change pages for one entity type.
#[async_trait]
pub trait ChangePages: Send {
    /// Yields the next page, acknowledging the one returned before it.
    ///
    /// Returns `None` once no more changes are available right now.
    async fn next_page(&mut self) -> Result<Option<ChangeBatch>, SourceError>;
}

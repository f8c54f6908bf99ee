//! In-memory metadata and change feed.
//!
//! Each entity type has an append-only change log. A session reads pages
//! from the scope's acknowledged position; the watermark is the log offset.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{ChangeFeed, ChangePages, ChangeRequest};
use crate::error::SourceError;
use crate::metadata::{EntityMetadata, MetadataProvider};
use crate::model::{ChangeBatch, ChangeItem, Watermark};

const DEFAULT_PAGE_SIZE: usize = 5000;

#[derive(Debug, Default)]
struct MemoryState {
    metadata: HashMap<String, EntityMetadata>,
    logs: HashMap<String, Vec<ChangeItem>>,
    /// Acknowledged log offset per (scope, entity type).
    cursors: HashMap<(String, String), usize>,
}

#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers (or replaces) an entity type's metadata.
    pub fn add_entity(&self, metadata: EntityMetadata) {
        let mut state = self.lock();
        state.logs.entry(metadata.logical_name.clone()).or_default();
        state
            .metadata
            .insert(metadata.logical_name.clone(), metadata);
    }

    /// Appends changes to an entity type's log.
    pub fn push_changes(
        &self,
        entity_type: &str,
        items: impl IntoIterator<Item = ChangeItem>,
    ) {
        self.lock()
            .logs
            .entry(entity_type.to_string())
            .or_default()
            .extend(items);
    }

    /// Acknowledged position of a scope, as the watermark a session would resume from.
    pub fn watermark(&self, scope_key: &str, entity_type: &str) -> Watermark {
        let key = (scope_key.to_string(), entity_type.to_string());
        let position = self.lock().cursors.get(&key).copied().unwrap_or(0);
        Watermark::new(position.to_string())
    }
}

#[async_trait]
impl MetadataProvider for MemorySource {
    async fn get_entity_metadata(&self, entity_type: &str) -> Result<EntityMetadata, SourceError> {
        self.lock()
            .metadata
            .get(entity_type)
            .cloned()
            .ok_or_else(|| SourceError::UnknownEntity(entity_type.to_string()))
    }
}

#[async_trait]
impl ChangeFeed for MemorySource {
    async fn get_changes(
        &self,
        request: ChangeRequest,
    ) -> Result<Box<dyn ChangePages>, SourceError> {
        let key = (request.scope_key.clone(), request.entity_type.clone());
        let position = {
            let state = self.lock();
            if !state.logs.contains_key(&request.entity_type) {
                return Err(SourceError::UnknownEntity(request.entity_type));
            }
            match &request.since {
                Some(watermark) => watermark.as_str().parse::<usize>().map_err(|_| {
                    SourceError::parse(format!("invalid watermark '{}'", watermark.as_str()))
                })?,
                None => state.cursors.get(&key).copied().unwrap_or(0),
            }
        };

        Ok(Box::new(MemoryPages {
            state: Arc::clone(&self.state),
            key,
            columns: request.columns,
            page_size: request
                .page_size
                .map(|n| n.max(1) as usize)
                .unwrap_or(DEFAULT_PAGE_SIZE),
            position,
            unacknowledged: None,
        }))
    }
}

struct MemoryPages {
    state: Arc<Mutex<MemoryState>>,
    key: (String, String),
    columns: Option<Vec<String>>,
    page_size: usize,
    position: usize,
    /// End offset of the page handed out last, until it is acknowledged.
    unacknowledged: Option<usize>,
}

impl MemoryPages {
    fn select_columns(&self, item: ChangeItem) -> ChangeItem {
        match (item, &self.columns) {
            (ChangeItem::NewOrUpdated(mut entity), Some(columns)) => {
                let attributes: BTreeMap<_, _> = std::mem::take(&mut entity.attributes)
                    .into_iter()
                    .filter(|(name, _)| columns.contains(name))
                    .collect();
                entity.attributes = attributes;
                ChangeItem::NewOrUpdated(entity)
            }
            (item, _) => item,
        }
    }
}

#[async_trait]
impl ChangePages for MemoryPages {
    async fn next_page(&mut self) -> Result<Option<ChangeBatch>, SourceError> {
        let items: Vec<ChangeItem> = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(end) = self.unacknowledged.take() {
                state.cursors.insert(self.key.clone(), end);
            }

            let log = state
                .logs
                .get(&self.key.1)
                .ok_or_else(|| SourceError::UnknownEntity(self.key.1.clone()))?;
            let start = self.position.min(log.len());
            let end = (start + self.page_size).min(log.len());
            log[start..end].to_vec()
        };

        if items.is_empty() {
            return Ok(None);
        }

        self.position += items.len();
        self.unacknowledged = Some(self.position);
        let items = items
            .into_iter()
            .map(|item| self.select_columns(item))
            .collect();
        Ok(Some(ChangeBatch::new(self.key.1.clone(), items)))
    }
}

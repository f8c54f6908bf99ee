//! Sync orchestrator: polls the change feed on a timer and routes every page
//! through the bulk sync engine.
//!
//! Entity types of one tick run on a bounded worker pool. Within an entity
//! type the work is strictly sequential: fetch a page, apply its upserts, apply
//! its deletes, then fetch the next page (which acknowledges the one just
//! applied). A page whose work fails is never acknowledged, so it is delivered
//! again on the next tick.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::BulkSyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::feed::{ChangeFeed, ChangeRequest};
use crate::metadata::MetadataProvider;
use crate::schema::{self, EntityMapping};

/// What a failed entity type does to the rest of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log the failure and keep going; the type is retried next tick.
    #[default]
    Isolate,
    /// Stop the orchestrator and return the error.
    Abort,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::Isolate => write!(f, "isolate"),
            FailurePolicy::Abort => write!(f, "abort"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    WaitTick,
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub scope_key: String,
    pub entity_types: Vec<String>,
    pub poll_interval: Duration,
    /// Maximum number of entity types processed at once.
    pub parallelism: usize,
    pub page_size: Option<u32>,
    pub failure_policy: FailurePolicy,
}

impl OrchestratorOptions {
    pub fn new(entity_types: Vec<String>) -> Self {
        Self {
            scope_key: "default".to_string(),
            entity_types,
            poll_interval: Duration::from_secs(60),
            parallelism: 1,
            page_size: None,
            failure_policy: FailurePolicy::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            scope_key: config.source.scope_key.clone(),
            entity_types: config.entity_types.value.clone(),
            poll_interval: Duration::from_secs(config.poll_interval_secs.value),
            parallelism: config.parallelism(),
            page_size: Some(config.source.page_size),
            failure_policy: config.failure_policy.value,
        }
    }
}

/// Counters for one entity type in one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityTypeStats {
    pub entity_type: String,
    pub pages: usize,
    pub upserted: usize,
    pub skipped: usize,
    pub deleted: u64,
}

/// Result of one poll over all entity types.
#[derive(Debug, Default)]
pub struct TickReport {
    pub synced: Vec<EntityTypeStats>,
    pub failed: Vec<(String, SyncError)>,
    /// Entity types interrupted by shutdown or by an aborting failure.
    pub cancelled: Vec<String>,
}

impl TickReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Fetches one entity type's metadata and projects its mirror table.
///
/// Fails when the source does not track changes for the type or when an
/// attribute has no projection rule.
pub async fn prepare_mapping(
    metadata: &dyn MetadataProvider,
    entity_type: &str,
) -> SyncResult<EntityMapping> {
    let entity = metadata.get_entity_metadata(entity_type).await?;
    if !entity.change_tracking_enabled {
        return Err(SyncError::ChangeTrackingNotEnabled(entity_type.to_string()));
    }
    Ok(schema::project(&entity)?)
}

pub struct SyncOrchestrator {
    options: OrchestratorOptions,
    feed: Arc<dyn ChangeFeed>,
    engine: BulkSyncEngine,
    mappings: Vec<Arc<EntityMapping>>,
    state: watch::Sender<OrchestratorState>,
}

impl SyncOrchestrator {
    /// Validates every configured entity type and creates its mirror table.
    ///
    /// Any failure here is fatal: the orchestrator never runs with a subset
    /// of its entity types.
    pub async fn start(
        options: OrchestratorOptions,
        metadata: &dyn MetadataProvider,
        feed: Arc<dyn ChangeFeed>,
        engine: BulkSyncEngine,
    ) -> SyncResult<Self> {
        if options.poll_interval.is_zero() {
            return Err(SyncError::InvalidOptions(
                "poll interval must be greater than zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut mappings = Vec::with_capacity(options.entity_types.len());
        for entity_type in &options.entity_types {
            if !seen.insert(entity_type.as_str()) {
                warn!(entity_type = %entity_type, "Ignoring duplicate entity type");
                continue;
            }
            let mapping = prepare_mapping(metadata, entity_type).await?;
            engine.ensure_table(&mapping).await?;
            info!(
                entity_type = %entity_type,
                table = %mapping.table_name,
                columns = mapping.column_count() + 3,
                "Entity type ready"
            );
            mappings.push(Arc::new(mapping));
        }

        let (state, _) = watch::channel(OrchestratorState::Idle);
        Ok(Self {
            options,
            feed,
            engine,
            mappings,
            state,
        })
    }

    pub fn mappings(&self) -> &[Arc<EntityMapping>] {
        &self.mappings
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.borrow()
    }

    /// Receives every state transition.
    pub fn subscribe(&self) -> watch::Receiver<OrchestratorState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: OrchestratorState) {
        self.state.send_replace(state);
    }

    /// Polls until `cancel` fires. The first poll starts immediately.
    ///
    /// Returns `Ok` on shutdown. Under [`FailurePolicy::Abort`] the first
    /// entity type failure stops the loop and is returned.
    pub async fn run(&self, cancel: CancellationToken) -> SyncResult<()> {
        let mut interval = tokio::time::interval(self.options.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            entity_types = self.mappings.len(),
            interval_secs = self.options.poll_interval.as_secs_f64(),
            parallelism = self.options.parallelism,
            failure_policy = %self.options.failure_policy,
            strategy = %self.engine.strategy(),
            "Sync orchestrator started"
        );

        loop {
            self.set_state(OrchestratorState::WaitTick);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            self.set_state(OrchestratorState::Running);
            let report = self.run_tick(&cancel).await;
            if cancel.is_cancelled() {
                break;
            }

            if self.options.failure_policy == FailurePolicy::Abort {
                if let Some((entity_type, err)) = report.failed.into_iter().next() {
                    error!(entity_type = %entity_type, error = %err, "Stopping after failure");
                    self.set_state(OrchestratorState::Stopped);
                    return Err(err);
                }
            }
        }

        self.set_state(OrchestratorState::Stopped);
        info!("Sync orchestrator stopped");
        Ok(())
    }

    /// Runs one poll over every entity type.
    pub async fn run_tick(&self, cancel: &CancellationToken) -> TickReport {
        // Child token so an aborting failure can stop the rest of the tick
        // without cancelling the caller.
        let tick_cancel = cancel.child_token();
        let parallelism = self.options.parallelism.max(1);
        let mut report = TickReport::default();

        let mut results = stream::iter(self.mappings.iter().cloned())
            .map(|mapping| {
                let tick_cancel = tick_cancel.clone();
                async move {
                    let result = self.sync_entity_type(&mapping, &tick_cancel).await;
                    (mapping.entity_type.clone(), result)
                }
            })
            .buffer_unordered(parallelism);

        while let Some((entity_type, result)) = results.next().await {
            match result {
                Ok(stats) => {
                    if stats.pages > 0 {
                        info!(
                            entity_type = %entity_type,
                            pages = stats.pages,
                            upserted = stats.upserted,
                            skipped = stats.skipped,
                            deleted = stats.deleted,
                            "Synced changes"
                        );
                    } else {
                        debug!(entity_type = %entity_type, "No changes");
                    }
                    report.synced.push(stats);
                }
                Err(err) if err.is_cancelled() => {
                    debug!(entity_type = %entity_type, "Sync interrupted by cancellation");
                    report.cancelled.push(entity_type);
                }
                Err(err) => {
                    error!(entity_type = %entity_type, error = %err, "Entity type sync failed");
                    if self.options.failure_policy == FailurePolicy::Abort {
                        tick_cancel.cancel();
                    }
                    report.failed.push((entity_type, err));
                }
            }
        }

        report
    }

    async fn sync_entity_type(
        &self,
        mapping: &EntityMapping,
        cancel: &CancellationToken,
    ) -> SyncResult<EntityTypeStats> {
        let mut stats = EntityTypeStats {
            entity_type: mapping.entity_type.clone(),
            ..Default::default()
        };

        let mut request = ChangeRequest::new(&self.options.scope_key, &mapping.entity_type)
            .with_columns(mapping.source_attributes());
        if let Some(page_size) = self.options.page_size {
            request = request.with_page_size(page_size);
        }

        let mut pages = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            pages = self.feed.get_changes(request) => pages?,
        };

        loop {
            let page = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                page = pages.next_page() => page?,
            };
            let Some(batch) = page else {
                break;
            };

            stats.pages += 1;
            let changes = batch.classify()?;
            let outcome = self
                .engine
                .apply_upserts(mapping, &changes.upserts, cancel)
                .await?;
            // Deletes after upserts so an item upserted then removed in the same page stays removed.
            let deleted = self
                .engine
                .apply_deletes(mapping, &changes.deletes, cancel)
                .await?;

            stats.upserted += outcome.applied;
            stats.skipped += outcome.skipped.len();
            stats.deleted += deleted;
        }

        Ok(stats)
    }
}

//! Bulk sync engine: applies projected upserts and deletes to the target store.
//!
//! The engine owns the row-level policy (duplicate collapsing, conflict
//! recovery, cancellation checks) and delegates the SQL work to a
//! [`MirrorBackend`]. Each call to the backend runs in its own transaction, so
//! a failed or cancelled call leaves the target unchanged.

pub mod conflict;
pub mod copy;
pub mod postgres;
pub mod sqlite;

use std::collections::HashSet;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::model::Entity;
use crate::schema::{Dialect, EntityMapping, ProjectedRow};

pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

/// How a backend writes a batch of upserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStrategy {
    /// One parameterized upsert per row inside a single transaction.
    RowByRow,
    /// Bulk load into a transaction-scoped staging table, then one merge.
    StagedBulk,
}

impl std::fmt::Display for UpsertStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpsertStrategy::RowByRow => write!(f, "row-by-row"),
            UpsertStrategy::StagedBulk => write!(f, "staged-bulk"),
        }
    }
}

/// Why a backend could not commit a batch.
#[derive(Debug)]
pub enum MergeFailure {
    /// A unique constraint rejected the batch.
    ///
    /// `offending_row` is the index into the submitted rows when the backend
    /// could tie the violation to one of them.
    UniqueViolation {
        constraint: Option<String>,
        offending_row: Option<usize>,
        detail: String,
        source: sqlx::Error,
    },
    Other(SyncError),
}

impl From<sqlx::Error> for MergeFailure {
    fn from(err: sqlx::Error) -> Self {
        MergeFailure::Other(SyncError::Database(err))
    }
}

impl From<SyncError> for MergeFailure {
    fn from(err: SyncError) -> Self {
        MergeFailure::Other(err)
    }
}

/// Target store operations the engine needs.
///
/// Implementations must roll back everything they wrote in a call that
/// returns an error, and must check `cancel` before every statement they issue.
#[async_trait]
pub trait MirrorBackend: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn strategy(&self) -> UpsertStrategy;

    /// Creates the mirror table if it does not exist.
    async fn ensure_table(&self, mapping: &EntityMapping) -> SyncResult<()>;

    /// Upserts all rows atomically. Row ids are unique within `rows`.
    async fn merge_rows(
        &self,
        mapping: &EntityMapping,
        rows: &[ProjectedRow],
        cancel: &CancellationToken,
    ) -> Result<(), MergeFailure>;

    /// Deletes the rows with the given ids atomically; returns the number removed.
    async fn delete_rows(
        &self,
        mapping: &EntityMapping,
        ids: &[Uuid],
        cancel: &CancellationToken,
    ) -> SyncResult<u64>;
}

/// Selects a backend from the target connection string.
///
/// Returns `None` for schemes no backend supports.
pub fn target_dialect(connection_string: &str) -> Option<Dialect> {
    if connection_string.starts_with("sqlite:") {
        Some(Dialect::Sqlite)
    } else if connection_string.starts_with("postgres://")
        || connection_string.starts_with("postgresql://")
    {
        Some(Dialect::Postgres)
    } else {
        None
    }
}

/// Connects to the target store named by `connection_string`.
pub async fn connect_backend(connection_string: &str) -> SyncResult<Box<dyn MirrorBackend>> {
    match target_dialect(connection_string) {
        Some(Dialect::Sqlite) => Ok(Box::new(SqliteBackend::connect(connection_string).await?)),
        Some(Dialect::Postgres) => Ok(Box::new(
            PostgresBackend::connect(connection_string).await?,
        )),
        None => {
            let scheme = connection_string
                .split_once(':')
                .map(|(scheme, _)| scheme)
                .unwrap_or(connection_string);
            Err(SyncError::UnsupportedTarget(scheme.to_string()))
        }
    }
}

/// A row dropped from a batch because it violated a unique constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRow {
    pub id: Uuid,
    pub constraint: Option<String>,
}

/// Result of one upsert batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Rows committed to the target.
    pub applied: usize,
    pub skipped: Vec<SkippedRow>,
}

pub struct BulkSyncEngine {
    backend: Box<dyn MirrorBackend>,
    ignore_invalid: bool,
}

impl BulkSyncEngine {
    pub fn new(backend: Box<dyn MirrorBackend>, ignore_invalid: bool) -> Self {
        Self {
            backend,
            ignore_invalid,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.backend.dialect()
    }

    pub fn strategy(&self) -> UpsertStrategy {
        self.backend.strategy()
    }

    pub async fn ensure_table(&self, mapping: &EntityMapping) -> SyncResult<()> {
        self.backend.ensure_table(mapping).await
    }

    /// Inserts or updates the given entities in the mirror table.
    ///
    /// Entities repeating an id collapse to the last occurrence. When a unique
    /// constraint other than the primary key rejects a row and
    /// `ignore_invalid` is set, that row is dropped and the rest of the batch
    /// is retried in a fresh transaction. Otherwise the whole batch fails and
    /// nothing is written.
    pub async fn apply_upserts(
        &self,
        mapping: &EntityMapping,
        entities: &[Entity],
        cancel: &CancellationToken,
    ) -> SyncResult<UpsertOutcome> {
        if entities.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        let projected = entities
            .iter()
            .map(|e| mapping.project_entity(e))
            .collect::<Result<Vec<_>, _>>()?;
        let mut rows = collapse_duplicates(projected);
        let mut skipped = Vec::new();

        // Every failed attempt that does not return removes one row, so this terminates.
        while !rows.is_empty() {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            match self.backend.merge_rows(mapping, &rows, cancel).await {
                Ok(()) => {
                    debug!(
                        table = %mapping.table_name,
                        rows = rows.len(),
                        strategy = %self.backend.strategy(),
                        "Upserted batch"
                    );
                    return Ok(UpsertOutcome {
                        applied: rows.len(),
                        skipped,
                    });
                }
                Err(MergeFailure::UniqueViolation {
                    constraint,
                    offending_row: Some(index),
                    detail,
                    ..
                }) if self.ignore_invalid && index < rows.len() => {
                    let row = rows.remove(index);
                    warn!(
                        table = %mapping.table_name,
                        id = %row.id,
                        constraint = constraint.as_deref().unwrap_or("unknown"),
                        detail = %detail,
                        "Skipping row that violates a unique constraint"
                    );
                    skipped.push(SkippedRow {
                        id: row.id,
                        constraint,
                    });
                }
                Err(MergeFailure::UniqueViolation {
                    constraint,
                    detail,
                    source,
                    ..
                }) => {
                    return Err(SyncError::UniqueViolation {
                        table: mapping.table_name.clone(),
                        constraint,
                        detail,
                        source,
                    });
                }
                Err(MergeFailure::Other(err)) => return Err(err),
            }
        }

        Ok(UpsertOutcome {
            applied: 0,
            skipped,
        })
    }

    /// Removes rows by id. Missing ids are ignored; an empty list is a no-op.
    pub async fn apply_deletes(
        &self,
        mapping: &EntityMapping,
        ids: &[Uuid],
        cancel: &CancellationToken,
    ) -> SyncResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let deleted = self.backend.delete_rows(mapping, ids, cancel).await?;
        debug!(
            table = %mapping.table_name,
            requested = ids.len(),
            deleted,
            "Deleted rows"
        );
        Ok(deleted)
    }
}

/// Keeps the last row for each id, ordered by where that last occurrence sits.
fn collapse_duplicates(rows: Vec<ProjectedRow>) -> Vec<ProjectedRow> {
    let mut seen = HashSet::new();
    let mut kept: Vec<ProjectedRow> = rows
        .into_iter()
        .rev()
        .filter(|row| seen.insert(row.id))
        .collect();
    kept.reverse();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{AttributeMetadata, AttributeType, EntityMetadata};
    use crate::model::AttributeValue;
    use crate::schema::{self, SqlValue};
    use sqlx::SqlitePool;
    use tempfile::TempDir;

    fn contact_mapping() -> EntityMapping {
        let metadata = EntityMetadata {
            logical_name: "contact".to_string(),
            entity_set_name: None,
            primary_id_attribute: "contactid".to_string(),
            change_tracking_enabled: true,
            attributes: vec![
                AttributeMetadata::new("contactid", AttributeType::Uniqueidentifier),
                AttributeMetadata::new("fullname", AttributeType::String).with_max_length(100),
                AttributeMetadata::new("emailaddress1", AttributeType::String)
                    .with_max_length(100),
            ],
        };
        schema::project(&metadata).unwrap()
    }

    fn contact(id: Uuid, name: &str, email: &str) -> Entity {
        Entity::new("contact", id)
            .with("fullname", AttributeValue::String(name.to_string()))
            .with("emailaddress1", AttributeValue::String(email.to_string()))
    }

    async fn setup(ignore_invalid: bool) -> (BulkSyncEngine, SqlitePool, EntityMapping, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}", temp_dir.path().join("mirror.db").display());
        let backend = SqliteBackend::connect(&url).await.unwrap();
        let pool = backend.pool().clone();
        let engine = BulkSyncEngine::new(Box::new(backend), ignore_invalid);
        let mapping = contact_mapping();
        engine.ensure_table(&mapping).await.unwrap();
        (engine, pool, mapping, temp_dir)
    }

    async fn names(pool: &SqlitePool) -> Vec<String> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT fullname FROM contact ORDER BY fullname")
            .fetch_all(pool)
            .await
            .unwrap();
        rows.into_iter().map(|r| r.0).collect()
    }

    async fn add_unique_email_index(pool: &SqlitePool) {
        sqlx::query("CREATE UNIQUE INDEX ux_contact_email ON contact (emailaddress1)")
            .execute(pool)
            .await
            .unwrap();
    }

    #[test]
    fn test_collapse_duplicates_keeps_last_occurrence() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let row = |id, v: &str| ProjectedRow {
            id,
            values: vec![SqlValue::Text(v.to_string())],
        };
        let rows = collapse_duplicates(vec![row(a, "a1"), row(b, "b1"), row(a, "a2")]);
        assert_eq!(rows, vec![row(b, "b1"), row(a, "a2")]);
    }

    #[test]
    fn test_target_dialect() {
        assert_eq!(target_dialect("sqlite:/tmp/x.db"), Some(Dialect::Sqlite));
        assert_eq!(
            target_dialect("postgres://u@localhost/db"),
            Some(Dialect::Postgres)
        );
        assert_eq!(
            target_dialect("postgresql://u@localhost/db"),
            Some(Dialect::Postgres)
        );
        assert_eq!(target_dialect("mssql://server/db"), None);
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        match connect_backend("mssql://server/db").await {
            Err(SyncError::UnsupportedTarget(scheme)) => assert_eq!(scheme, "mssql"),
            Err(other) => panic!("expected UnsupportedTarget, got {:?}", other),
            Ok(_) => panic!("expected UnsupportedTarget"),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let (engine, pool, mapping, _dir) = setup(false).await;
        let cancel = CancellationToken::new();
        let id = Uuid::new_v4();
        let batch = vec![contact(id, "Amy", "amy@example.com")];

        let first = engine.apply_upserts(&mapping, &batch, &cancel).await.unwrap();
        let second = engine.apply_upserts(&mapping, &batch, &cancel).await.unwrap();

        assert_eq!(first.applied, 1);
        assert_eq!(second.applied, 1);
        assert_eq!(names(&pool).await, vec!["Amy"]);
    }

    #[tokio::test]
    async fn test_update_keeps_first_synced_on() {
        let (engine, pool, mapping, _dir) = setup(false).await;
        let cancel = CancellationToken::new();
        let id = Uuid::new_v4();

        engine
            .apply_upserts(&mapping, &[contact(id, "Amy", "a@example.com")], &cancel)
            .await
            .unwrap();
        let (first_before,): (String,) = sqlx::query_as("SELECT FirstSyncedOn FROM contact")
            .fetch_one(&pool)
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        engine
            .apply_upserts(&mapping, &[contact(id, "Amy B", "a@example.com")], &cancel)
            .await
            .unwrap();

        let (first_after, last_after): (String, String) =
            sqlx::query_as("SELECT FirstSyncedOn, LastSyncedOn FROM contact")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(first_before, first_after);
        assert!(last_after > first_after);
        assert_eq!(names(&pool).await, vec!["Amy B"]);
    }

    #[tokio::test]
    async fn test_duplicate_ids_collapse_to_last() {
        let (engine, pool, mapping, _dir) = setup(false).await;
        let cancel = CancellationToken::new();
        let id = Uuid::new_v4();
        let batch = vec![
            contact(id, "First", "x@example.com"),
            contact(id, "Second", "x@example.com"),
        ];

        let outcome = engine.apply_upserts(&mapping, &batch, &cancel).await.unwrap();

        assert_eq!(outcome.applied, 1);
        assert_eq!(names(&pool).await, vec!["Second"]);
    }

    #[tokio::test]
    async fn test_conflicting_row_is_skipped_when_ignoring_invalid() {
        let (engine, pool, mapping, _dir) = setup(true).await;
        add_unique_email_index(&pool).await;
        let cancel = CancellationToken::new();

        let clash = Uuid::new_v4();
        let batch = vec![
            contact(Uuid::new_v4(), "Amy", "amy@example.com"),
            contact(Uuid::new_v4(), "Bob", "bob@example.com"),
            contact(clash, "Eve", "amy@example.com"),
            contact(Uuid::new_v4(), "Cal", "cal@example.com"),
        ];

        let outcome = engine.apply_upserts(&mapping, &batch, &cancel).await.unwrap();

        assert_eq!(outcome.applied, 3);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].id, clash);
        assert_eq!(names(&pool).await, vec!["Amy", "Bob", "Cal"]);
    }

    #[tokio::test]
    async fn test_conflict_against_existing_row_is_skipped() {
        let (engine, pool, mapping, _dir) = setup(true).await;
        add_unique_email_index(&pool).await;
        let cancel = CancellationToken::new();

        engine
            .apply_upserts(
                &mapping,
                &[contact(Uuid::new_v4(), "Amy", "amy@example.com")],
                &cancel,
            )
            .await
            .unwrap();

        let outcome = engine
            .apply_upserts(
                &mapping,
                &[
                    contact(Uuid::new_v4(), "Eve", "amy@example.com"),
                    contact(Uuid::new_v4(), "Bob", "bob@example.com"),
                ],
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(names(&pool).await, vec!["Amy", "Bob"]);
    }

    #[tokio::test]
    async fn test_conflict_fails_whole_batch_without_ignore_invalid() {
        let (engine, pool, mapping, _dir) = setup(false).await;
        add_unique_email_index(&pool).await;
        let cancel = CancellationToken::new();

        let batch = vec![
            contact(Uuid::new_v4(), "Amy", "amy@example.com"),
            contact(Uuid::new_v4(), "Bob", "bob@example.com"),
            contact(Uuid::new_v4(), "Eve", "amy@example.com"),
        ];

        let err = engine
            .apply_upserts(&mapping, &batch, &cancel)
            .await
            .unwrap_err();

        match err {
            SyncError::UniqueViolation { table, .. } => assert_eq!(table, "contact"),
            other => panic!("expected UniqueViolation, got {:?}", other),
        }
        assert!(names(&pool).await.is_empty());
    }

    #[tokio::test]
    async fn test_all_rows_skipped_commits_nothing() {
        let (engine, pool, mapping, _dir) = setup(true).await;
        add_unique_email_index(&pool).await;
        let cancel = CancellationToken::new();
        engine
            .apply_upserts(
                &mapping,
                &[contact(Uuid::new_v4(), "Amy", "amy@example.com")],
                &cancel,
            )
            .await
            .unwrap();

        let outcome = engine
            .apply_upserts(
                &mapping,
                &[contact(Uuid::new_v4(), "Eve", "amy@example.com")],
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(names(&pool).await, vec!["Amy"]);
    }

    #[tokio::test]
    async fn test_cancelled_upsert_writes_nothing() {
        let (engine, pool, mapping, _dir) = setup(false).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine
            .apply_upserts(
                &mapping,
                &[contact(Uuid::new_v4(), "Amy", "amy@example.com")],
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(names(&pool).await.is_empty());
    }

    #[tokio::test]
    async fn test_projection_error_fails_batch() {
        let (engine, pool, mapping, _dir) = setup(false).await;
        let cancel = CancellationToken::new();
        let bad = Entity::new("contact", Uuid::new_v4())
            .with("fullname", AttributeValue::Integer(7));

        let err = engine
            .apply_upserts(&mapping, &[bad], &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Projection(_)));
        assert!(names(&pool).await.is_empty());
    }

    #[tokio::test]
    async fn test_deletes_are_idempotent() {
        let (engine, pool, mapping, _dir) = setup(false).await;
        let cancel = CancellationToken::new();
        let keep = Uuid::new_v4();
        let gone = Uuid::new_v4();
        engine
            .apply_upserts(
                &mapping,
                &[
                    contact(keep, "Amy", "amy@example.com"),
                    contact(gone, "Bob", "bob@example.com"),
                ],
                &cancel,
            )
            .await
            .unwrap();

        let first = engine
            .apply_deletes(&mapping, &[gone, Uuid::new_v4()], &cancel)
            .await
            .unwrap();
        let second = engine.apply_deletes(&mapping, &[gone], &cancel).await.unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 0);
        assert_eq!(names(&pool).await, vec!["Amy"]);
    }

    #[tokio::test]
    async fn test_empty_inputs_are_noops() {
        let (engine, _pool, mapping, _dir) = setup(false).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        // Empty input returns before any cancellation check.
        let outcome = engine.apply_upserts(&mapping, &[], &cancel).await.unwrap();
        let deleted = engine.apply_deletes(&mapping, &[], &cancel).await.unwrap();

        assert_eq!(outcome, UpsertOutcome::default());
        assert_eq!(deleted, 0);
    }

    #[tokio::test]
    async fn test_delete_many_ids_spans_chunks() {
        let (engine, pool, mapping, _dir) = setup(false).await;
        let cancel = CancellationToken::new();
        let batch: Vec<Entity> = (0..1200)
            .map(|i| {
                contact(
                    Uuid::new_v4(),
                    &format!("n{:04}", i),
                    &format!("{}@example.com", i),
                )
            })
            .collect();
        engine.apply_upserts(&mapping, &batch, &cancel).await.unwrap();

        let ids: Vec<Uuid> = batch.iter().map(|e| e.id).collect();
        let deleted = engine.apply_deletes(&mapping, &ids, &cancel).await.unwrap();

        assert_eq!(deleted, 1200);
        assert!(names(&pool).await.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_then_delete_leaves_no_row() {
        let (engine, pool, mapping, _dir) = setup(false).await;
        let cancel = CancellationToken::new();
        let id = Uuid::new_v4();

        engine
            .apply_upserts(&mapping, &[contact(id, "Amy", "amy@example.com")], &cancel)
            .await
            .unwrap();
        engine.apply_deletes(&mapping, &[id], &cancel).await.unwrap();

        assert!(names(&pool).await.is_empty());
    }
}

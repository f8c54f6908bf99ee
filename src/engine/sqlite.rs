//! SQLite target: row-by-row upserts inside one transaction.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{MergeFailure, MirrorBackend, UpsertStrategy};
use crate::error::{SyncError, SyncResult};
use crate::schema::{Dialect, EntityMapping, ProjectedRow, SqlValue};

/// Most ids bound into a single `DELETE ... IN (...)`.
const DELETE_CHUNK_SIZE: usize = 500;

pub struct SqliteBackend {
    pool: SqlitePool,
    /// Called with the statement index after each write inside a transaction.
    #[cfg(test)]
    after_statement: Option<Box<dyn Fn(usize) + Send + Sync>>,
}

impl SqliteBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            #[cfg(test)]
            after_statement: None,
        }
    }

    /// Opens (creating if missing) the database named by a `sqlite:` URL.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        // Ensure parent directory exists
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn statement_done(&self, _index: usize) {
        #[cfg(test)]
        if let Some(hook) = &self.after_statement {
            hook(_index);
        }
    }
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &SqlValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Int(i) => query.bind(*i),
        SqlValue::BigInt(i) => query.bind(*i),
        SqlValue::Double(f) => query.bind(*f),
        SqlValue::Decimal(d) => query.bind(d.to_string()),
        SqlValue::Text(s) => query.bind(s.clone()),
        SqlValue::Uuid(u) => query.bind(u.to_string()),
        SqlValue::Timestamp(t) => query.bind(t.to_rfc3339_opts(SecondsFormat::Millis, true)),
    }
}

/// Maps a failed row statement to a merge failure, tying unique violations to `index`.
fn row_failure(err: sqlx::Error, index: usize) -> MergeFailure {
    let violation = err
        .as_database_error()
        .filter(|db| db.is_unique_violation())
        .map(|db| (db.constraint().map(str::to_string), db.message().to_string()));

    match violation {
        Some((constraint, detail)) => MergeFailure::UniqueViolation {
            constraint,
            offending_row: Some(index),
            detail,
            source: err,
        },
        None => MergeFailure::from(err),
    }
}

#[async_trait]
impl MirrorBackend for SqliteBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn strategy(&self) -> UpsertStrategy {
        UpsertStrategy::RowByRow
    }

    async fn ensure_table(&self, mapping: &EntityMapping) -> SyncResult<()> {
        sqlx::query(&mapping.create_table_statement(Dialect::Sqlite))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn merge_rows(
        &self,
        mapping: &EntityMapping,
        rows: &[ProjectedRow],
        cancel: &CancellationToken,
    ) -> Result<(), MergeFailure> {
        let statement = mapping.upsert_statement(Dialect::Sqlite);
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        // Dropping the transaction on an early return rolls it back.
        let mut tx = self.pool.begin().await?;
        for (index, row) in rows.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled.into());
            }

            let mut query = sqlx::query(&statement).bind(row.id.to_string());
            for value in &row.values {
                query = bind_value(query, value);
            }
            query = query.bind(now.clone()).bind(now.clone());

            if let Err(err) = query.execute(&mut *tx).await {
                return Err(row_failure(err, index));
            }
            self.statement_done(index);
        }

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled.into());
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_rows(
        &self,
        mapping: &EntityMapping,
        ids: &[Uuid],
        cancel: &CancellationToken,
    ) -> SyncResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;
        for (index, chunk) in ids.chunks(DELETE_CHUNK_SIZE).enumerate() {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let statement = mapping.delete_statement(Dialect::Sqlite, chunk.len());
            let mut query = sqlx::query(&statement);
            for id in chunk {
                query = query.bind(id.to_string());
            }
            deleted += query.execute(&mut *tx).await?.rows_affected();
            self.statement_done(index);
        }

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        tx.commit().await?;
        Ok(deleted)
    }
}

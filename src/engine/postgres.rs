//! Postgres target: binary `COPY` into a staging table, then one merge.

use async_trait::async_trait;
use sqlx::postgres::{PgDatabaseError, PgPool, PgPoolOptions};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{conflict, copy, MergeFailure, MirrorBackend, UpsertStrategy};
use crate::error::{SyncError, SyncResult};
use crate::schema::sql::{quote, staging_columns, MAX_IDENTIFIER_LEN};
use crate::schema::{Dialect, EntityMapping, ProjectedRow};

const STAGING_PREFIX: &str = "stg_";

pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Name of the transaction-scoped staging table for `table`.
pub fn staging_table_name(table: &str) -> String {
    let mut name = format!("{}{}", STAGING_PREFIX, table);
    name.truncate(MAX_IDENTIFIER_LEN);
    name
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), MergeFailure> {
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled.into());
    }
    Ok(())
}

/// Maps a failed merge to a merge failure, locating the offending row when possible.
///
/// A primary key violation cannot be pinned on a single row and is left unresolved.
fn merge_failure(err: sqlx::Error, mapping: &EntityMapping, rows: &[ProjectedRow]) -> MergeFailure {
    let violation = err
        .as_database_error()
        .filter(|db| db.is_unique_violation())
        .map(|db| {
            let detail = db
                .try_downcast_ref::<PgDatabaseError>()
                .and_then(|pg| pg.detail())
                .unwrap_or_else(|| db.message())
                .to_string();
            (db.constraint().map(str::to_string), detail)
        });

    let Some((constraint, detail)) = violation else {
        return MergeFailure::from(err);
    };

    let primary_key = format!("{}_pkey", mapping.table_name);
    let offending_row = if constraint.as_deref() == Some(primary_key.as_str()) {
        None
    } else {
        conflict::find_offending_row(mapping, rows, &detail)
    };

    MergeFailure::UniqueViolation {
        constraint,
        offending_row,
        detail,
        source: err,
    }
}

#[async_trait]
impl MirrorBackend for PostgresBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn strategy(&self) -> UpsertStrategy {
        UpsertStrategy::StagedBulk
    }

    async fn ensure_table(&self, mapping: &EntityMapping) -> SyncResult<()> {
        sqlx::query(&mapping.create_table_statement(Dialect::Postgres))
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
        let staging = staging_table_name(&mapping.table_name);

        // The staging table is dropped at commit; dropping the transaction rolls everything back.
        let mut tx = self.pool.begin().await?;

        ensure_live(cancel)?;
        sqlx::query(&mapping.staging_table_statement(Dialect::Postgres, &staging))
            .execute(&mut *tx)
            .await?;

        ensure_live(cancel)?;
        let statement = format!(
            "COPY {} ({}) FROM STDIN (FORMAT binary)",
            quote(&staging),
            staging_columns(mapping)
        );
        let mut copy_in = tx.copy_in_raw(&statement).await?;
        let sent = copy_in.send(copy::encode_rows(rows)).await.map(|_| ());
        if let Err(err) = sent {
            // Best effort; the transaction is abandoned either way.
            let _ = copy_in.abort("staging load failed").await;
            return Err(err.into());
        }
        copy_in.finish().await?;

        ensure_live(cancel)?;
        if let Err(err) = sqlx::query(&mapping.merge_statement(Dialect::Postgres, &staging))
            .execute(&mut *tx)
            .await
        {
            return Err(merge_failure(err, mapping, rows));
        }

        ensure_live(cancel)?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_rows(
        &self,
        mapping: &EntityMapping,
        ids: &[Uuid],
        cancel: &CancellationToken,
    ) -> SyncResult<u64> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let result = sqlx::query(&mapping.delete_statement(Dialect::Postgres, ids.len()))
            .bind(ids.to_vec())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#![forbid(unsafe_code)]

//! PostgreSQL adapter for the `tideflow` outbox store port (companion
//! crate).
//!
//! Bring your own `sqlx::PgPool`. The claim uses `FOR UPDATE SKIP LOCKED`
//! so concurrent workers never double-claim a row; timestamps are stored
//! as epoch seconds to match the core's clock seam.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::time::Duration;
use tideflow::{Error, OutboxEntry, OutboxStatus, OutboxStore, Pingable};
use uuid::Uuid;

/// DDL for the outbox table; apply it with your migration tooling.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS metadata_outbox (
    id            UUID PRIMARY KEY,
    entity_type   TEXT NOT NULL,
    entity_id     TEXT NOT NULL,
    metadata      JSONB NOT NULL,
    status        TEXT NOT NULL DEFAULT 'pending',
    retry_count   INTEGER NOT NULL DEFAULT 0,
    max_retries   INTEGER NOT NULL DEFAULT 10,
    next_retry_at BIGINT,
    last_error    TEXT,
    created_at    BIGINT NOT NULL,
    updated_at    BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metadata_outbox_claim
    ON metadata_outbox (status, next_retry_at, created_at);
"#;

fn store_err(err: sqlx::Error) -> Error {
    Error::Store(err.to_string())
}

fn status_from_str(raw: &str) -> Result<OutboxStatus, Error> {
    match raw {
        "pending" => Ok(OutboxStatus::Pending),
        "processing" => Ok(OutboxStatus::Processing),
        "published" => Ok(OutboxStatus::Published),
        "failed" => Ok(OutboxStatus::Failed),
        "dlq" => Ok(OutboxStatus::Dlq),
        other => Err(Error::Store(format!("unknown outbox status: {other}"))),
    }
}

/// Outbox table over a connection pool.
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl std::fmt::Debug for PgOutboxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PgOutboxStore")
    }
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Stage a new entry (status `pending`). Called by the command layer
    /// inside the same transaction as the entity write.
    pub async fn insert(&self, entry: &OutboxEntry) -> Result<(), Error> {
        sqlx::query(
            r#"INSERT INTO metadata_outbox
               (id, entity_type, entity_id, metadata, status, retry_count, max_retries,
                next_retry_at, last_error, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
        )
        .bind(entry.id)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.metadata)
        .bind(entry.status.as_str())
        .bind(entry.retry_count as i32)
        .bind(entry.max_retries as i32)
        .bind(entry.next_retry_at)
        .bind(&entry.last_error)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    fn entry_from_row(row: &sqlx::postgres::PgRow) -> Result<OutboxEntry, Error> {
        let status: String = row.try_get("status").map_err(store_err)?;
        Ok(OutboxEntry {
            id: row.try_get("id").map_err(store_err)?,
            entity_type: row.try_get("entity_type").map_err(store_err)?,
            entity_id: row.try_get("entity_id").map_err(store_err)?,
            metadata: row.try_get("metadata").map_err(store_err)?,
            status: status_from_str(&status)?,
            retry_count: row.try_get::<i32, _>("retry_count").map_err(store_err)? as u32,
            max_retries: row.try_get::<i32, _>("max_retries").map_err(store_err)? as u32,
            next_retry_at: row.try_get("next_retry_at").map_err(store_err)?,
            last_error: row.try_get("last_error").map_err(store_err)?,
            created_at: row.try_get("created_at").map_err(store_err)?,
            updated_at: row.try_get("updated_at").map_err(store_err)?,
        })
    }
}

#[async_trait]
impl Pingable for PgOutboxStore {
    async fn ping(&self) -> Result<(), Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(store_err)?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn claim_pending_batch(
        &self,
        limit: usize,
        now: i64,
        stale_processing: Duration,
    ) -> Result<Vec<OutboxEntry>, Error> {
        let stale_before = now - stale_processing.as_secs() as i64;
        let rows = sqlx::query(
            r#"WITH claimable AS (
                   SELECT id FROM metadata_outbox
                   WHERE (
                       status IN ('pending', 'failed')
                       AND (next_retry_at IS NULL OR next_retry_at <= $1)
                   ) OR (
                       status = 'processing' AND updated_at < $2
                   )
                   ORDER BY created_at
                   LIMIT $3
                   FOR UPDATE SKIP LOCKED
               )
               UPDATE metadata_outbox o
               SET status = 'processing', updated_at = $1
               FROM claimable c
               WHERE o.id = c.id
               RETURNING o.*"#,
        )
        .bind(now)
        .bind(stale_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter().map(Self::entry_from_row).collect()
    }

    async fn mark_published(&self, id: Uuid, now: i64) -> Result<(), Error> {
        sqlx::query(
            "UPDATE metadata_outbox SET status = 'published', updated_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        retry_count: u32,
        next_retry_at: i64,
        now: i64,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"UPDATE metadata_outbox
               SET status = 'failed', retry_count = $2, next_retry_at = $3,
                   last_error = $4, updated_at = $5
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(retry_count as i32)
        .bind(next_retry_at)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn mark_dlq(
        &self,
        id: Uuid,
        error: &str,
        retry_count: u32,
        now: i64,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"UPDATE metadata_outbox
               SET status = 'dlq', retry_count = $2, last_error = $3, updated_at = $4
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(retry_count as i32)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn delete_old_entries(&self, older_than: i64) -> Result<u64, Error> {
        let result = sqlx::query(
            "DELETE FROM metadata_outbox WHERE status IN ('published', 'dlq') AND updated_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Processing,
            OutboxStatus::Published,
            OutboxStatus::Failed,
            OutboxStatus::Dlq,
        ] {
            assert_eq!(status_from_str(status.as_str()).unwrap(), status);
        }
        assert!(status_from_str("archived").is_err());
    }
}

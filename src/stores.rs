//! Store ports the workers are written against.
//!
//! The command vocabulary mirrors what the backing products offer (GET /
//! SET-EX / TTL, ZADD / ZRANGEBYSCORE / ZREM, SETNX, claim-and-mark outbox
//! rows, find/create documents) without naming a driver. Companion crates
//! adapt real clients; `memory` adapters back the tests.

use crate::domain::OutboxEntry;
use crate::error::Error;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Anything the health gates can ping.
#[async_trait]
pub trait Pingable: Send + Sync {
    async fn ping(&self) -> Result<(), Error>;
}

/// Remaining lifetime of a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist.
    Missing,
    /// The key exists without an expiry.
    Persistent,
    /// The key expires after this duration.
    Expires(Duration),
}

/// Balance entry lifecycle in the fast path.
#[async_trait]
pub trait BalanceCache: Pingable {
    /// JSON payload of a cached balance, if present.
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl, Error>;
}

/// The balance-sync schedule: members ordered by due-at epoch second.
#[async_trait]
pub trait SyncSchedule: Send + Sync {
    async fn add(&self, member: &str, due_at: i64) -> Result<(), Error>;

    /// Members with score at or below `now`, oldest first, capped at
    /// `limit`.
    async fn due_members(&self, now: i64, limit: usize) -> Result<Vec<String>, Error>;

    /// Score of the earliest member, if any.
    async fn next_due(&self) -> Result<Option<i64>, Error>;

    async fn remove(&self, member: &str) -> Result<(), Error>;
}

/// Set-if-not-exists lock with TTL-based reclaim. Release is conditional
/// on the holder id, so an expired lock cannot be released by its former
/// owner.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Returns `Ok(true)` when this holder acquired the lock.
    async fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, Error>;

    /// Compare-and-delete; returns `Ok(true)` when this holder released it.
    async fn release(&self, key: &str, holder: &str) -> Result<bool, Error>;
}

/// The map of in-flight transaction records swept for staleness.
#[async_trait]
pub trait StaleQueue: Send + Sync {
    /// Full snapshot: `(field, raw JSON payload)` pairs.
    async fn snapshot(&self) -> Result<Vec<(String, String)>, Error>;
}

/// Relational handle for the primary ledger. The workers only need its
/// reachability; row access belongs to the command use case.
pub trait LedgerStore: Pingable {}

/// Outbox table surface.
#[async_trait]
pub trait OutboxStore: Pingable {
    /// Atomically claim up to `limit` rows that are pending, or processing
    /// but stale for longer than `stale_processing`, and whose
    /// `next_retry_at` is due. Claimed rows come back with
    /// `status = processing` and `updated_at = now`.
    async fn claim_pending_batch(
        &self,
        limit: usize,
        now: i64,
        stale_processing: Duration,
    ) -> Result<Vec<OutboxEntry>, Error>;

    async fn mark_published(&self, id: Uuid, now: i64) -> Result<(), Error>;

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        retry_count: u32,
        next_retry_at: i64,
        now: i64,
    ) -> Result<(), Error>;

    async fn mark_dlq(&self, id: Uuid, error: &str, retry_count: u32, now: i64)
        -> Result<(), Error>;

    /// Remove terminal rows whose `updated_at` is older than `older_than`.
    /// Returns the number of rows deleted.
    async fn delete_old_entries(&self, older_than: i64) -> Result<u64, Error>;
}

/// Document store surface used by the outbox worker.
#[async_trait]
pub trait DocumentStore: Pingable {
    /// Idempotency probe: the stored metadata for an entity, if any.
    async fn find_by_entity(&self, collection: &str, entity_id: &str)
        -> Result<Option<Value>, Error>;

    async fn create(
        &self,
        collection: &str,
        entity_id: &str,
        document: &Value,
    ) -> Result<(), Error>;
}

//! Worker configuration.
//!
//! Plain data with deployment-profile defaults; loading (env, files,
//! flags) belongs to the embedding service. Every cadence and bound the
//! workers honor is enumerated here so a deployment can be audited from
//! one struct.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::health::HealthCheckerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Name of the distributed lock serializing the balance reconciliation
/// job across pods, and its TTL. The job itself runs in the command
/// layer; the lock vocabulary lives here with the other coordination
/// points.
pub const RECONCILE_LOCK_KEY: &str = "reconcile_balance_status";
pub const RECONCILE_LOCK_TTL: Duration = Duration::from_secs(55 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceSyncConfig {
    pub enabled: bool,
    /// Width of the per-sweep worker pool.
    pub max_workers: usize,
    /// Due members pulled per sweep.
    pub batch_size: usize,
    /// Upper bound on the idle sleep when nothing is due.
    pub idle_wait: Duration,
    /// Deadline for one full sweep iteration; shorter than any lock TTL
    /// held elsewhere so the worker always makes forward progress.
    pub iteration_deadline: Duration,
}

impl Default for BalanceSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_workers: 5,
            batch_size: 100,
            idle_wait: Duration::from_secs(600),
            iteration_deadline: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Concurrent handler tasks per queue.
    pub workers: usize,
    /// Per-channel prefetch.
    pub prefetch: u16,
    /// Primary-path republish budget for infrastructure failures.
    pub max_retries: i64,
    /// Base of the in-memory exponential delay before a republish.
    pub retry_backoff: Duration,
    pub retry_backoff_cap: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            prefetch: 10,
            max_retries: 4,
            retry_backoff: Duration::from_secs(1),
            retry_backoff_cap: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
    /// Deliveries processed per tick.
    pub batch_size: usize,
    pub prefetch: u16,
    /// Replays after which a message is dropped as permanently lost.
    pub max_retries: i64,
    /// Floor of the replay ladder.
    pub initial_backoff: Duration,
    /// Cap of the replay ladder.
    pub max_backoff: Duration,
    /// How long to wait for the broker's publish confirm.
    pub publish_confirm_timeout: Duration,
    /// Budget for the pre-tick store pings.
    pub health_check_timeout: Duration,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(10),
            batch_size: 10,
            prefetch: 10,
            max_retries: 10,
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(30 * 60),
            publish_confirm_timeout: Duration::from_secs(10),
            health_check_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub enabled: bool,
    pub max_workers: usize,
    /// Terminal rows older than this many days are removed by cleanup.
    pub retention_days: u32,
    pub poll_interval: Duration,
    pub cleanup_interval: Duration,
    /// Processing rows untouched for longer than this are reclaimable.
    pub stale_processing: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Additive jitter fraction applied to the retry backoff.
    pub jitter_factor: f64,
    /// Per-entry processing deadline.
    pub entry_deadline: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_workers: 5,
            retention_days: 7,
            poll_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(3_600),
            stale_processing: Duration::from_secs(10 * 60),
            max_retries: 10,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30 * 60),
            jitter_factor: 0.2,
            entry_deadline: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StaleTxConfig {
    pub poll_interval: Duration,
    /// Records younger than this are still the primary flow's business.
    pub age_threshold: Duration,
    pub max_workers: usize,
    /// Per-transaction lock lifetime; locks are reclaimed by expiry, not
    /// released.
    pub lock_ttl: Duration,
    pub message_deadline: Duration,
}

impl Default for StaleTxConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30 * 60),
            age_threshold: Duration::from_secs(30 * 60),
            max_workers: 100,
            lock_ttl: Duration::from_secs(25 * 60),
            message_deadline: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    pub enabled: bool,
    /// Service name used when listing active tenants.
    pub service_name: String,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self { enabled: false, service_name: "transaction".to_string() }
    }
}

/// Everything the execution core can be tuned with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub balance_sync: BalanceSyncConfig,
    pub consumer: ConsumerConfig,
    pub dlq: DlqConfig,
    pub outbox: OutboxConfig,
    pub stale_tx: StaleTxConfig,
    pub breaker: CircuitBreakerConfig,
    pub health_check: HealthCheckerConfig,
    /// Cadence of the balance reconciliation job (command layer).
    pub reconcile_period: Duration,
    pub multi_tenant: TenantConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            balance_sync: BalanceSyncConfig::default(),
            consumer: ConsumerConfig::default(),
            dlq: DlqConfig::default(),
            outbox: OutboxConfig::default(),
            stale_tx: StaleTxConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            health_check: HealthCheckerConfig::default(),
            reconcile_period: Duration::from_secs(3_600),
            multi_tenant: TenantConfig::default(),
        }
    }
}

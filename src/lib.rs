#![forbid(unsafe_code)]

//! # Tideflow
//!
//! Asynchronous execution core for a multi-store ledger: the long-running
//! workers that keep balance mutations, metadata, and stuck transactions
//! propagating between the durable relational store, the fast cache path,
//! the message broker, and the document store — eventually and
//! exactly-once-effective, across restarts and partial failures.
//!
//! ## Subsystems
//!
//! - [`BalanceSyncWorker`] — flushes soon-to-expire cached balances back
//!   to the durable store before their TTL lapses.
//! - [`MultiQueueConsumer`] — drains the balance-create and
//!   balance-operation queues with bounded retries; rejected messages
//!   flow to per-queue dead-letter queues.
//! - [`DlqConsumer`] — gated dead-letter drain with tiered backoff and a
//!   capped replay budget.
//! - [`StaleTransactionSweeper`] — re-drives aged in-flight transactions
//!   under a per-transaction distributed lock.
//! - [`MetadataOutboxWorker`] — transactional-outbox propagation to the
//!   document store with a retry ladder and a dead-letter terminal state.
//!
//! A [`CircuitBreaker`] with an active [`HealthChecker`] guards every
//! broker publish; a [`TenantResolver`] swaps store handles per unit of
//! work in multi-tenant deployments; the [`Launcher`] supervises the lot.
//!
//! ## Ports
//!
//! The core never links a driver. Brokers, caches, stores, and the
//! command use case are trait seams ([`broker`], [`stores`],
//! [`usecase`]); companion crates adapt real clients, and [`memory`]
//! provides complete in-memory adapters for tests and local runs.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use tideflow::prelude::*;
//! use tideflow::memory::{MemoryBroker, MemoryCache, MemoryLedger, RecordingCommands};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tideflow::Error> {
//!     let config = CoreConfig::default();
//!     let broker = Arc::new(MemoryBroker::new());
//!     let breaker = CircuitBreaker::new("broker", config.breaker.clone());
//!     let publisher = Publisher::guarded(broker.clone(), breaker);
//!
//!     let consumer = MultiQueueConsumer::new(
//!         config.consumer.clone(),
//!         broker.clone(),
//!         publisher,
//!         Arc::new(TenantResolver::disabled()),
//!         vec![QueueBinding::new("balance_create", HandlerKind::BalanceCreate)],
//!     );
//!     consumer.set_commands(Arc::new(RecordingCommands::new()));
//!
//!     let dlq = DlqConsumer::new(
//!         config.dlq.clone(),
//!         broker.clone(),
//!         Publisher::direct(broker.clone()),
//!         Arc::new(MemoryLedger::new()),
//!         Arc::new(MemoryCache::default()),
//!         vec!["balance_create".into()],
//!     );
//!
//!     let launcher = Launcher::new()
//!         .register(Arc::new(consumer))
//!         .register(Arc::new(dlq));
//!     // launcher.run().await runs until SIGINT/SIGTERM; give tests a
//!     // custom trigger instead:
//!     launcher.run_with_signal(async {}).await
//! }
//! ```

mod backoff;
mod balance_sync;
mod broker;
mod circuit_breaker;
mod clock;
mod config;
mod consumer;
mod dlq;
mod domain;
mod error;
mod health;
mod launcher;
mod messages;
mod outbox;
mod sleeper;
mod stale_tx;
mod stores;
mod tenant;
mod usecase;

pub mod memory;
pub mod telemetry;

// Re-exports
pub use backoff::{dlq_replay_delay, Backoff};
pub use balance_sync::BalanceSyncWorker;
pub use broker::{
    dlq_queue_name, Acknowledger, Confirmation, Delivery, HeaderValue, Headers, Publisher,
    QueuePublisher, QueueSubscriber, TenantPublishers, DLQ_SUFFIX, HEADER_CONTENT_TYPE,
    HEADER_CORRELATION_ID, HEADER_DLQ_ORIGINAL_QUEUE, HEADER_DLQ_REASON, HEADER_DLQ_RETRY_COUNT,
    HEADER_DLQ_TIMESTAMP, HEADER_REQUEST_ID, HEADER_RETRY_COUNT, HEADER_TENANT_ID,
};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, Counts,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BalanceSyncConfig, ConsumerConfig, CoreConfig, DlqConfig, OutboxConfig, StaleTxConfig,
    TenantConfig, RECONCILE_LOCK_KEY, RECONCILE_LOCK_TTL,
};
pub use consumer::{HandlerKind, MultiQueueConsumer, QueueBinding};
pub use dlq::DlqConsumer;
pub use domain::{
    balance_cache_key, parse_schedule_member, Balance, OutboxEntry, OutboxStatus,
    StaleTransactionRecord, BALANCE_CACHE_TTL, BALANCE_KEY_PREFIX,
};
pub use error::{looks_like_infrastructure, Error, ErrorKind};
pub use health::{FnProbe, HealthChecker, HealthCheckerConfig, HealthProbe};
pub use launcher::{Launcher, Worker};
pub use messages::{BalanceCreateMessage, BalanceOperationMessage, QueueItem};
pub use outbox::MetadataOutboxWorker;
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use stale_tx::{replay_lock_key, StaleTransactionSweeper};
pub use stores::{
    BalanceCache, DistributedLock, DocumentStore, KeyTtl, LedgerStore, OutboxStore, Pingable,
    StaleQueue, SyncSchedule,
};
pub use tenant::TenantResolver;
pub use usecase::{
    ExecutionContext, SyncOutcome, TenantDirectory, TenantStores, TenantSummary,
    TransactionCommands,
};

pub mod prelude;

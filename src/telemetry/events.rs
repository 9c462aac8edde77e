//! Structured events emitted by the workers.
//!
//! Events are grouped per subsystem the same way the workers are split.
//! Sinks turn them into counters and gauges; the `Display` impls keep log
//! lines readable without a sink.

use crate::circuit_breaker::{CircuitState, Counts};
use crate::error::ErrorKind;
use std::fmt;
use uuid::Uuid;

/// Top-level event type consumed by [`super::MetricsSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Breaker(BreakerEvent),
    Consumer(ConsumerEvent),
    Dlq(DlqEvent),
    BalanceSync(BalanceSyncEvent),
    StaleTx(StaleTxEvent),
    Outbox(OutboxEvent),
    Tenant(TenantEvent),
    Failure(FailureEvent),
}

/// Circuit breaker state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerEvent {
    /// The breaker moved between states. `counts` is the snapshot taken
    /// before the transition reset them.
    Transition {
        service: String,
        from: CircuitState,
        to: CircuitState,
        counts: Counts,
    },
    /// A health probe completed.
    Probe { service: String, healthy: bool },
}

/// Multi-queue consumer outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    /// Message failed wire-format validation and was dropped to the DLQ path.
    ValidationRejected { queue: String },
    /// Infrastructure failure triggered a republish with a bumped retry header.
    Retried { queue: String, attempt: i64 },
    /// Message was published to the queue's dead-letter sibling.
    DeadLettered { queue: String, reason: String },
    /// Handler completed and the delivery was acked.
    Handled { queue: String },
}

/// Dead-letter consumer outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DlqEvent {
    /// Replay published to the original queue and confirmed by the broker.
    Replayed { queue: String, attempt: i64 },
    /// Delivery named an original queue outside the allow-list.
    UnknownQueueDropped { queue: String },
    /// Replay budget exhausted; the message is permanently lost.
    MessageLost { queue: String },
    /// A poll tick finished.
    TickCompleted { queue: String, processed: usize },
}

/// Balance sync sweep outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalanceSyncEvent {
    /// A cached balance was flushed to the durable store.
    Synced { organization: Uuid, ledger: Uuid },
    /// A schedule member was dropped without a sync.
    MemberDropped { member: String, reason: MemberDropReason },
}

/// Why a schedule member was removed without syncing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberDropReason {
    /// The cache entry no longer exists.
    MissingEntry,
    /// The cache payload failed to decode.
    CorruptPayload,
    /// The member string did not contain an organization/ledger id pair.
    UnparsableKey,
}

impl MemberDropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberDropReason::MissingEntry => "missing_entry",
            MemberDropReason::CorruptPayload => "corrupt_payload",
            MemberDropReason::UnparsableKey => "unparsable_key",
        }
    }
}

/// Stale-transaction sweeper outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleTxEvent {
    /// An aged transaction was re-driven through the async executor.
    Replayed { organization: Uuid, ledger: Uuid },
    /// The per-transaction lock was already held by another instance.
    LockContended { transaction: Uuid },
}

/// Metadata outbox outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxEvent {
    Published { entity_type: String },
    RetryScheduled { entity_type: String, retry_count: u32 },
    DeadLettered { entity_type: String },
    Cleaned { deleted: u64 },
}

/// Per-tenant store resolution outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantEvent {
    ConnectionEstablished { tenant: String, store: TenantStoreKind },
    ConnectionError { tenant: String, store: TenantStoreKind },
}

/// Which store handle a tenant event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantStoreKind {
    Relational,
    Document,
}

impl TenantStoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStoreKind::Relational => "postgresql",
            TenantStoreKind::Document => "mongodb",
        }
    }
}

/// Classified failures, labeled `{service, error_kind}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureEvent {
    pub service: String,
    pub kind: ErrorKind,
}

impl fmt::Display for WorkerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerEvent::Breaker(e) => write!(f, "Breaker::{}", e),
            WorkerEvent::Consumer(e) => write!(f, "Consumer::{}", e),
            WorkerEvent::Dlq(e) => write!(f, "Dlq::{}", e),
            WorkerEvent::BalanceSync(e) => write!(f, "BalanceSync::{}", e),
            WorkerEvent::StaleTx(e) => write!(f, "StaleTx::{}", e),
            WorkerEvent::Outbox(e) => write!(f, "Outbox::{}", e),
            WorkerEvent::Tenant(e) => write!(f, "Tenant::{}", e),
            WorkerEvent::Failure(e) => {
                write!(f, "Failure(service={}, kind={})", e.service, e.kind.as_str())
            }
        }
    }
}

impl fmt::Display for BreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerEvent::Transition { service, from, to, counts } => write!(
                f,
                "Transition({service}: {from:?} -> {to:?}, requests={}, failures={})",
                counts.requests, counts.total_failures
            ),
            BreakerEvent::Probe { service, healthy } => {
                write!(f, "Probe({service}, healthy={healthy})")
            }
        }
    }
}

impl fmt::Display for ConsumerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerEvent::ValidationRejected { queue } => {
                write!(f, "ValidationRejected({queue})")
            }
            ConsumerEvent::Retried { queue, attempt } => {
                write!(f, "Retried({queue}, attempt={attempt})")
            }
            ConsumerEvent::DeadLettered { queue, reason } => {
                write!(f, "DeadLettered({queue}, reason={reason})")
            }
            ConsumerEvent::Handled { queue } => write!(f, "Handled({queue})"),
        }
    }
}

impl fmt::Display for DlqEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DlqEvent::Replayed { queue, attempt } => {
                write!(f, "Replayed({queue}, attempt={attempt})")
            }
            DlqEvent::UnknownQueueDropped { queue } => {
                write!(f, "UnknownQueueDropped({queue})")
            }
            DlqEvent::MessageLost { queue } => write!(f, "MessageLost({queue})"),
            DlqEvent::TickCompleted { queue, processed } => {
                write!(f, "TickCompleted({queue}, processed={processed})")
            }
        }
    }
}

impl fmt::Display for BalanceSyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalanceSyncEvent::Synced { organization, ledger } => {
                write!(f, "Synced(org={organization}, ledger={ledger})")
            }
            BalanceSyncEvent::MemberDropped { member, reason } => {
                write!(f, "MemberDropped({member}, reason={})", reason.as_str())
            }
        }
    }
}

impl fmt::Display for StaleTxEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleTxEvent::Replayed { organization, ledger } => {
                write!(f, "Replayed(org={organization}, ledger={ledger})")
            }
            StaleTxEvent::LockContended { transaction } => {
                write!(f, "LockContended({transaction})")
            }
        }
    }
}

impl fmt::Display for OutboxEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutboxEvent::Published { entity_type } => write!(f, "Published({entity_type})"),
            OutboxEvent::RetryScheduled { entity_type, retry_count } => {
                write!(f, "RetryScheduled({entity_type}, retry={retry_count})")
            }
            OutboxEvent::DeadLettered { entity_type } => {
                write!(f, "DeadLettered({entity_type})")
            }
            OutboxEvent::Cleaned { deleted } => write!(f, "Cleaned({deleted})"),
        }
    }
}

impl fmt::Display for TenantEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantEvent::ConnectionEstablished { tenant, store } => {
                write!(f, "ConnectionEstablished({tenant}, store={})", store.as_str())
            }
            TenantEvent::ConnectionError { tenant, store } => {
                write!(f, "ConnectionError({tenant}, store={})", store.as_str())
            }
        }
    }
}

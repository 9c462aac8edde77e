//! Telemetry for the execution core.
//!
//! Workers emit [`WorkerEvent`]s at every externally observable outcome:
//! breaker transitions, consumer dispositions, DLQ replays, sync sweeps,
//! outbox transitions, and tenant resolution. Events flow through a
//! [`MetricsSink`] which can log, aggregate, or export them.

pub mod events;
pub mod sinks;

pub use events::{
    BalanceSyncEvent, BreakerEvent, ConsumerEvent, DlqEvent, FailureEvent, MemberDropReason,
    OutboxEvent, StaleTxEvent, TenantEvent, TenantStoreKind, WorkerEvent,
};
pub use sinks::{LogSink, MemorySink, MetricsSink, NullSink};

//! Convenient re-exports for the working set.
pub use crate::{
    Balance, BalanceCache, BalanceSyncWorker, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerRegistry, CircuitState, Clock, Confirmation, CoreConfig, Delivery,
    DistributedLock, DlqConsumer, DocumentStore, Error, ErrorKind, ExecutionContext,
    HandlerKind, Headers, HealthChecker, HealthCheckerConfig, HealthProbe, Launcher,
    MetadataOutboxWorker, MultiQueueConsumer, OutboxEntry, OutboxStatus, OutboxStore,
    Publisher, QueueBinding, QueuePublisher, QueueSubscriber, Sleeper, StaleQueue,
    StaleTransactionSweeper, SyncOutcome, SyncSchedule, TenantDirectory, TenantResolver,
    TransactionCommands, Worker,
};
pub use crate::telemetry::{LogSink, MemorySink, MetricsSink, NullSink, WorkerEvent};

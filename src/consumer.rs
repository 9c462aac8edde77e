//! Multi-queue broker consumer.
//!
//! One channel per registered queue, each drained in a `select!` with
//! shutdown and dispatched to the queue's handler through a bounded task
//! pool. Handler outcomes decide settlement:
//!
//! - validation failure: nack without requeue (the broker's dead-letter
//!   topology owns the message from there);
//! - infrastructure failure: republish with a bumped retry header after an
//!   in-memory backoff, up to the retry budget, then dead-letter;
//! - business failure: dead-letter immediately;
//! - tenant resolution failure: nack with requeue so the resolver gets
//!   another chance on redelivery.
//!
//! The command use case is wired after construction (the use case itself
//! owns repositories built around this consumer), so `run` refuses to
//! start until `set_commands` has been called.

use crate::backoff::Backoff;
use crate::broker::{
    dlq_queue_name, Delivery, Headers, Publisher, QueueSubscriber, HEADER_DLQ_ORIGINAL_QUEUE,
    HEADER_DLQ_REASON, HEADER_DLQ_RETRY_COUNT, HEADER_DLQ_TIMESTAMP, HEADER_RETRY_COUNT,
    HEADER_TENANT_ID,
};
use crate::clock::{Clock, SystemClock};
use crate::config::ConsumerConfig;
use crate::error::{Error, ErrorKind};
use crate::messages::{BalanceCreateMessage, BalanceOperationMessage};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{ConsumerEvent, FailureEvent, MetricsSink, NullSink, WorkerEvent};
use crate::tenant::TenantResolver;
use crate::usecase::{ExecutionContext, TransactionCommands};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

const SERVICE: &str = "consumer";

/// Which wire format and use-case entry point a queue is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    BalanceCreate,
    BalanceOperation,
}

/// A queue registered with the consumer.
#[derive(Debug, Clone)]
pub struct QueueBinding {
    pub queue: String,
    pub kind: HandlerKind,
}

impl QueueBinding {
    pub fn new(queue: impl Into<String>, kind: HandlerKind) -> Self {
        Self { queue: queue.into(), kind }
    }
}

#[derive(Clone)]
pub struct MultiQueueConsumer {
    config: ConsumerConfig,
    subscriber: Arc<dyn QueueSubscriber>,
    publisher: Publisher,
    resolver: Arc<TenantResolver>,
    bindings: Vec<QueueBinding>,
    commands: Arc<Mutex<Option<Arc<dyn TransactionCommands>>>>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    sink: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for MultiQueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiQueueConsumer").field("bindings", &self.bindings).finish()
    }
}

impl MultiQueueConsumer {
    pub fn new(
        config: ConsumerConfig,
        subscriber: Arc<dyn QueueSubscriber>,
        publisher: Publisher,
        resolver: Arc<TenantResolver>,
        bindings: Vec<QueueBinding>,
    ) -> Self {
        Self {
            config,
            subscriber,
            publisher,
            resolver,
            bindings,
            commands: Arc::new(Mutex::new(None)),
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Deferred wiring: install the command use case before `run`.
    pub fn set_commands(&self, commands: Arc<dyn TransactionCommands>) {
        *self.commands.lock().unwrap_or_else(|p| p.into_inner()) = Some(commands);
    }

    fn commands(&self) -> Result<Arc<dyn TransactionCommands>, Error> {
        self.commands
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| Error::Config("consumer started before commands were wired".into()))
    }

    /// Consume all bound queues until shutdown.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        // Fail fast if wiring was forgotten.
        self.commands()?;

        let mut drains: JoinSet<()> = JoinSet::new();
        for binding in self.bindings.clone() {
            let mut deliveries = self
                .subscriber
                .subscribe(&binding.queue, self.config.prefetch)
                .await?;
            let consumer = self.clone();
            let mut shutdown = shutdown.clone();
            drains.spawn(async move {
                let semaphore = Arc::new(Semaphore::new(consumer.config.workers.max(1)));
                let mut handlers: JoinSet<()> = JoinSet::new();
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        received = deliveries.recv() => {
                            let Some(delivery) = received else { break };
                            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                                break;
                            };
                            let consumer = consumer.clone();
                            let kind = binding.kind;
                            handlers.spawn(async move {
                                let _permit = permit;
                                consumer.dispatch(delivery, kind).await;
                            });
                        }
                    }
                }
                // Let in-flight handlers settle their deliveries.
                while let Some(joined) = handlers.join_next().await {
                    if let Err(err) = joined {
                        if err.is_panic() {
                            tracing::error!(%err, "consumer handler panicked");
                        }
                    }
                }
            });
        }

        while drains.join_next().await.is_some() {}
        Ok(())
    }

    /// Handle one delivery end to end, including settlement.
    pub async fn dispatch(&self, delivery: Delivery, kind: HandlerKind) {
        let commands = match self.commands() {
            Ok(commands) => commands,
            Err(err) => {
                tracing::error!(%err, "dropping delivery: no commands wired");
                let _ = delivery.nack(true).await;
                return;
            }
        };

        let queue = delivery.queue.clone();

        // Multi-tenant deployments resolve per-tenant handles before the
        // use case runs; failures requeue the delivery untouched.
        let tenant = delivery.headers.get_str(HEADER_TENANT_ID).unwrap_or("");
        let ctx = match self.resolver.resolve(ExecutionContext::for_tenant(tenant)).await {
            Ok(ctx) => ctx,
            Err(err) => {
                tracing::warn!(%queue, %err, "tenant resolution failed; requeueing");
                self.record_failure(err.kind());
                if let Err(nack_err) = delivery.nack(true).await {
                    tracing::error!(%queue, %nack_err, "failed to requeue delivery");
                }
                return;
            }
        };

        let outcome = self.invoke(&commands, &ctx, &delivery, kind).await;

        match outcome {
            Ok(()) => {
                self.sink
                    .record(&WorkerEvent::Consumer(ConsumerEvent::Handled { queue: queue.clone() }));
                if let Err(err) = delivery.ack().await {
                    tracing::error!(%queue, %err, "failed to ack delivery");
                }
            }
            Err(err) => self.settle_failure(delivery, err).await,
        }
    }

    async fn invoke(
        &self,
        commands: &Arc<dyn TransactionCommands>,
        ctx: &ExecutionContext,
        delivery: &Delivery,
        kind: HandlerKind,
    ) -> Result<(), Error> {
        match kind {
            HandlerKind::BalanceCreate => {
                let message = BalanceCreateMessage::from_json(&delivery.body)?;
                message.validate()?;
                commands.create_balance(ctx, &message).await
            }
            HandlerKind::BalanceOperation => {
                let message = BalanceOperationMessage::from_msgpack(&delivery.body)?;
                message.validate()?;
                commands.create_balance_operations(ctx, &message).await
            }
        }
    }

    async fn settle_failure(&self, delivery: Delivery, err: Error) {
        let queue = delivery.queue.clone();
        let kind = err.kind();
        self.record_failure(kind);

        match kind {
            ErrorKind::Validation => {
                tracing::warn!(%queue, %err, "message failed validation");
                self.sink.record(&WorkerEvent::Consumer(ConsumerEvent::ValidationRejected {
                    queue: queue.clone(),
                }));
                if let Err(nack_err) = delivery.nack(false).await {
                    tracing::error!(%queue, %nack_err, "failed to reject delivery");
                }
            }
            ErrorKind::Infrastructure => self.retry_or_dead_letter(delivery, &err).await,
            ErrorKind::TransientResolution => {
                tracing::warn!(%queue, %err, "transient resolution failure; requeueing");
                if let Err(nack_err) = delivery.nack(true).await {
                    tracing::error!(%queue, %nack_err, "failed to requeue delivery");
                }
            }
            ErrorKind::Business | ErrorKind::Fatal => {
                tracing::warn!(%queue, %err, "terminal handler failure; dead-lettering");
                self.dead_letter(delivery, &err).await;
            }
        }
    }

    /// Infrastructure path: bounded republish with exponential delay, then
    /// the dead-letter queue.
    async fn retry_or_dead_letter(&self, delivery: Delivery, err: &Error) {
        let queue = delivery.queue.clone();
        let attempts = delivery.headers.get_i64(HEADER_RETRY_COUNT).unwrap_or(0).max(0);

        if attempts >= self.config.max_retries {
            tracing::warn!(%queue, attempts, %err, "retry budget exhausted; dead-lettering");
            self.dead_letter(delivery, err).await;
            return;
        }

        let next_attempt = attempts + 1;
        let delay = Backoff::exponential(self.config.retry_backoff, self.config.retry_backoff_cap)
            .base_delay(next_attempt as u32);
        self.sleeper.sleep(delay).await;

        let mut headers = delivery.headers.clone();
        headers.insert(HEADER_RETRY_COUNT, crate::broker::HeaderValue::Int64(next_attempt));

        match self.publisher.publish(&queue, &delivery.body, &headers).await {
            Ok(()) => {
                self.sink.record(&WorkerEvent::Consumer(ConsumerEvent::Retried {
                    queue: queue.clone(),
                    attempt: next_attempt,
                }));
                if let Err(ack_err) = delivery.ack().await {
                    tracing::error!(%queue, %ack_err, "failed to ack retried delivery");
                }
            }
            Err(publish_err) => {
                // Keep the original delivery alive rather than losing it.
                tracing::warn!(%queue, %publish_err, "retry republish failed; requeueing");
                if let Err(nack_err) = delivery.nack(true).await {
                    tracing::error!(%queue, %nack_err, "failed to requeue delivery");
                }
            }
        }
    }

    async fn dead_letter(&self, delivery: Delivery, err: &Error) {
        let queue = delivery.queue.clone();
        let dlq = dlq_queue_name(&queue);
        let reason = err.kind().as_str();

        let mut headers = delivery.headers.clone();
        headers.remove(HEADER_RETRY_COUNT);
        headers.insert(HEADER_DLQ_ORIGINAL_QUEUE, crate::broker::HeaderValue::Text(queue.clone()));
        headers.insert(HEADER_DLQ_RETRY_COUNT, crate::broker::HeaderValue::Int64(0));
        headers.insert(
            HEADER_DLQ_TIMESTAMP,
            crate::broker::HeaderValue::Int64(self.clock.now_secs()),
        );
        headers.insert(HEADER_DLQ_REASON, crate::broker::HeaderValue::Text(reason.to_string()));

        match self.publisher.publish(&dlq, &delivery.body, &headers).await {
            Ok(()) => {
                self.sink.record(&WorkerEvent::Consumer(ConsumerEvent::DeadLettered {
                    queue: queue.clone(),
                    reason: reason.to_string(),
                }));
                if let Err(ack_err) = delivery.ack().await {
                    tracing::error!(%queue, %ack_err, "failed to ack dead-lettered delivery");
                }
            }
            Err(publish_err) => {
                tracing::error!(%queue, %publish_err, "dead-letter publish failed; requeueing");
                if let Err(nack_err) = delivery.nack(true).await {
                    tracing::error!(%queue, %nack_err, "failed to requeue delivery");
                }
            }
        }
    }

    fn record_failure(&self, kind: ErrorKind) {
        self.sink.record(&WorkerEvent::Failure(FailureEvent {
            service: SERVICE.to_string(),
            kind,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::QueuePublisher;
    use crate::clock::ManualClock;
    use crate::memory::{MemoryBroker, RecordingCommands};
    use crate::messages::QueueItem;
    use crate::sleeper::TrackingSleeper;
    use crate::telemetry::MemorySink;
    use crate::usecase::{TenantDirectory, TenantSummary};
    use async_trait::async_trait;
    use std::time::Duration;
    use uuid::Uuid;

    const NOW: i64 = 1_700_000_000;
    const QUEUE: &str = "balance_create";

    struct Fixture {
        consumer: MultiQueueConsumer,
        broker: MemoryBroker,
        commands: RecordingCommands,
        sink: MemorySink,
        sleeper: TrackingSleeper,
    }

    fn fixture_with_resolver(resolver: TenantResolver) -> Fixture {
        let broker = MemoryBroker::new();
        let commands = RecordingCommands::new();
        let sink = MemorySink::new();
        let sleeper = TrackingSleeper::new();
        let consumer = MultiQueueConsumer::new(
            ConsumerConfig::default(),
            Arc::new(broker.clone()),
            Publisher::direct(Arc::new(broker.clone())),
            Arc::new(resolver),
            vec![
                QueueBinding::new(QUEUE, HandlerKind::BalanceCreate),
                QueueBinding::new("balance_operation", HandlerKind::BalanceOperation),
            ],
        )
        .with_clock(Arc::new(ManualClock::at(NOW)))
        .with_sleeper(Arc::new(sleeper.clone()))
        .with_sink(Arc::new(sink.clone()));
        consumer.set_commands(Arc::new(commands.clone()));
        Fixture { consumer, broker, commands, sink, sleeper }
    }

    fn fixture() -> Fixture {
        fixture_with_resolver(TenantResolver::disabled())
    }

    fn create_body(account: Uuid) -> Vec<u8> {
        BalanceCreateMessage {
            organization_id: Some(Uuid::new_v4()),
            ledger_id: Some(Uuid::new_v4()),
            account_id: Some(account),
            queue_data: vec![QueueItem { id: Some(account), value: serde_json::json!({}) }],
        }
        .to_json()
        .unwrap()
    }

    async fn pull_one(broker: &MemoryBroker, queue: &str) -> Delivery {
        broker.pull(queue, 1).await.unwrap().pop().expect("delivery present")
    }

    #[tokio::test]
    async fn valid_create_message_is_handled_and_acked() {
        let f = fixture();
        let account = Uuid::new_v4();
        f.broker.seed(QUEUE, create_body(account), Headers::new());

        let delivery = pull_one(&f.broker, QUEUE).await;
        f.consumer.dispatch(delivery, HandlerKind::BalanceCreate).await;

        assert_eq!(f.commands.created().len(), 1);
        assert_eq!(f.broker.acked(QUEUE), 1);
        assert_eq!(f.broker.depth(QUEUE), 0);
    }

    #[tokio::test]
    async fn operation_message_round_trips_msgpack() {
        let f = fixture();
        let body = BalanceOperationMessage {
            organization_id: Some(Uuid::new_v4()),
            ledger_id: Some(Uuid::new_v4()),
            queue_data: vec![QueueItem { id: Some(Uuid::new_v4()), value: serde_json::Value::Null }],
        }
        .to_msgpack()
        .unwrap();
        f.broker.seed("balance_operation", body, Headers::new());

        let delivery = pull_one(&f.broker, "balance_operation").await;
        f.consumer.dispatch(delivery, HandlerKind::BalanceOperation).await;

        assert_eq!(f.commands.operations().len(), 1);
        assert_eq!(f.broker.acked("balance_operation"), 1);
    }

    #[tokio::test]
    async fn invalid_message_is_rejected_without_requeue() {
        let f = fixture();
        // queue_data id mismatching account_id violates the invariant.
        let body = BalanceCreateMessage {
            organization_id: Some(Uuid::new_v4()),
            ledger_id: Some(Uuid::new_v4()),
            account_id: Some(Uuid::new_v4()),
            queue_data: vec![QueueItem { id: Some(Uuid::new_v4()), value: serde_json::Value::Null }],
        }
        .to_json()
        .unwrap();
        f.broker.seed(QUEUE, body, Headers::new());

        let delivery = pull_one(&f.broker, QUEUE).await;
        f.consumer.dispatch(delivery, HandlerKind::BalanceCreate).await;

        assert!(f.commands.created().is_empty());
        // nack without requeue: the broker's topology moved it to the DLQ.
        assert_eq!(f.broker.depth(QUEUE), 0);
        assert_eq!(f.broker.depth("balance_create.dlq"), 1);
        let rejected = f.sink.count_where(|e| {
            matches!(e, WorkerEvent::Consumer(ConsumerEvent::ValidationRejected { .. }))
        });
        assert_eq!(rejected, 1);
    }

    #[tokio::test]
    async fn undecodable_body_is_a_validation_failure() {
        let f = fixture();
        f.broker.seed(QUEUE, b"{broken".to_vec(), Headers::new());

        let delivery = pull_one(&f.broker, QUEUE).await;
        f.consumer.dispatch(delivery, HandlerKind::BalanceCreate).await;

        assert_eq!(f.broker.depth("balance_create.dlq"), 1);
    }

    #[tokio::test]
    async fn infrastructure_failure_republishes_with_bumped_retry_header() {
        let f = fixture();
        f.commands.fail_create_with(Some("redis: connection refused"));
        let account = Uuid::new_v4();
        f.broker.seed(QUEUE, create_body(account), Headers::new());

        let delivery = pull_one(&f.broker, QUEUE).await;
        f.consumer.dispatch(delivery, HandlerKind::BalanceCreate).await;

        // Original acked, replacement queued with attempt 1.
        assert_eq!(f.broker.acked(QUEUE), 1);
        let queued = f.broker.peek_all(QUEUE);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].1.get_i64(HEADER_RETRY_COUNT), Some(1));

        // The in-memory backoff delay was applied before the republish.
        assert_eq!(f.sleeper.calls(), 1);
        assert_eq!(f.sleeper.call_at(0).unwrap(), Duration::from_secs(1));

        let retried = f.sink.count_where(|e| {
            matches!(e, WorkerEvent::Consumer(ConsumerEvent::Retried { attempt: 1, .. }))
        });
        assert_eq!(retried, 1);
    }

    #[tokio::test]
    async fn retry_delay_grows_with_the_header_count() {
        let f = fixture();
        f.commands.fail_create_with(Some("redis: connection refused"));
        let account = Uuid::new_v4();
        f.broker.seed(QUEUE, create_body(account), Headers::new().set_i64(HEADER_RETRY_COUNT, 2));

        let delivery = pull_one(&f.broker, QUEUE).await;
        f.consumer.dispatch(delivery, HandlerKind::BalanceCreate).await;

        // attempt 3 -> 1s * 2^2
        assert_eq!(f.sleeper.call_at(0).unwrap(), Duration::from_secs(4));
        let queued = f.broker.peek_all(QUEUE);
        assert_eq!(queued[0].1.get_i64(HEADER_RETRY_COUNT), Some(3));
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_with_fresh_dlq_headers() {
        let f = fixture();
        f.commands.fail_create_with(Some("redis: connection refused"));
        let account = Uuid::new_v4();
        f.broker.seed(QUEUE, create_body(account), Headers::new().set_i64(HEADER_RETRY_COUNT, 4));

        let delivery = pull_one(&f.broker, QUEUE).await;
        f.consumer.dispatch(delivery, HandlerKind::BalanceCreate).await;

        assert_eq!(f.broker.depth(QUEUE), 0);
        let dead = f.broker.peek_all("balance_create.dlq");
        assert_eq!(dead.len(), 1);
        let headers = &dead[0].1;
        assert_eq!(headers.get_str(HEADER_DLQ_ORIGINAL_QUEUE), Some(QUEUE));
        assert_eq!(headers.get_i64(HEADER_DLQ_RETRY_COUNT), Some(0));
        assert_eq!(headers.get_i64(HEADER_DLQ_TIMESTAMP), Some(NOW));
        assert_eq!(headers.get_str(HEADER_DLQ_REASON), Some("infrastructure"));
        assert!(!headers.contains(HEADER_RETRY_COUNT));
    }

    #[tokio::test]
    async fn business_failure_dead_letters_immediately() {
        let f = fixture();
        f.commands.fail_create_with(Some("account is frozen"));
        let account = Uuid::new_v4();
        f.broker.seed(QUEUE, create_body(account), Headers::new());

        let delivery = pull_one(&f.broker, QUEUE).await;
        f.consumer.dispatch(delivery, HandlerKind::BalanceCreate).await;

        assert_eq!(f.sleeper.calls(), 0);
        let dead = f.broker.peek_all("balance_create.dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].1.get_str(HEADER_DLQ_REASON), Some("business"));
    }

    #[tokio::test]
    async fn retry_count_headers_accept_32_bit_values() {
        let f = fixture();
        f.commands.fail_create_with(Some("redis: connection refused"));
        let account = Uuid::new_v4();
        let mut headers = Headers::new();
        headers.insert(HEADER_RETRY_COUNT, crate::broker::HeaderValue::Int32(4));
        f.broker.seed(QUEUE, create_body(account), headers);

        let delivery = pull_one(&f.broker, QUEUE).await;
        f.consumer.dispatch(delivery, HandlerKind::BalanceCreate).await;

        // Normalized to 4: the budget is spent, so straight to the DLQ.
        assert_eq!(f.broker.depth("balance_create.dlq"), 1);
    }

    struct FailingDirectory;

    #[async_trait]
    impl TenantDirectory for FailingDirectory {
        async fn active_tenants(&self, _service: &str) -> Result<Vec<TenantSummary>, Error> {
            Ok(vec![])
        }

        async fn relational_for(
            &self,
            tenant: &str,
        ) -> Result<Arc<dyn crate::stores::LedgerStore>, Error> {
            Err(Error::Store(format!("no pool for {tenant}")))
        }

        async fn documents_for(
            &self,
            _tenant: &str,
        ) -> Result<Arc<dyn crate::stores::DocumentStore>, Error> {
            Err(Error::Document("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn tenant_resolution_failure_requeues_without_invoking_the_handler() {
        let f = fixture_with_resolver(TenantResolver::new(true, Some(Arc::new(FailingDirectory))));
        let account = Uuid::new_v4();
        f.broker.seed(
            QUEUE,
            create_body(account),
            Headers::new().set_text(HEADER_TENANT_ID, "t42"),
        );

        let delivery = pull_one(&f.broker, QUEUE).await;
        f.consumer.dispatch(delivery, HandlerKind::BalanceCreate).await;

        assert!(f.commands.created().is_empty());
        assert_eq!(f.broker.depth(QUEUE), 1);
        assert_eq!(f.broker.requeued(QUEUE), 1);
        let failures = f.sink.count_where(|e| {
            matches!(
                e,
                WorkerEvent::Failure(FailureEvent { kind: ErrorKind::TransientResolution, .. })
            )
        });
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn run_refuses_to_start_unwired() {
        let broker = MemoryBroker::new();
        let consumer = MultiQueueConsumer::new(
            ConsumerConfig::default(),
            Arc::new(broker.clone()),
            Publisher::direct(Arc::new(broker)),
            Arc::new(TenantResolver::disabled()),
            vec![QueueBinding::new(QUEUE, HandlerKind::BalanceCreate)],
        );
        let (_tx, rx) = watch::channel(false);
        assert!(matches!(consumer.run(rx).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn run_drains_seeded_messages_until_shutdown() {
        let f = fixture();
        let account = Uuid::new_v4();
        f.broker.seed(QUEUE, create_body(account), Headers::new());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumer = f.consumer.clone();
        let handle = tokio::spawn(async move { consumer.run(shutdown_rx).await });

        // Wait for the handler to record the message.
        for _ in 0..100 {
            if !f.commands.created().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(f.commands.created().len(), 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn failed_republish_keeps_the_original_delivery() {
        let broker = MemoryBroker::new();
        let commands = RecordingCommands::new();
        commands.fail_create_with(Some("redis: connection refused"));
        let publish_broker = MemoryBroker::new();
        publish_broker.set_publish_failure(true);
        let consumer = MultiQueueConsumer::new(
            ConsumerConfig::default(),
            Arc::new(broker.clone()),
            Publisher::direct(Arc::new(publish_broker) as Arc<dyn QueuePublisher>),
            Arc::new(TenantResolver::disabled()),
            vec![QueueBinding::new(QUEUE, HandlerKind::BalanceCreate)],
        )
        .with_sleeper(Arc::new(TrackingSleeper::new()));
        consumer.set_commands(Arc::new(commands));

        broker.seed(QUEUE, create_body(Uuid::new_v4()), Headers::new());
        let delivery = pull_one(&broker, QUEUE).await;
        consumer.dispatch(delivery, HandlerKind::BalanceCreate).await;

        // Republish failed, so the message went back to its queue.
        assert_eq!(broker.depth(QUEUE), 1);
        assert_eq!(broker.acked(QUEUE), 0);
    }
}

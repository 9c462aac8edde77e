//! Dead-letter queue consumer.
//!
//! Polls each watched DLQ on a fixed cadence, gated on the health of the
//! relational store and the cache. Replays follow a tiered backoff keyed
//! by the replay attempt and are published in confirm mode; a delivery
//! whose original queue is not in the allow-list is dropped, and one that
//! exhausted its replay budget is acknowledged as permanently lost.

use crate::backoff::dlq_replay_delay;
use crate::broker::{
    dlq_queue_name, Delivery, HeaderValue, Publisher, QueueSubscriber, Confirmation,
    HEADER_DLQ_ORIGINAL_QUEUE, HEADER_DLQ_RETRY_COUNT, HEADER_DLQ_TIMESTAMP,
};
use crate::clock::{Clock, SystemClock};
use crate::config::DlqConfig;
use crate::error::Error;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::stores::Pingable;
use crate::telemetry::{DlqEvent, MetricsSink, NullSink, WorkerEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Timestamps older than this are clamped; a message cannot be "older"
/// than the retention horizon.
const MAX_TIMESTAMP_AGE: Duration = Duration::from_secs(30 * 24 * 3_600);
/// Timestamps further in the future than this are treated as clock skew
/// and coerced to now.
const MAX_TIMESTAMP_SKEW: Duration = Duration::from_secs(3_600);

#[derive(Clone)]
pub struct DlqConsumer {
    config: DlqConfig,
    subscriber: Arc<dyn QueueSubscriber>,
    publisher: Publisher,
    ledger: Arc<dyn Pingable>,
    cache: Arc<dyn Pingable>,
    /// Original queues replays may target; everything else is dropped.
    allowed_queues: Arc<Vec<String>>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    sink: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for DlqConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DlqConsumer").field("allowed_queues", &self.allowed_queues).finish()
    }
}

impl DlqConsumer {
    pub fn new(
        config: DlqConfig,
        subscriber: Arc<dyn QueueSubscriber>,
        publisher: Publisher,
        ledger: Arc<dyn Pingable>,
        cache: Arc<dyn Pingable>,
        allowed_queues: Vec<String>,
    ) -> Self {
        Self {
            config,
            subscriber,
            publisher,
            ledger,
            cache,
            allowed_queues: Arc::new(allowed_queues),
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

    /// Poll every watched DLQ until shutdown. Disabled consumers return
    /// immediately.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        if !self.config.enabled {
            tracing::info!("dlq consumer disabled");
            return Ok(());
        }

        let mut loops: JoinSet<()> = JoinSet::new();
        for queue in self.allowed_queues.iter().cloned() {
            let consumer = self.clone();
            let mut shutdown = shutdown.clone();
            loops.spawn(async move {
                let dlq = dlq_queue_name(&queue);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = consumer.sleeper.sleep(consumer.config.poll_interval) => {
                            consumer.tick(&dlq).await;
                        }
                    }
                }
            });
        }

        while loops.join_next().await.is_some() {}
        Ok(())
    }

    /// One poll of a DLQ: health gate, bounded drain, settlement.
    /// Returns the number of deliveries processed.
    pub async fn tick(&self, dlq: &str) -> usize {
        if !self.stores_healthy().await {
            tracing::warn!(queue = %dlq, "skipping dlq tick: stores unhealthy");
            return 0;
        }

        let batch = self.config.batch_size.min(self.config.prefetch as usize);
        let deliveries = match self.subscriber.pull(dlq, batch).await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                tracing::warn!(queue = %dlq, %err, "dlq pull failed");
                return 0;
            }
        };

        let mut processed = 0;
        for delivery in deliveries {
            self.process(delivery).await;
            processed += 1;
        }

        if processed > 0 {
            tracing::info!(queue = %dlq, processed, "dlq tick completed");
        }
        self.sink.record(&WorkerEvent::Dlq(DlqEvent::TickCompleted {
            queue: dlq.to_string(),
            processed,
        }));
        processed
    }

    async fn stores_healthy(&self) -> bool {
        let budget = self.config.health_check_timeout;
        let ledger_ok =
            matches!(tokio::time::timeout(budget, self.ledger.ping()).await, Ok(Ok(())));
        if !ledger_ok {
            return false;
        }
        matches!(tokio::time::timeout(budget, self.cache.ping()).await, Ok(Ok(())))
    }

    async fn process(&self, delivery: Delivery) {
        let dlq = delivery.queue.clone();

        let Some(original) = delivery
            .headers
            .get_str(HEADER_DLQ_ORIGINAL_QUEUE)
            .map(str::to_owned)
            .filter(|q| self.allowed_queues.contains(q))
        else {
            // Unknown target: drop the message rather than replay into an
            // attacker-chosen queue.
            tracing::warn!(
                queue = %dlq,
                original = delivery.headers.get_str(HEADER_DLQ_ORIGINAL_QUEUE).unwrap_or("<none>"),
                "dlq delivery names a queue outside the allow-list; dropping"
            );
            self.sink.record(&WorkerEvent::Dlq(DlqEvent::UnknownQueueDropped {
                queue: dlq.clone(),
            }));
            if let Err(err) = delivery.ack().await {
                tracing::error!(queue = %dlq, %err, "failed to drop dlq delivery");
            }
            return;
        };

        let now = self.clock.now_secs();
        let retry_count = delivery.headers.get_i64(HEADER_DLQ_RETRY_COUNT).unwrap_or(0);
        let dead_lettered_at = self.validated_timestamp(&delivery, now);

        let tier = dlq_replay_delay(retry_count)
            .clamp(self.config.initial_backoff, self.config.max_backoff);
        let elapsed = Duration::from_secs((now - dead_lettered_at).max(0) as u64);
        if elapsed < tier {
            tracing::debug!(
                queue = %dlq,
                retry_count,
                elapsed_secs = elapsed.as_secs(),
                tier_secs = tier.as_secs(),
                "dlq delivery not due yet"
            );
            if let Err(err) = delivery.nack(true).await {
                tracing::error!(queue = %dlq, %err, "failed to requeue dlq delivery");
            }
            return;
        }

        if retry_count >= self.config.max_retries {
            tracing::error!(queue = %dlq, retry_count, "dlq replay budget exhausted; message lost");
            self.sink
                .record(&WorkerEvent::Dlq(DlqEvent::MessageLost { queue: dlq.clone() }));
            if let Err(err) = delivery.ack().await {
                tracing::error!(queue = %dlq, %err, "failed to ack lost dlq delivery");
            }
            return;
        }

        // Only the allow-listed headers survive; the primary-path retry
        // header is among the dropped ones, so the replayed message starts
        // its consumer retries fresh.
        let mut headers = delivery.headers.sanitize_for_replay();
        headers.insert(HEADER_DLQ_RETRY_COUNT, HeaderValue::Int64(retry_count + 1));

        let verdict = self
            .publisher
            .publish_confirmed(
                &original,
                &delivery.body,
                &headers,
                self.config.publish_confirm_timeout,
            )
            .await;

        match verdict {
            Ok(Confirmation::Acked) => {
                self.sink.record(&WorkerEvent::Dlq(DlqEvent::Replayed {
                    queue: original.clone(),
                    attempt: retry_count + 1,
                }));
                if let Err(err) = delivery.ack().await {
                    tracing::error!(queue = %dlq, %err, "failed to ack replayed dlq delivery");
                }
            }
            Ok(Confirmation::Nacked) | Ok(Confirmation::TimedOut) => {
                // The retry count is not bumped here: the replay never
                // reached the original queue.
                tracing::warn!(queue = %dlq, ?verdict, "dlq replay not confirmed; requeueing");
                if let Err(err) = delivery.nack(true).await {
                    tracing::error!(queue = %dlq, %err, "failed to requeue dlq delivery");
                }
            }
            Err(err) => {
                tracing::warn!(queue = %dlq, %err, "dlq replay publish failed; requeueing");
                if let Err(nack_err) = delivery.nack(true).await {
                    tracing::error!(queue = %dlq, %nack_err, "failed to requeue dlq delivery");
                }
            }
        }
    }

    /// Dead-letter timestamps are producer-controlled, so they are bounded
    /// both ways: future values beyond the skew budget coerce to now, and
    /// ancient values clamp to the retention horizon (making every tier
    /// immediately due rather than poisoning the queue).
    fn validated_timestamp(&self, delivery: &Delivery, now: i64) -> i64 {
        let raw = delivery.headers.get_i64(HEADER_DLQ_TIMESTAMP).unwrap_or(now);
        if raw > now + MAX_TIMESTAMP_SKEW.as_secs() as i64 {
            return now;
        }
        let horizon = now - MAX_TIMESTAMP_AGE.as_secs() as i64;
        raw.max(horizon)
    }
}

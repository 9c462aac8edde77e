//! Metadata outbox worker.
//!
//! Ships staged metadata writes from the relational outbox table to the
//! document store. Rows are claimed atomically (pending, due-for-retry
//! failed, or stale processing), probed for idempotency, and either
//! published, rescheduled with an exponential-plus-jitter ladder, or
//! parked in the dead-letter state once the retry budget is spent. A
//! cleanup ticker removes terminal rows past retention.

use crate::backoff::Backoff;
use crate::clock::{Clock, SystemClock};
use crate::config::OutboxConfig;
use crate::domain::OutboxEntry;
use crate::error::Error;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::stores::{DocumentStore, OutboxStore};
use crate::telemetry::{FailureEvent, MetricsSink, NullSink, OutboxEvent, WorkerEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

const SERVICE: &str = "metadata_outbox";
const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct MetadataOutboxWorker {
    config: OutboxConfig,
    outbox: Arc<dyn OutboxStore>,
    documents: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    sink: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for MetadataOutboxWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataOutboxWorker").field("config", &self.config).finish()
    }
}

impl MetadataOutboxWorker {
    pub fn new(
        config: OutboxConfig,
        outbox: Arc<dyn OutboxStore>,
        documents: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            config,
            outbox,
            documents,
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

    /// Poll and clean up until shutdown. Disabled workers return
    /// immediately.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        if !self.config.enabled {
            tracing::info!("metadata outbox worker disabled");
            return Ok(());
        }

        let mut loops: JoinSet<()> = JoinSet::new();

        {
            let worker = self.clone();
            let mut shutdown = shutdown.clone();
            loops.spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = worker.sleeper.sleep(worker.config.poll_interval) => {
                            worker.poll_once().await;
                        }
                    }
                }
            });
        }
        {
            let worker = self.clone();
            let mut shutdown = shutdown.clone();
            loops.spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = worker.sleeper.sleep(worker.config.cleanup_interval) => {
                            worker.cleanup_once().await;
                        }
                    }
                }
            });
        }

        while loops.join_next().await.is_some() {}
        Ok(())
    }

    /// One poll: claim a batch and process it concurrently. Returns the
    /// number of rows claimed.
    pub async fn poll_once(&self) -> usize {
        if !self.stores_healthy().await {
            tracing::warn!("skipping outbox poll: stores unhealthy");
            return 0;
        }

        let now = self.clock.now_secs();
        let claimed = match self
            .outbox
            .claim_pending_batch(self.config.max_workers, now, self.config.stale_processing)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(%err, "outbox claim failed");
                return 0;
            }
        };
        let count = claimed.len();

        let mut tasks: JoinSet<()> = JoinSet::new();
        for row in claimed {
            let worker = self.clone();
            tasks.spawn(async move {
                let deadline = worker.config.entry_deadline;
                match tokio::time::timeout(deadline, worker.process_row(&row)).await {
                    Ok(()) => {}
                    Err(_) => {
                        let err = Error::Timeout { elapsed: deadline, limit: deadline };
                        worker.handle_failure(&row, &err).await;
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    // The row stays in processing; the stale-claim window
                    // is the recovery path for whatever was lost.
                    let recovered = Error::PanicRecovered(err.to_string());
                    tracing::error!(%recovered, "outbox worker task panicked");
                    self.sink.record(&WorkerEvent::Failure(FailureEvent {
                        service: SERVICE.to_string(),
                        kind: recovered.kind(),
                    }));
                }
            }
        }

        count
    }

    /// One cleanup: drop terminal rows past the retention window.
    pub async fn cleanup_once(&self) -> u64 {
        let cutoff =
            self.clock.now_secs() - i64::from(self.config.retention_days) * 24 * 3_600;
        match self.outbox.delete_old_entries(cutoff).await {
            Ok(deleted) => {
                if deleted > 0 {
                    tracing::info!(deleted, "outbox retention cleanup removed rows");
                }
                self.sink.record(&WorkerEvent::Outbox(OutboxEvent::Cleaned { deleted }));
                deleted
            }
            Err(err) => {
                tracing::warn!(%err, "outbox cleanup failed");
                0
            }
        }
    }

    async fn stores_healthy(&self) -> bool {
        let outbox_ok =
            matches!(tokio::time::timeout(HEALTH_TIMEOUT, self.outbox.ping()).await, Ok(Ok(())));
        if !outbox_ok {
            return false;
        }
        matches!(tokio::time::timeout(HEALTH_TIMEOUT, self.documents.ping()).await, Ok(Ok(())))
    }

    async fn process_row(&self, row: &OutboxEntry) {
        // Idempotency probe: a previous attempt may have written the
        // document and crashed before marking the row.
        match self.documents.find_by_entity(&row.entity_type, &row.entity_id).await {
            Ok(Some(_)) => {
                self.mark_published(row).await;
                return;
            }
            Ok(None) => {}
            Err(err) => {
                self.handle_failure(row, &err).await;
                return;
            }
        }

        match self.documents.create(&row.entity_type, &row.entity_id, &row.metadata).await {
            Ok(()) => self.mark_published(row).await,
            Err(err) => self.handle_failure(row, &err).await,
        }
    }

    async fn mark_published(&self, row: &OutboxEntry) {
        let now = self.clock.now_secs();
        match self.outbox.mark_published(row.id, now).await {
            Ok(()) => {
                tracing::debug!(entity_type = %row.entity_type, entity_id = %row.entity_id,
                    "outbox entry published");
                self.sink.record(&WorkerEvent::Outbox(OutboxEvent::Published {
                    entity_type: row.entity_type.clone(),
                }));
            }
            Err(err) => {
                tracing::warn!(id = %row.id, %err, "failed to mark outbox row published");
            }
        }
    }

    async fn handle_failure(&self, row: &OutboxEntry, cause: &Error) {
        let now = self.clock.now_secs();
        let new_retry_count = row.retry_count + 1;
        // Rows staged before the budget column existed carry zero.
        let max_retries = if row.max_retries == 0 {
            self.config.max_retries
        } else {
            row.max_retries
        };

        if new_retry_count >= max_retries {
            tracing::error!(id = %row.id, %cause, "outbox retry budget spent; moving to dlq");
            if let Err(err) =
                self.outbox.mark_dlq(row.id, &cause.to_string(), new_retry_count, now).await
            {
                tracing::warn!(id = %row.id, %err, "failed to mark outbox row dlq");
                return;
            }
            self.sink.record(&WorkerEvent::Outbox(OutboxEvent::DeadLettered {
                entity_type: row.entity_type.clone(),
            }));
            return;
        }

        let backoff = Backoff::exponential(self.config.initial_backoff, self.config.max_backoff)
            .with_jitter(self.config.jitter_factor)
            .delay(new_retry_count);
        let next_retry_at = now + backoff.as_secs() as i64;

        tracing::warn!(
            id = %row.id,
            %cause,
            retry_count = new_retry_count,
            next_retry_in = backoff.as_secs(),
            "outbox publish failed; retry scheduled"
        );
        if let Err(err) = self
            .outbox
            .mark_failed(row.id, &cause.to_string(), new_retry_count, next_retry_at, now)
            .await
        {
            tracing::warn!(id = %row.id, %err, "failed to mark outbox row failed");
            return;
        }
        self.sink.record(&WorkerEvent::Outbox(OutboxEvent::RetryScheduled {
            entity_type: row.entity_type.clone(),
            retry_count: new_retry_count,
        }));
        self.sink.record(&WorkerEvent::Failure(FailureEvent {
            service: SERVICE.to_string(),
            kind: cause.kind(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::OutboxStatus;
    use crate::memory::{MemoryDocumentStore, MemoryOutboxStore};
    use crate::sleeper::InstantSleeper;
    use crate::telemetry::MemorySink;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000;

    struct Fixture {
        worker: MetadataOutboxWorker,
        outbox: MemoryOutboxStore,
        documents: MemoryDocumentStore,
        sink: MemorySink,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::at(NOW);
        let outbox = MemoryOutboxStore::new();
        let documents = MemoryDocumentStore::new();
        let sink = MemorySink::new();
        let worker = MetadataOutboxWorker::new(
            OutboxConfig::default(),
            Arc::new(outbox.clone()),
            Arc::new(documents.clone()),
        )
        .with_clock(Arc::new(clock.clone()))
        .with_sleeper(Arc::new(InstantSleeper))
        .with_sink(Arc::new(sink.clone()));
        Fixture { worker, outbox, documents, sink, clock }
    }

    fn pending_row(entity_id: &str) -> OutboxEntry {
        OutboxEntry::pending("Account", entity_id, json!({"name": "savings"}), 10, NOW - 60)
    }

    #[tokio::test]
    async fn pending_row_is_published_to_the_document_store() {
        let f = fixture();
        let row = pending_row("acc-1");
        f.outbox.insert(row.clone());

        assert_eq!(f.worker.poll_once().await, 1);

        let stored = f.outbox.get(row.id).unwrap();
        assert_eq!(stored.status, OutboxStatus::Published);
        assert_eq!(
            f.documents.get("Account", "acc-1"),
            Some(json!({"name": "savings"}))
        );
        let published = f
            .sink
            .count_where(|e| matches!(e, WorkerEvent::Outbox(OutboxEvent::Published { .. })));
        assert_eq!(published, 1);
    }

    #[tokio::test]
    async fn existing_document_short_circuits_the_insert() {
        let f = fixture();
        let row = pending_row("acc-1");
        f.outbox.insert(row.clone());
        f.documents
            .create("Account", "acc-1", &json!({"name": "previous attempt"}))
            .await
            .unwrap();
        // A create would fail; the probe must prevent it from running.
        f.documents.set_create_failure(true);

        f.worker.poll_once().await;

        assert_eq!(f.outbox.get(row.id).unwrap().status, OutboxStatus::Published);
    }

    #[tokio::test]
    async fn failure_schedules_a_jittered_exponential_retry() {
        let f = fixture();
        let row = pending_row("acc-1");
        f.outbox.insert(row.clone());
        f.documents.set_create_failure(true);

        f.worker.poll_once().await;

        let stored = f.outbox.get(row.id).unwrap();
        assert_eq!(stored.status, OutboxStatus::Failed);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.last_error.is_some());

        // initial_backoff 30s, jitter factor 0.2: due in [30s, 36s].
        let due = stored.next_retry_at.unwrap();
        assert!(due >= NOW + 30, "due {due} too early");
        assert!(due <= NOW + 36, "due {due} too late");
    }

    #[tokio::test]
    async fn failed_row_is_not_reclaimed_before_its_retry_time() {
        let f = fixture();
        let row = pending_row("acc-1");
        f.outbox.insert(row.clone());
        f.documents.set_create_failure(true);

        f.worker.poll_once().await;
        // Still waiting out the backoff: nothing to claim.
        assert_eq!(f.worker.poll_once().await, 0);

        // Past the backoff the row is claimed again and succeeds.
        f.documents.set_create_failure(false);
        f.clock.advance_secs(60);
        assert_eq!(f.worker.poll_once().await, 1);
        assert_eq!(f.outbox.get(row.id).unwrap().status, OutboxStatus::Published);
    }

    #[tokio::test]
    async fn spent_budget_moves_the_row_to_dlq_without_a_retry_schedule() {
        let f = fixture();
        let mut row = pending_row("acc-1");
        row.retry_count = 9;
        row.max_retries = 10;
        f.outbox.insert(row.clone());
        f.documents.set_create_failure(true);

        f.worker.poll_once().await;

        let stored = f.outbox.get(row.id).unwrap();
        assert_eq!(stored.status, OutboxStatus::Dlq);
        assert_eq!(stored.retry_count, 10);
        assert!(stored.last_error.is_some());
        // mark_failed never ran: no retry was scheduled.
        assert_eq!(stored.next_retry_at, None);

        let dead = f.sink.count_where(|e| {
            matches!(e, WorkerEvent::Outbox(OutboxEvent::DeadLettered { .. }))
        });
        assert_eq!(dead, 1);

        // Dlq rows are terminal: later polls ignore them.
        f.clock.advance_secs(10_000);
        assert_eq!(f.worker.poll_once().await, 0);
    }

    #[tokio::test]
    async fn stale_processing_row_is_reclaimed() {
        let f = fixture();
        let mut row = pending_row("acc-1");
        row.status = OutboxStatus::Processing;
        row.updated_at = NOW - 3_600; // stale beyond the 10-minute window
        f.outbox.insert(row.clone());

        assert_eq!(f.worker.poll_once().await, 1);
        assert_eq!(f.outbox.get(row.id).unwrap().status, OutboxStatus::Published);
    }

    #[tokio::test]
    async fn unhealthy_stores_skip_the_poll() {
        let f = fixture();
        f.outbox.insert(pending_row("acc-1"));

        f.documents.set_ping_failure(true);
        assert_eq!(f.worker.poll_once().await, 0);

        f.documents.set_ping_failure(false);
        f.outbox.set_ping_failure(true);
        assert_eq!(f.worker.poll_once().await, 0);

        f.outbox.set_ping_failure(false);
        assert_eq!(f.worker.poll_once().await, 1);
    }

    #[tokio::test]
    async fn cleanup_removes_terminal_rows_past_retention() {
        let f = fixture();
        let mut old_published = pending_row("acc-1");
        old_published.status = OutboxStatus::Published;
        old_published.updated_at = NOW - 8 * 24 * 3_600;
        let mut fresh_dlq = pending_row("acc-2");
        fresh_dlq.status = OutboxStatus::Dlq;
        fresh_dlq.updated_at = NOW - 3_600;
        let open = pending_row("acc-3");
        f.outbox.insert(old_published);
        f.outbox.insert(fresh_dlq);
        f.outbox.insert(open);

        assert_eq!(f.worker.cleanup_once().await, 1);
        assert_eq!(f.outbox.all().len(), 2);

        // Idempotent: nothing more to remove.
        assert_eq!(f.worker.cleanup_once().await, 0);
    }

    #[tokio::test]
    async fn eventual_publication_survives_transient_failures() {
        let f = fixture();
        let row = pending_row("acc-1");
        f.outbox.insert(row.clone());
        f.documents.set_create_failure(true);

        // Two failing rounds, each waiting out its backoff.
        for _ in 0..2 {
            f.worker.poll_once().await;
            f.clock.advance_secs(24 * 3_600);
        }
        f.documents.set_create_failure(false);
        f.worker.poll_once().await;

        assert_eq!(f.outbox.get(row.id).unwrap().status, OutboxStatus::Published);
        assert_eq!(
            f.documents.get("Account", "acc-1"),
            Some(json!({"name": "savings"}))
        );
    }

    #[tokio::test]
    async fn disabled_worker_returns_immediately() {
        let f = fixture();
        let worker = MetadataOutboxWorker {
            config: OutboxConfig { enabled: false, ..OutboxConfig::default() },
            ..f.worker
        };
        let (_tx, rx) = watch::channel(false);
        worker.run(rx).await.unwrap();
    }
}

//! Stale-transaction sweeper.
//!
//! Periodically snapshots the queue of in-flight transaction records and
//! re-drives any that aged past the liveness threshold. A per-transaction
//! distributed lock keeps replays serialized across pods; the lock is
//! never released on success, TTL expiry is the release contract.

use crate::clock::{Clock, SystemClock};
use crate::config::StaleTxConfig;
use crate::domain::StaleTransactionRecord;
use crate::error::Error;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::stores::{DistributedLock, StaleQueue};
use crate::telemetry::{FailureEvent, MetricsSink, NullSink, StaleTxEvent, WorkerEvent};
use crate::usecase::{ExecutionContext, TransactionCommands};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

const SERVICE: &str = "stale_tx";
const LOCK_PREFIX: &str = "consumer_lock";

/// Lock key serializing replays of one transaction across pods.
pub fn replay_lock_key(organization: &Uuid, ledger: &Uuid, transaction: &Uuid) -> String {
    format!("{LOCK_PREFIX}:{organization}:{ledger}:{transaction}")
}

#[derive(Clone)]
pub struct StaleTransactionSweeper {
    config: StaleTxConfig,
    queue: Arc<dyn StaleQueue>,
    lock: Arc<dyn DistributedLock>,
    commands: Arc<dyn TransactionCommands>,
    /// Identifies this pod as the lock holder.
    instance_id: String,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    sink: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for StaleTransactionSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaleTransactionSweeper")
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

impl StaleTransactionSweeper {
    pub fn new(
        config: StaleTxConfig,
        queue: Arc<dyn StaleQueue>,
        lock: Arc<dyn DistributedLock>,
        commands: Arc<dyn TransactionCommands>,
    ) -> Self {
        Self {
            config,
            queue,
            lock,
            commands,
            instance_id: Uuid::new_v4().to_string(),
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
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

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = self.sleeper.sleep(self.config.poll_interval) => {
                    self.sweep_once().await;
                }
            }
        }
    }

    /// One sweep over the queue snapshot. Returns the number of records
    /// dispatched to the worker pool.
    pub async fn sweep_once(&self) -> usize {
        let entries = match self.queue.snapshot().await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(%err, "stale transaction snapshot failed");
                return 0;
            }
        };

        let now = self.clock.now_secs();
        let threshold = now - self.config.age_threshold.as_secs() as i64;
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut dispatched = 0;

        for (field, raw) in entries {
            let record: StaleTransactionRecord = match serde_json::from_str(&raw) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(%field, %err, "undecodable stale transaction record");
                    continue;
                }
            };

            // Never validated: the primary flow abandoned it before the
            // balances were checked; replaying would apply unvetted work.
            if record.validated_responses.is_none() {
                tracing::debug!(%field, "skipping unvalidated record");
                continue;
            }

            // Still inside the primary flow's window.
            if record.ttl > threshold {
                continue;
            }

            let Ok(permit) = semaphore.clone().acquire_owned().await else { break };
            let sweeper = self.clone();
            dispatched += 1;
            tasks.spawn(async move {
                let _permit = permit;
                let deadline = sweeper.config.message_deadline;
                if tokio::time::timeout(deadline, sweeper.replay(&record)).await.is_err() {
                    tracing::warn!(
                        transaction = %record.transaction_id,
                        "stale transaction replay hit its deadline"
                    );
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    tracing::error!(%err, "stale transaction worker panicked");
                    self.sink.record(&WorkerEvent::Failure(FailureEvent {
                        service: SERVICE.to_string(),
                        kind: Error::PanicRecovered(err.to_string()).kind(),
                    }));
                }
            }
        }

        dispatched
    }

    async fn replay(&self, record: &StaleTransactionRecord) {
        let key = replay_lock_key(
            &record.organization_id,
            &record.ledger_id,
            &record.transaction_id,
        );

        match self.lock.acquire(&key, &self.instance_id, self.config.lock_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                // Another instance is handling it.
                tracing::debug!(transaction = %record.transaction_id, "replay lock held elsewhere");
                self.sink.record(&WorkerEvent::StaleTx(StaleTxEvent::LockContended {
                    transaction: record.transaction_id,
                }));
                return;
            }
            Err(err) => {
                tracing::warn!(transaction = %record.transaction_id, %err, "lock acquire failed");
                return;
            }
        }

        // The lock stays held either way: replay is idempotent per
        // transaction id, and TTL expiry bounds the exclusion window.
        match self.commands.send_bto_execute(&ExecutionContext::single_tenant(), record).await {
            Ok(()) => {
                tracing::info!(
                    transaction = %record.transaction_id,
                    organization = %record.organization_id,
                    "stale transaction re-driven"
                );
                self.sink.record(&WorkerEvent::StaleTx(StaleTxEvent::Replayed {
                    organization: record.organization_id,
                    ledger: record.ledger_id,
                }));
            }
            Err(err) => {
                tracing::warn!(transaction = %record.transaction_id, %err, "stale replay failed");
                self.sink.record(&WorkerEvent::Failure(FailureEvent {
                    service: SERVICE.to_string(),
                    kind: err.kind(),
                }));
            }
        }
    }
}

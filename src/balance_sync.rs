//! Balance sync worker.
//!
//! Drains the time-ordered schedule of soon-to-expire cached balances back
//! into the durable store before their cache TTL lapses. Members whose
//! cache entry is gone, corrupt, or unparsable are garbage-collected from
//! the schedule; members whose sync fails stay put for the next sweep.

use crate::clock::{Clock, SystemClock};
use crate::config::BalanceSyncConfig;
use crate::domain::{parse_schedule_member, Balance};
use crate::error::Error;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::stores::{BalanceCache, KeyTtl, SyncSchedule};
use crate::telemetry::{
    BalanceSyncEvent, FailureEvent, MemberDropReason, MetricsSink, NullSink, WorkerEvent,
};
use crate::usecase::TransactionCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

const SERVICE: &str = "balance_sync";

#[derive(Clone)]
pub struct BalanceSyncWorker {
    config: BalanceSyncConfig,
    schedule: Arc<dyn SyncSchedule>,
    cache: Arc<dyn BalanceCache>,
    commands: Arc<dyn TransactionCommands>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    sink: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for BalanceSyncWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalanceSyncWorker").field("config", &self.config).finish()
    }
}

impl BalanceSyncWorker {
    pub fn new(
        config: BalanceSyncConfig,
        schedule: Arc<dyn SyncSchedule>,
        cache: Arc<dyn BalanceCache>,
        commands: Arc<dyn TransactionCommands>,
    ) -> Self {
        Self {
            config,
            schedule,
            cache,
            commands,
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

    /// Run sweeps until shutdown. Disabled workers return immediately.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        if !self.config.enabled {
            tracing::info!("balance sync worker disabled");
            return Ok(());
        }

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            // The iteration deadline keeps a wedged sweep from stalling
            // the loop; it is shorter than any lock TTL held elsewhere.
            let processed =
                match tokio::time::timeout(self.config.iteration_deadline, self.sweep_once())
                    .await
                {
                    Ok(count) => count,
                    Err(_) => {
                        tracing::warn!(
                            deadline = ?self.config.iteration_deadline,
                            "balance sync sweep hit its iteration deadline"
                        );
                        continue;
                    }
                };

            // Pace between sweeps; members left in place by a failing
            // store would otherwise re-run back to back.
            let wait = if processed == 0 {
                self.idle_delay().await
            } else {
                Duration::from_secs(1)
            };
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = self.sleeper.sleep(wait) => {}
            }
        }
    }

    /// One sweep: pull due members and flush them through a bounded pool.
    /// Returns the number of members dispatched.
    pub async fn sweep_once(&self) -> usize {
        let now = self.clock.now_secs();
        let due = match self.schedule.due_members(now, self.config.batch_size).await {
            Ok(members) => members,
            Err(err) => {
                tracing::warn!(%err, "failed to read due balance sync members");
                return 0;
            }
        };
        if due.is_empty() {
            return 0;
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let dispatched = due.len();

        for member in due {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let worker = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                worker.sync_member(&member).await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    tracing::error!(%err, "balance sync worker task panicked");
                    self.sink.record(&WorkerEvent::Failure(FailureEvent {
                        service: SERVICE.to_string(),
                        kind: Error::PanicRecovered(err.to_string()).kind(),
                    }));
                }
            }
        }

        dispatched
    }

    /// How long to sleep when nothing is due: until the next member's
    /// score, capped at the idle wait.
    async fn idle_delay(&self) -> Duration {
        let now = self.clock.now_secs();
        match self.schedule.next_due().await {
            Ok(Some(due_at)) if due_at > now => {
                Duration::from_secs((due_at - now) as u64).min(self.config.idle_wait)
            }
            Ok(_) => Duration::from_secs(1),
            Err(_) => self.config.idle_wait,
        }
    }

    async fn sync_member(&self, member: &str) {
        match self.cache.ttl(member).await {
            Ok(KeyTtl::Missing) => {
                // Entry already gone; no payload read.
                self.drop_member(member, MemberDropReason::MissingEntry).await;
                return;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(%member, %err, "cache ttl probe failed; leaving member");
                return;
            }
        }

        let payload = match self.cache.get(member).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                self.drop_member(member, MemberDropReason::MissingEntry).await;
                return;
            }
            Err(err) => {
                tracing::warn!(%member, %err, "cache read failed; leaving member");
                return;
            }
        };

        let balance: Balance = match serde_json::from_str(&payload) {
            Ok(balance) => balance,
            Err(err) => {
                tracing::warn!(%member, %err, "corrupt balance payload");
                self.drop_member(member, MemberDropReason::CorruptPayload).await;
                return;
            }
        };

        let Some((organization, ledger)) = parse_schedule_member(member) else {
            tracing::warn!(%member, "schedule member has no organization/ledger pair");
            self.drop_member(member, MemberDropReason::UnparsableKey).await;
            return;
        };

        match self.commands.sync_balance(organization, ledger, &balance).await {
            Ok(_) => {
                if let Err(err) = self.schedule.remove(member).await {
                    tracing::warn!(%member, %err, "failed to remove synced member");
                    return;
                }
                self.sink.record(&WorkerEvent::BalanceSync(BalanceSyncEvent::Synced {
                    organization,
                    ledger,
                }));
                tracing::debug!(%member, "balance flushed to durable store");
            }
            Err(err) => {
                // Leave the member for the next sweep.
                tracing::warn!(%member, %err, "balance sync failed");
                self.sink.record(&WorkerEvent::Failure(FailureEvent {
                    service: SERVICE.to_string(),
                    kind: err.kind(),
                }));
            }
        }
    }

    async fn drop_member(&self, member: &str, reason: MemberDropReason) {
        if let Err(err) = self.schedule.remove(member).await {
            tracing::warn!(%member, %err, "failed to drop schedule member");
            return;
        }
        self.sink.record(&WorkerEvent::BalanceSync(BalanceSyncEvent::MemberDropped {
            member: member.to_string(),
            reason,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::balance_cache_key;
    use crate::memory::{
        MemoryCache, MemorySchedule, RecordingCommands, SyncBehavior,
    };
    use crate::sleeper::InstantSleeper;
    use crate::telemetry::MemorySink;
    use crate::usecase::SyncOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    const NOW: i64 = 1_700_000_000;

    struct Fixture {
        worker: BalanceSyncWorker,
        schedule: MemorySchedule,
        cache: MemoryCache,
        commands: RecordingCommands,
        sink: MemorySink,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::at(NOW);
        let schedule = MemorySchedule::new();
        let cache = MemoryCache::new(Arc::new(clock.clone()));
        let commands = RecordingCommands::new();
        let sink = MemorySink::new();
        let worker = BalanceSyncWorker::new(
            BalanceSyncConfig::default(),
            Arc::new(schedule.clone()),
            Arc::new(cache.clone()),
            Arc::new(commands.clone()),
        )
        .with_clock(Arc::new(clock.clone()))
        .with_sleeper(Arc::new(InstantSleeper))
        .with_sink(Arc::new(sink.clone()));
        Fixture { worker, schedule, cache, commands, sink, clock }
    }

    fn sample_balance(organization: Uuid, ledger: Uuid) -> Balance {
        Balance {
            id: Uuid::new_v4(),
            organization_id: organization,
            ledger_id: ledger,
            account_id: Uuid::new_v4(),
            alias: "@acc".into(),
            key: String::new(),
            asset_code: "USD".into(),
            available: 1_000,
            on_hold: 0,
            version: 1,
            account_type: "deposit".into(),
            allow_sending: true,
            allow_receiving: true,
        }
    }

    #[tokio::test]
    async fn due_member_is_synced_and_removed() {
        let f = fixture();
        let organization = Uuid::new_v4();
        let ledger = Uuid::new_v4();
        let member = balance_cache_key(&organization, &ledger, "@acc#1");
        let balance = sample_balance(organization, ledger);

        f.schedule.add(&member, NOW - 60).await.unwrap();
        f.cache
            .set_with_ttl(&member, &serde_json::to_string(&balance).unwrap(), Duration::from_secs(540))
            .await
            .unwrap();

        assert_eq!(f.worker.sweep_once().await, 1);

        let synced = f.commands.synced();
        assert_eq!(synced.len(), 1);
        assert_eq!(synced[0].0, organization);
        assert_eq!(synced[0].1, ledger);
        assert_eq!(synced[0].2.available, 1_000);
        assert!(!f.schedule.contains(&member));

        let counted = f.sink.count_where(|e| {
            matches!(
                e,
                WorkerEvent::BalanceSync(BalanceSyncEvent::Synced { organization: o, ledger: l })
                    if *o == organization && *l == ledger
            )
        });
        assert_eq!(counted, 1);
    }

    #[tokio::test]
    async fn skipped_newer_still_clears_the_member() {
        let f = fixture();
        let organization = Uuid::new_v4();
        let ledger = Uuid::new_v4();
        let member = balance_cache_key(&organization, &ledger, "@acc#1");
        let balance = sample_balance(organization, ledger);

        f.commands.set_sync_behavior(SyncBehavior::Succeed(SyncOutcome::SkippedNewer));
        f.schedule.add(&member, NOW - 1).await.unwrap();
        f.cache
            .set_with_ttl(&member, &serde_json::to_string(&balance).unwrap(), Duration::from_secs(60))
            .await
            .unwrap();

        f.worker.sweep_once().await;
        assert!(!f.schedule.contains(&member));
    }

    /// Cache wrapper that counts payload reads, to show the TTL probe
    /// short-circuits before any read.
    #[derive(Clone)]
    struct CountingCache {
        inner: MemoryCache,
        reads: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl crate::stores::Pingable for CountingCache {
        async fn ping(&self) -> Result<(), Error> {
            self.inner.ping().await
        }
    }

    #[async_trait]
    impl BalanceCache for CountingCache {
        async fn get(&self, key: &str) -> Result<Option<String>, Error> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key).await
        }

        async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error> {
            self.inner.set_with_ttl(key, value, ttl).await
        }

        async fn ttl(&self, key: &str) -> Result<KeyTtl, Error> {
            self.inner.ttl(key).await
        }
    }

    #[tokio::test]
    async fn missing_entry_is_dropped_without_a_payload_read() {
        let clock = ManualClock::at(NOW);
        let schedule = MemorySchedule::new();
        let reads = Arc::new(AtomicUsize::new(0));
        let cache = CountingCache {
            inner: MemoryCache::new(Arc::new(clock.clone())),
            reads: reads.clone(),
        };
        let sink = MemorySink::new();
        let worker = BalanceSyncWorker::new(
            BalanceSyncConfig::default(),
            Arc::new(schedule.clone()),
            Arc::new(cache),
            Arc::new(RecordingCommands::new()),
        )
        .with_clock(Arc::new(clock))
        .with_sink(Arc::new(sink.clone()));

        let organization = Uuid::new_v4();
        let ledger = Uuid::new_v4();
        let member = balance_cache_key(&organization, &ledger, "@gone");
        schedule.add(&member, NOW - 10).await.unwrap();

        worker.sweep_once().await;

        assert!(!schedule.contains(&member));
        assert_eq!(reads.load(Ordering::SeqCst), 0);
        let dropped = sink.count_where(|e| {
            matches!(
                e,
                WorkerEvent::BalanceSync(BalanceSyncEvent::MemberDropped {
                    reason: MemberDropReason::MissingEntry,
                    ..
                })
            )
        });
        assert_eq!(dropped, 1);
    }

    #[tokio::test]
    async fn corrupt_payload_is_dropped() {
        let f = fixture();
        let organization = Uuid::new_v4();
        let ledger = Uuid::new_v4();
        let member = balance_cache_key(&organization, &ledger, "@acc#1");

        f.schedule.add(&member, NOW - 10).await.unwrap();
        f.cache.set_with_ttl(&member, "{not balance json", Duration::from_secs(60)).await.unwrap();

        f.worker.sweep_once().await;

        assert!(!f.schedule.contains(&member));
        assert!(f.commands.synced().is_empty());
        let dropped = f.sink.count_where(|e| {
            matches!(
                e,
                WorkerEvent::BalanceSync(BalanceSyncEvent::MemberDropped {
                    reason: MemberDropReason::CorruptPayload,
                    ..
                })
            )
        });
        assert_eq!(dropped, 1);
    }

    #[tokio::test]
    async fn member_without_uuid_pair_is_dropped() {
        let f = fixture();
        let member = "balance:{transactions}:not-a-uuid:@acc";
        let balance = sample_balance(Uuid::new_v4(), Uuid::new_v4());

        f.schedule.add(member, NOW - 10).await.unwrap();
        f.cache
            .set_with_ttl(member, &serde_json::to_string(&balance).unwrap(), Duration::from_secs(60))
            .await
            .unwrap();

        f.worker.sweep_once().await;

        assert!(!f.schedule.contains(member));
        let dropped = f.sink.count_where(|e| {
            matches!(
                e,
                WorkerEvent::BalanceSync(BalanceSyncEvent::MemberDropped {
                    reason: MemberDropReason::UnparsableKey,
                    ..
                })
            )
        });
        assert_eq!(dropped, 1);
    }

    #[tokio::test]
    async fn sync_failure_leaves_the_member_for_the_next_sweep() {
        let f = fixture();
        let organization = Uuid::new_v4();
        let ledger = Uuid::new_v4();
        let member = balance_cache_key(&organization, &ledger, "@acc#1");
        let balance = sample_balance(organization, ledger);

        f.commands.set_sync_behavior(SyncBehavior::Fail("postgres: connection refused".into()));
        f.schedule.add(&member, NOW - 10).await.unwrap();
        f.cache
            .set_with_ttl(&member, &serde_json::to_string(&balance).unwrap(), Duration::from_secs(60))
            .await
            .unwrap();

        f.worker.sweep_once().await;
        assert!(f.schedule.contains(&member));

        // Next sweep succeeds once the store recovers.
        f.commands.set_sync_behavior(SyncBehavior::Succeed(SyncOutcome::Synced));
        f.worker.sweep_once().await;
        assert!(!f.schedule.contains(&member));
    }

    #[tokio::test]
    async fn idle_delay_tracks_the_next_due_member() {
        let f = fixture();
        assert_eq!(f.worker.idle_delay().await, Duration::from_secs(1));

        f.schedule.add("member", NOW + 42).await.unwrap();
        assert_eq!(f.worker.idle_delay().await, Duration::from_secs(42));

        f.schedule.remove("member").await.unwrap();
        f.schedule.add("member", NOW + 100_000).await.unwrap();
        assert_eq!(f.worker.idle_delay().await, f.worker.config.idle_wait);

        f.clock.advance_secs(100_000);
        assert_eq!(f.worker.idle_delay().await, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn disabled_worker_returns_immediately() {
        let f = fixture();
        let worker = BalanceSyncWorker {
            config: BalanceSyncConfig { enabled: false, ..BalanceSyncConfig::default() },
            ..f.worker
        };
        let (_tx, rx) = watch::channel(false);
        worker.run(rx).await.unwrap();
    }
}

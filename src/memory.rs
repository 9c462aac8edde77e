//! In-memory port adapters.
//!
//! Complete, threadsafe implementations of every port, used by the test
//! suites and handy for local development. The broker models the
//! dead-letter topology (a nack without requeue lands on the queue's
//! `.dlq` sibling) and confirm-mode publishing; the cache honors TTLs
//! against an injectable clock.

use crate::broker::{
    dlq_queue_name, Acknowledger, Confirmation, Delivery, Headers, QueuePublisher,
    QueueSubscriber,
};
use crate::clock::{Clock, SystemClock};
use crate::domain::{Balance, OutboxEntry, OutboxStatus, StaleTransactionRecord};
use crate::error::Error;
use crate::messages::{BalanceCreateMessage, BalanceOperationMessage};
use crate::stores::{
    BalanceCache, DistributedLock, DocumentStore, KeyTtl, LedgerStore, OutboxStore, Pingable,
    StaleQueue, SyncSchedule,
};
use crate::usecase::{ExecutionContext, SyncOutcome, TransactionCommands};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct QueuedMessage {
    body: Vec<u8>,
    headers: Headers,
}

#[derive(Default)]
struct BrokerInner {
    queues: Mutex<HashMap<String, VecDeque<QueuedMessage>>>,
    notifiers: Mutex<HashMap<String, Arc<Notify>>>,
    acked: Mutex<HashMap<String, usize>>,
    requeued: Mutex<HashMap<String, usize>>,
    confirm_overrides: Mutex<HashMap<String, Confirmation>>,
    fail_publish: AtomicBool,
}

impl BrokerInner {
    fn notifier(&self, queue: &str) -> Arc<Notify> {
        lock(&self.notifiers).entry(queue.to_string()).or_default().clone()
    }

    fn push(&self, queue: &str, message: QueuedMessage) {
        lock(&self.queues).entry(queue.to_string()).or_default().push_back(message);
        self.notifier(queue).notify_one();
    }

    fn pop(&self, queue: &str) -> Option<QueuedMessage> {
        lock(&self.queues).get_mut(queue).and_then(VecDeque::pop_front)
    }
}

/// In-memory broker with dead-letter routing.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MemoryBroker")
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message as an external producer would.
    pub fn seed(&self, queue: &str, body: Vec<u8>, headers: Headers) {
        self.inner.push(queue, QueuedMessage { body, headers });
    }

    /// Number of messages currently parked on a queue.
    pub fn depth(&self, queue: &str) -> usize {
        lock(&self.inner.queues).get(queue).map_or(0, VecDeque::len)
    }

    /// Peek at the queue contents without consuming them.
    pub fn peek_all(&self, queue: &str) -> Vec<(Vec<u8>, Headers)> {
        lock(&self.inner.queues)
            .get(queue)
            .map(|q| q.iter().map(|m| (m.body.clone(), m.headers.clone())).collect())
            .unwrap_or_default()
    }

    pub fn acked(&self, queue: &str) -> usize {
        lock(&self.inner.acked).get(queue).copied().unwrap_or(0)
    }

    pub fn requeued(&self, queue: &str) -> usize {
        lock(&self.inner.requeued).get(queue).copied().unwrap_or(0)
    }

    /// Force `publish_confirmed` on a queue to report the given verdict.
    pub fn set_confirmation(&self, queue: &str, confirmation: Confirmation) {
        lock(&self.inner.confirm_overrides).insert(queue.to_string(), confirmation);
    }

    /// Make every publish fail, as a downed broker would.
    pub fn set_publish_failure(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    fn delivery(&self, queue: &str, message: QueuedMessage) -> Delivery {
        Delivery::new(
            queue,
            message.body.clone(),
            message.headers.clone(),
            Box::new(MemoryAcker { inner: self.inner.clone(), queue: queue.to_string(), message }),
        )
    }
}

struct MemoryAcker {
    inner: Arc<BrokerInner>,
    queue: String,
    message: QueuedMessage,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), Error> {
        let MemoryAcker { inner, queue, .. } = *self;
        *lock(&inner.acked).entry(queue).or_default() += 1;
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), Error> {
        let MemoryAcker { inner, queue, message } = *self;
        if requeue {
            *lock(&inner.requeued).entry(queue.clone()).or_default() += 1;
            inner.push(&queue, message);
        } else {
            // Dead-letter topology: rejected messages land on the sibling.
            inner.push(&dlq_queue_name(&queue), message);
        }
        Ok(())
    }
}

#[async_trait]
impl QueuePublisher for MemoryBroker {
    async fn publish(&self, queue: &str, body: &[u8], headers: &Headers) -> Result<(), Error> {
        if self.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(Error::Broker("connection refused".into()));
        }
        self.inner.push(queue, QueuedMessage { body: body.to_vec(), headers: headers.clone() });
        Ok(())
    }

    async fn publish_confirmed(
        &self,
        queue: &str,
        body: &[u8],
        headers: &Headers,
        _timeout: Duration,
    ) -> Result<Confirmation, Error> {
        if self.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(Error::Broker("connection refused".into()));
        }
        let verdict = lock(&self.inner.confirm_overrides)
            .get(queue)
            .copied()
            .unwrap_or(Confirmation::Acked);
        if verdict == Confirmation::Acked {
            self.inner
                .push(queue, QueuedMessage { body: body.to_vec(), headers: headers.clone() });
        }
        Ok(verdict)
    }
}

#[async_trait]
impl QueueSubscriber for MemoryBroker {
    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<mpsc::Receiver<Delivery>, Error> {
        let (tx, rx) = mpsc::channel(prefetch.max(1) as usize);
        let broker = self.clone();
        let queue = queue.to_string();
        tokio::spawn(async move {
            loop {
                match broker.inner.pop(&queue) {
                    Some(message) => {
                        let delivery = broker.delivery(&queue, message);
                        if tx.send(delivery).await.is_err() {
                            return;
                        }
                    }
                    None => broker.inner.notifier(&queue).notified().await,
                }
            }
        });
        Ok(rx)
    }

    async fn pull(&self, queue: &str, max: usize) -> Result<Vec<Delivery>, Error> {
        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            match self.inner.pop(queue) {
                Some(message) => deliveries.push(self.delivery(queue, message)),
                None => break,
            }
        }
        Ok(deliveries)
    }
}

// ---------------------------------------------------------------------------
// Cache, schedule, locks, stale queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    /// Epoch second of expiry; `None` means persistent.
    expires_at: Option<i64>,
}

/// In-memory key/value cache with TTLs and set-if-not-exists locking,
/// sharing one keyspace the way the real fast path does.
#[derive(Clone)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    clock: Arc<dyn Clock>,
    fail_ping: Arc<AtomicBool>,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MemoryCache")
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
            fail_ping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_ping_failure(&self, fail: bool) {
        self.fail_ping.store(fail, Ordering::SeqCst);
    }

    /// Drop a key outright, as an eviction would.
    pub fn evict(&self, key: &str) {
        lock(&self.entries).remove(key);
    }

    fn live_entry(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now_secs();
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some(entry) => match entry.expires_at {
                Some(expires_at) if expires_at <= now => {
                    entries.remove(key);
                    None
                }
                _ => Some(entry.clone()),
            },
            None => None,
        }
    }
}

#[async_trait]
impl Pingable for MemoryCache {
    async fn ping(&self) -> Result<(), Error> {
        if self.fail_ping.load(Ordering::SeqCst) {
            Err(Error::Cache("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BalanceCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.live_entry(key).map(|e| e.value))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error> {
        let expires_at = self.clock.now_secs() + ttl.as_secs() as i64;
        lock(&self.entries).insert(
            key.to_string(),
            CacheEntry { value: value.to_string(), expires_at: Some(expires_at) },
        );
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, Error> {
        match self.live_entry(key) {
            None => Ok(KeyTtl::Missing),
            Some(CacheEntry { expires_at: None, .. }) => Ok(KeyTtl::Persistent),
            Some(CacheEntry { expires_at: Some(at), .. }) => {
                let remaining = (at - self.clock.now_secs()).max(0) as u64;
                Ok(KeyTtl::Expires(Duration::from_secs(remaining)))
            }
        }
    }
}

#[async_trait]
impl DistributedLock for MemoryCache {
    async fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, Error> {
        if self.live_entry(key).is_some() {
            return Ok(false);
        }
        let expires_at = self.clock.now_secs() + ttl.as_secs() as i64;
        lock(&self.entries).insert(
            key.to_string(),
            CacheEntry { value: holder.to_string(), expires_at: Some(expires_at) },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool, Error> {
        match self.live_entry(key) {
            Some(entry) if entry.value == holder => {
                lock(&self.entries).remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// In-memory sorted set keyed by due-at score.
#[derive(Debug, Clone, Default)]
pub struct MemorySchedule {
    members: Arc<Mutex<BTreeMap<String, i64>>>,
}

impl MemorySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, member: &str) -> bool {
        lock(&self.members).contains_key(member)
    }

    pub fn len(&self) -> usize {
        lock(&self.members).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SyncSchedule for MemorySchedule {
    async fn add(&self, member: &str, due_at: i64) -> Result<(), Error> {
        lock(&self.members).insert(member.to_string(), due_at);
        Ok(())
    }

    async fn due_members(&self, now: i64, limit: usize) -> Result<Vec<String>, Error> {
        let members = lock(&self.members);
        let mut due: Vec<(&String, &i64)> =
            members.iter().filter(|(_, score)| **score <= now).collect();
        due.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
        Ok(due.into_iter().take(limit).map(|(member, _)| member.clone()).collect())
    }

    async fn next_due(&self) -> Result<Option<i64>, Error> {
        Ok(lock(&self.members).values().min().copied())
    }

    async fn remove(&self, member: &str) -> Result<(), Error> {
        lock(&self.members).remove(member);
        Ok(())
    }
}

/// In-memory stale-transaction map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStaleQueue {
    entries: Arc<Mutex<Vec<(String, String)>>>,
}

impl MemoryStaleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_record(&self, field: &str, record: &StaleTransactionRecord) {
        let raw = serde_json::to_string(record).unwrap_or_default();
        lock(&self.entries).push((field.to_string(), raw));
    }

    pub fn push_raw(&self, field: &str, raw: &str) {
        lock(&self.entries).push((field.to_string(), raw.to_string()));
    }
}

#[async_trait]
impl StaleQueue for MemoryStaleQueue {
    async fn snapshot(&self) -> Result<Vec<(String, String)>, Error> {
        Ok(lock(&self.entries).clone())
    }
}

// ---------------------------------------------------------------------------
// Ledger, outbox, documents
// ---------------------------------------------------------------------------

/// Relational handle stub with a controllable ping.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    fail_ping: Arc<AtomicBool>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ping_failure(&self, fail: bool) {
        self.fail_ping.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Pingable for MemoryLedger {
    async fn ping(&self) -> Result<(), Error> {
        if self.fail_ping.load(Ordering::SeqCst) {
            Err(Error::Store("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

impl LedgerStore for MemoryLedger {}

/// In-memory outbox table.
#[derive(Clone, Default)]
pub struct MemoryOutboxStore {
    rows: Arc<Mutex<HashMap<Uuid, OutboxEntry>>>,
    fail_ping: Arc<AtomicBool>,
}

impl std::fmt::Debug for MemoryOutboxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MemoryOutboxStore(rows={})", lock(&self.rows).len())
    }
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: OutboxEntry) {
        lock(&self.rows).insert(entry.id, entry);
    }

    pub fn get(&self, id: Uuid) -> Option<OutboxEntry> {
        lock(&self.rows).get(&id).cloned()
    }

    pub fn all(&self) -> Vec<OutboxEntry> {
        let mut rows: Vec<OutboxEntry> = lock(&self.rows).values().cloned().collect();
        rows.sort_by_key(|r| r.created_at);
        rows
    }

    pub fn set_ping_failure(&self, fail: bool) {
        self.fail_ping.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Pingable for MemoryOutboxStore {
    async fn ping(&self) -> Result<(), Error> {
        if self.fail_ping.load(Ordering::SeqCst) {
            Err(Error::Store("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn claim_pending_batch(
        &self,
        limit: usize,
        now: i64,
        stale_processing: Duration,
    ) -> Result<Vec<OutboxEntry>, Error> {
        let stale_before = now - stale_processing.as_secs() as i64;
        let mut rows = lock(&self.rows);

        let mut claimable: Vec<Uuid> = rows
            .values()
            .filter(|row| match row.status {
                OutboxStatus::Pending | OutboxStatus::Failed => {
                    row.next_retry_at.map_or(true, |at| at <= now)
                }
                OutboxStatus::Processing => row.updated_at < stale_before,
                _ => false,
            })
            .map(|row| row.id)
            .collect();
        claimable.sort_by_key(|id| rows[id].created_at);
        claimable.truncate(limit);

        let mut claimed = Vec::with_capacity(claimable.len());
        for id in claimable {
            if let Some(row) = rows.get_mut(&id) {
                row.status = OutboxStatus::Processing;
                row.updated_at = now;
                claimed.push(row.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_published(&self, id: Uuid, now: i64) -> Result<(), Error> {
        let mut rows = lock(&self.rows);
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| Error::Store(format!("outbox row {id} not found")))?;
        row.status = OutboxStatus::Published;
        row.updated_at = now;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        retry_count: u32,
        next_retry_at: i64,
        now: i64,
    ) -> Result<(), Error> {
        let mut rows = lock(&self.rows);
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| Error::Store(format!("outbox row {id} not found")))?;
        row.status = OutboxStatus::Failed;
        row.retry_count = retry_count;
        row.next_retry_at = Some(next_retry_at);
        row.last_error = Some(error.to_string());
        row.updated_at = now;
        Ok(())
    }

    async fn mark_dlq(
        &self,
        id: Uuid,
        error: &str,
        retry_count: u32,
        now: i64,
    ) -> Result<(), Error> {
        let mut rows = lock(&self.rows);
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| Error::Store(format!("outbox row {id} not found")))?;
        row.status = OutboxStatus::Dlq;
        row.retry_count = retry_count;
        row.last_error = Some(error.to_string());
        row.updated_at = now;
        Ok(())
    }

    async fn delete_old_entries(&self, older_than: i64) -> Result<u64, Error> {
        let mut rows = lock(&self.rows);
        let before = rows.len();
        rows.retain(|_, row| !(row.status.is_terminal() && row.updated_at < older_than));
        Ok((before - rows.len()) as u64)
    }
}

/// In-memory document store with an optional failure mode.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    collections: Arc<Mutex<HashMap<String, HashMap<String, Value>>>>,
    fail_create: Arc<AtomicBool>,
    fail_ping: Arc<AtomicBool>,
}

impl std::fmt::Debug for MemoryDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MemoryDocumentStore")
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_create_failure(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_ping_failure(&self, fail: bool) {
        self.fail_ping.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, collection: &str, entity_id: &str) -> Option<Value> {
        lock(&self.collections).get(collection)?.get(entity_id).cloned()
    }
}

#[async_trait]
impl Pingable for MemoryDocumentStore {
    async fn ping(&self) -> Result<(), Error> {
        if self.fail_ping.load(Ordering::SeqCst) {
            Err(Error::Document("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn find_by_entity(
        &self,
        collection: &str,
        entity_id: &str,
    ) -> Result<Option<Value>, Error> {
        Ok(self.get(collection, entity_id))
    }

    async fn create(
        &self,
        collection: &str,
        entity_id: &str,
        document: &Value,
    ) -> Result<(), Error> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Document("mongo: server selection timeout".into()));
        }
        let mut collections = lock(&self.collections);
        let entries = collections.entry(collection.to_string()).or_default();
        if entries.contains_key(entity_id) {
            return Err(Error::Document(format!("duplicate key: {entity_id}")));
        }
        entries.insert(entity_id.to_string(), document.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Command use case recorder
// ---------------------------------------------------------------------------

/// What `sync_balance` should do next.
#[derive(Debug, Clone)]
pub enum SyncBehavior {
    Succeed(SyncOutcome),
    Fail(String),
}

#[derive(Default)]
struct CommandsInner {
    created: Mutex<Vec<(Option<String>, BalanceCreateMessage)>>,
    operations: Mutex<Vec<(Option<String>, BalanceOperationMessage)>>,
    executed: Mutex<Vec<Uuid>>,
    synced: Mutex<Vec<(Uuid, Uuid, Balance)>>,
    fail_create: Mutex<Option<String>>,
    fail_operations: Mutex<Option<String>>,
    fail_execute: Mutex<Option<String>>,
    sync_behavior: Mutex<SyncBehavior>,
}

impl Default for SyncBehavior {
    fn default() -> Self {
        SyncBehavior::Succeed(SyncOutcome::Synced)
    }
}

/// Recording [`TransactionCommands`] double with programmable failures.
/// Failures are expressed as message strings so tests can exercise both
/// the business and the sniffed-infrastructure classification paths.
#[derive(Clone, Default)]
pub struct RecordingCommands {
    inner: Arc<CommandsInner>,
}

impl std::fmt::Debug for RecordingCommands {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RecordingCommands")
    }
}

impl RecordingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> Vec<(Option<String>, BalanceCreateMessage)> {
        lock(&self.inner.created).clone()
    }

    pub fn operations(&self) -> Vec<(Option<String>, BalanceOperationMessage)> {
        lock(&self.inner.operations).clone()
    }

    pub fn executed(&self) -> Vec<Uuid> {
        lock(&self.inner.executed).clone()
    }

    pub fn synced(&self) -> Vec<(Uuid, Uuid, Balance)> {
        lock(&self.inner.synced).clone()
    }

    pub fn fail_create_with(&self, message: Option<&str>) {
        *lock(&self.inner.fail_create) = message.map(str::to_owned);
    }

    pub fn fail_operations_with(&self, message: Option<&str>) {
        *lock(&self.inner.fail_operations) = message.map(str::to_owned);
    }

    pub fn fail_execute_with(&self, message: Option<&str>) {
        *lock(&self.inner.fail_execute) = message.map(str::to_owned);
    }

    pub fn set_sync_behavior(&self, behavior: SyncBehavior) {
        *lock(&self.inner.sync_behavior) = behavior;
    }
}

#[async_trait]
impl TransactionCommands for RecordingCommands {
    async fn create_balance(
        &self,
        ctx: &ExecutionContext,
        message: &BalanceCreateMessage,
    ) -> Result<(), Error> {
        if let Some(reason) = lock(&self.inner.fail_create).clone() {
            return Err(Error::Business(reason));
        }
        lock(&self.inner.created).push((ctx.tenant().map(str::to_owned), message.clone()));
        Ok(())
    }

    async fn create_balance_operations(
        &self,
        ctx: &ExecutionContext,
        message: &BalanceOperationMessage,
    ) -> Result<(), Error> {
        if let Some(reason) = lock(&self.inner.fail_operations).clone() {
            return Err(Error::Business(reason));
        }
        lock(&self.inner.operations).push((ctx.tenant().map(str::to_owned), message.clone()));
        Ok(())
    }

    async fn send_bto_execute(
        &self,
        _ctx: &ExecutionContext,
        record: &StaleTransactionRecord,
    ) -> Result<(), Error> {
        if let Some(reason) = lock(&self.inner.fail_execute).clone() {
            return Err(Error::Business(reason));
        }
        lock(&self.inner.executed).push(record.transaction_id);
        Ok(())
    }

    async fn sync_balance(
        &self,
        organization: Uuid,
        ledger: Uuid,
        balance: &Balance,
    ) -> Result<SyncOutcome, Error> {
        match lock(&self.inner.sync_behavior).clone() {
            SyncBehavior::Succeed(outcome) => {
                lock(&self.inner.synced).push((organization, ledger, balance.clone()));
                Ok(outcome)
            }
            SyncBehavior::Fail(reason) => Err(Error::Business(reason)),
        }
    }
}

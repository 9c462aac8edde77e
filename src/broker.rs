//! Broker ports: headers, deliveries, publishers, subscribers.
//!
//! The core never talks to a concrete broker client. Companion crates
//! adapt real connections to [`QueuePublisher`] / [`QueueSubscriber`];
//! tests use the in-memory broker. Consume loops receive deliveries over
//! a plain mpsc channel so workers drain them inside `select!` alongside
//! shutdown.

use crate::circuit_breaker::CircuitBreaker;
use crate::error::Error;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Correlation id propagated end to end.
pub const HEADER_CORRELATION_ID: &str = "x-correlation-id";
/// Upstream request id attached by the producing service.
pub const HEADER_REQUEST_ID: &str = "x-tideflow-header-id";
/// Primary-path retry counter bumped on each infrastructure republish.
pub const HEADER_RETRY_COUNT: &str = "x-tideflow-retry-count";
/// Tenant the message belongs to, in multi-tenant deployments.
pub const HEADER_TENANT_ID: &str = "x-tideflow-tenant-id";
pub const HEADER_CONTENT_TYPE: &str = "content-type";

/// Queue the dead-lettered message originally belonged to.
pub const HEADER_DLQ_ORIGINAL_QUEUE: &str = "x-dlq-original-queue";
/// Number of DLQ replays already attempted.
pub const HEADER_DLQ_RETRY_COUNT: &str = "x-dlq-retry-count";
/// Epoch second at which the message entered the DLQ.
pub const HEADER_DLQ_TIMESTAMP: &str = "x-dlq-timestamp";
/// Why the message was dead-lettered.
pub const HEADER_DLQ_REASON: &str = "x-dlq-reason";

/// Headers that survive a DLQ replay; everything else is dropped.
const REPLAY_ALLOW_LIST: &[&str] =
    &[HEADER_CORRELATION_ID, HEADER_REQUEST_ID, HEADER_CONTENT_TYPE];

/// Suffix appended to a queue name to form its dead-letter sibling.
pub const DLQ_SUFFIX: &str = ".dlq";

/// Dead-letter queue name for a primary queue.
pub fn dlq_queue_name(queue: &str) -> String {
    format!("{queue}{DLQ_SUFFIX}")
}

/// A broker header value. Brokers hand integers back as 32- or 64-bit
/// depending on the client, so the accessor normalizes both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Text(String),
    Int32(i32),
    Int64(i64),
}

impl HeaderValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int32(v) => Some(i64::from(*v)),
            HeaderValue::Int64(v) => Some(*v),
            HeaderValue::Text(v) => v.parse().ok(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// Ordered header map attached to every delivery and publish.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Headers(BTreeMap<String, HeaderValue>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_text(mut self, name: &str, value: impl Into<String>) -> Self {
        self.0.insert(name.to_string(), HeaderValue::Text(value.into()));
        self
    }

    pub fn set_i64(mut self, name: &str, value: i64) -> Self {
        self.0.insert(name.to_string(), HeaderValue::Int64(value));
        self
    }

    pub fn insert(&mut self, name: &str, value: HeaderValue) {
        self.0.insert(name.to_string(), value);
    }

    pub fn remove(&mut self, name: &str) {
        self.0.remove(name);
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.0.get(name)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(HeaderValue::as_i64)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(HeaderValue::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copy only the headers allowed to survive a DLQ replay: the fixed
    /// allow-list plus the `x-dlq-*` bookkeeping set. Attacker-controlled
    /// headers never make it back to the original queue.
    pub fn sanitize_for_replay(&self) -> Headers {
        let mut kept = Headers::new();
        for (name, value) in self.iter() {
            if REPLAY_ALLOW_LIST.contains(&name) || name.starts_with("x-dlq-") {
                kept.insert(name, value.clone());
            }
        }
        kept
    }
}

impl FromIterator<(String, HeaderValue)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, HeaderValue)>>(iter: I) -> Self {
        Headers(iter.into_iter().collect())
    }
}

/// Driver-side half of delivery settlement.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<(), Error>;
    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), Error>;
}

/// One message received from a queue. Settling the delivery consumes it.
pub struct Delivery {
    pub queue: String,
    pub body: Vec<u8>,
    pub headers: Headers,
    acker: Box<dyn Acknowledger>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("body_len", &self.body.len())
            .field("headers", &self.headers)
            .finish()
    }
}

impl Delivery {
    pub fn new(
        queue: impl Into<String>,
        body: Vec<u8>,
        headers: Headers,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self { queue: queue.into(), body, headers, acker }
    }

    pub async fn ack(self) -> Result<(), Error> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), Error> {
        self.acker.nack(requeue).await
    }
}

/// Broker acknowledgement of a confirmed publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Acked,
    Nacked,
    /// No confirm arrived within the caller's deadline.
    TimedOut,
}

/// Publish surface of the broker.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    /// Persistent publish to a queue's routing key.
    async fn publish(&self, queue: &str, body: &[u8], headers: &Headers) -> Result<(), Error>;

    /// Persistent publish on a confirm-mode channel, waiting up to
    /// `timeout` for the broker's verdict.
    async fn publish_confirmed(
        &self,
        queue: &str,
        body: &[u8],
        headers: &Headers,
        timeout: Duration,
    ) -> Result<Confirmation, Error>;
}

/// Consume surface of the broker.
#[async_trait]
pub trait QueueSubscriber: Send + Sync {
    /// Open a dedicated channel for `queue` with the given prefetch and
    /// stream its deliveries. The receiver closing tears the channel down.
    async fn subscribe(&self, queue: &str, prefetch: u16)
        -> Result<mpsc::Receiver<Delivery>, Error>;

    /// Bounded drain used by the DLQ consumer: at most `max` deliveries,
    /// returning early when the queue is empty.
    async fn pull(&self, queue: &str, max: usize) -> Result<Vec<Delivery>, Error>;
}

/// Per-tenant publisher resolution.
pub trait TenantPublishers: Send + Sync {
    fn publisher_for(&self, tenant: &str) -> Option<Arc<dyn QueuePublisher>>;
}

/// The publisher the workers actually hold. Variants share one uniform
/// publish surface; the guarded variant routes every call through the
/// circuit breaker.
#[derive(Clone)]
pub enum Publisher {
    Direct(Arc<dyn QueuePublisher>),
    Guarded { inner: Arc<dyn QueuePublisher>, breaker: CircuitBreaker },
    MultiTenant {
        directory: Arc<dyn TenantPublishers>,
        tenant: String,
        fallback: Arc<dyn QueuePublisher>,
    },
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Publisher::Direct(_) => f.write_str("Publisher::Direct"),
            Publisher::Guarded { breaker, .. } => {
                write!(f, "Publisher::Guarded({})", breaker.service())
            }
            Publisher::MultiTenant { tenant, .. } => {
                write!(f, "Publisher::MultiTenant({tenant})")
            }
        }
    }
}

impl Publisher {
    pub fn direct(inner: Arc<dyn QueuePublisher>) -> Self {
        Publisher::Direct(inner)
    }

    pub fn guarded(inner: Arc<dyn QueuePublisher>, breaker: CircuitBreaker) -> Self {
        Publisher::Guarded { inner, breaker }
    }

    fn tenant_inner(&self) -> Arc<dyn QueuePublisher> {
        match self {
            Publisher::Direct(inner) => inner.clone(),
            Publisher::Guarded { inner, .. } => inner.clone(),
            Publisher::MultiTenant { directory, tenant, fallback } => {
                directory.publisher_for(tenant).unwrap_or_else(|| fallback.clone())
            }
        }
    }

    pub async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        headers: &Headers,
    ) -> Result<(), Error> {
        match self {
            Publisher::Guarded { inner, breaker } => {
                breaker.execute(|| inner.publish(queue, body, headers)).await
            }
            _ => self.tenant_inner().publish(queue, body, headers).await,
        }
    }

    pub async fn publish_confirmed(
        &self,
        queue: &str,
        body: &[u8],
        headers: &Headers,
        timeout: Duration,
    ) -> Result<Confirmation, Error> {
        match self {
            Publisher::Guarded { inner, breaker } => {
                breaker
                    .execute(|| inner.publish_confirmed(queue, body, headers, timeout))
                    .await
            }
            _ => self.tenant_inner().publish_confirmed(queue, body, headers, timeout).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingPublisher {
        published: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl QueuePublisher for CountingPublisher {
        async fn publish(&self, _queue: &str, _body: &[u8], _headers: &Headers) -> Result<(), Error> {
            self.published.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::Broker("publish failed".into()))
            } else {
                Ok(())
            }
        }

        async fn publish_confirmed(
            &self,
            queue: &str,
            body: &[u8],
            headers: &Headers,
            _timeout: Duration,
        ) -> Result<Confirmation, Error> {
            self.publish(queue, body, headers).await?;
            Ok(Confirmation::Acked)
        }
    }

    #[test]
    fn header_ints_normalize_across_widths() {
        let mut headers = Headers::new().set_i64("a", 7).set_text("b", "12");
        headers.insert("c", HeaderValue::Int32(5));

        assert_eq!(headers.get_i64("a"), Some(7));
        assert_eq!(headers.get_i64("b"), Some(12));
        assert_eq!(headers.get_i64("c"), Some(5));
        assert_eq!(headers.get_i64("missing"), None);
    }

    #[test]
    fn replay_sanitizer_keeps_only_the_allow_list() {
        let headers = Headers::new()
            .set_text(HEADER_CORRELATION_ID, "corr-1")
            .set_text(HEADER_REQUEST_ID, "req-1")
            .set_text(HEADER_CONTENT_TYPE, "application/json")
            .set_text(HEADER_DLQ_ORIGINAL_QUEUE, "balances")
            .set_i64(HEADER_DLQ_RETRY_COUNT, 2)
            .set_i64(HEADER_DLQ_TIMESTAMP, 1_700_000_000)
            .set_text(HEADER_DLQ_REASON, "business")
            .set_i64(HEADER_RETRY_COUNT, 3)
            .set_text("x-evil-injected", "payload")
            .set_text("authorization", "Bearer stolen");

        let kept = headers.sanitize_for_replay();

        assert!(kept.contains(HEADER_CORRELATION_ID));
        assert!(kept.contains(HEADER_REQUEST_ID));
        assert!(kept.contains(HEADER_CONTENT_TYPE));
        assert!(kept.contains(HEADER_DLQ_ORIGINAL_QUEUE));
        assert!(kept.contains(HEADER_DLQ_RETRY_COUNT));
        assert!(kept.contains(HEADER_DLQ_TIMESTAMP));
        assert!(kept.contains(HEADER_DLQ_REASON));
        assert!(!kept.contains(HEADER_RETRY_COUNT));
        assert!(!kept.contains("x-evil-injected"));
        assert!(!kept.contains("authorization"));
        assert_eq!(kept.len(), 7);
    }

    #[test]
    fn dlq_names_append_the_suffix() {
        assert_eq!(dlq_queue_name("balance_create"), "balance_create.dlq");
    }

    #[tokio::test]
    async fn guarded_publisher_fails_fast_when_open() {
        let inner = Arc::new(CountingPublisher { fail: true, ..Default::default() });
        let breaker = CircuitBreaker::new(
            "broker",
            CircuitBreakerConfig { consecutive_failures: 1, ..CircuitBreakerConfig::default() },
        );
        let publisher = Publisher::guarded(inner.clone(), breaker);

        let first = publisher.publish("q", b"body", &Headers::new()).await;
        assert!(matches!(first, Err(Error::Broker(_))));
        assert_eq!(inner.published.load(Ordering::SeqCst), 1);

        // Tripped: the second call never reaches the inner publisher.
        let second = publisher.publish("q", b"body", &Headers::new()).await;
        assert!(matches!(second, Err(Error::CircuitOpen { .. })));
        assert_eq!(inner.published.load(Ordering::SeqCst), 1);
    }

    struct OneTenant {
        publisher: Arc<dyn QueuePublisher>,
    }

    impl TenantPublishers for OneTenant {
        fn publisher_for(&self, tenant: &str) -> Option<Arc<dyn QueuePublisher>> {
            (tenant == "t42").then(|| self.publisher.clone())
        }
    }

    #[tokio::test]
    async fn multi_tenant_publisher_resolves_or_falls_back() {
        let tenant_pub = Arc::new(CountingPublisher::default());
        let fallback = Arc::new(CountingPublisher::default());
        let directory = Arc::new(OneTenant { publisher: tenant_pub.clone() });

        let resolved = Publisher::MultiTenant {
            directory: directory.clone(),
            tenant: "t42".into(),
            fallback: fallback.clone(),
        };
        resolved.publish("q", b"x", &Headers::new()).await.unwrap();
        assert_eq!(tenant_pub.published.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.published.load(Ordering::SeqCst), 0);

        let unknown = Publisher::MultiTenant {
            directory,
            tenant: "t99".into(),
            fallback: fallback.clone(),
        };
        unknown.publish("q", b"x", &Headers::new()).await.unwrap();
        assert_eq!(fallback.published.load(Ordering::SeqCst), 1);
    }
}

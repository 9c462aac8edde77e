//! Circuit breaker guarding every publish to the broker.
//!
//! Semantics
//! - `closed -> open` when consecutive failures reach the threshold, or the
//!   failure ratio is reached once at least `min_requests` were observed.
//! - `open -> half_open` after the cooldown elapses, or immediately when a
//!   health probe reports the downstream recovered.
//! - `half_open -> closed` after `max_requests` consecutive successes;
//!   any failure reopens.
//! - In `closed`, counts are reset every `interval` so old traffic does not
//!   dominate the ratio.
//! - A request admitted before a transition still counts toward the state
//!   it lands in; there is no generation fencing, so a call that completes
//!   exactly at the cooldown boundary participates in half-open arithmetic.
//!
//! Listeners observe the counts as they were *before* a transition reset
//! them; the snapshot is taken under the same lock that performs the
//! transition.

use crate::clock::{Clock, SystemClock};
use crate::error::Error;
use crate::telemetry::{BreakerEvent, MetricsSink, NullSink, WorkerEvent};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Breaker state. The gauge encoding (0/1/2) is part of the metric
/// contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge value: 0=closed, 1=open, 2=half_open.
    pub fn as_gauge(&self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Request counters since the last state transition (or interval reset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counts {
    pub requests: u64,
    pub total_failures: u64,
    pub consecutive_failures: u64,
    pub consecutive_successes: u64,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }

    fn reset(&mut self) {
        *self = Counts::default();
    }
}

/// Breaker tuning. Defaults match the broker-publish deployment profile.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed breaker.
    pub consecutive_failures: u64,
    /// Failure ratio (0.0–1.0) that trips a closed breaker once
    /// `min_requests` have been observed.
    pub failure_ratio: f64,
    /// Ratio denominator floor.
    pub min_requests: u64,
    /// Concurrent probe budget in half-open; also the consecutive success
    /// count required to close.
    pub max_requests: u64,
    /// Count-reset window while closed. Zero disables the reset.
    pub interval: Duration,
    /// Open cooldown before half-open is attempted.
    pub timeout: Duration,
    /// Deadline applied to each guarded operation; a timeout counts as a
    /// failure. `None` disables the deadline.
    pub operation_timeout: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            consecutive_failures: 15,
            failure_ratio: 0.5,
            min_requests: 10,
            max_requests: 3,
            interval: Duration::from_secs(120),
            timeout: Duration::from_secs(30),
            operation_timeout: None,
        }
    }
}

struct Shared {
    state: CircuitState,
    counts: Counts,
    opened_at_ms: i64,
    interval_started_ms: i64,
    half_open_in_flight: u64,
}

/// Circuit breaker with an injectable clock and a metric sink listener.
#[derive(Clone)]
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    shared: Arc<Mutex<Shared>>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MetricsSink>,
    state_tx: Arc<watch::Sender<CircuitState>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("service", &self.service)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_parts(service, config, Arc::new(SystemClock), Arc::new(NullSink))
    }

    pub fn with_parts(
        service: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        let now = clock.now_millis();
        let (state_tx, _) = watch::channel(CircuitState::Closed);
        Self {
            service: service.into(),
            config,
            shared: Arc::new(Mutex::new(Shared {
                state: CircuitState::Closed,
                counts: Counts::default(),
                opened_at_ms: 0,
                interval_started_ms: now,
                half_open_in_flight: 0,
            })),
            clock,
            sink,
            state_tx: Arc::new(state_tx),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> CircuitState {
        self.shared.lock().unwrap_or_else(|p| p.into_inner()).state
    }

    pub fn counts(&self) -> Counts {
        self.shared.lock().unwrap_or_else(|p| p.into_inner()).counts
    }

    /// Watch channel carrying the current state; the health checker uses
    /// this to wake on transitions and manual resets.
    pub fn subscribe(&self) -> watch::Receiver<CircuitState> {
        self.state_tx.subscribe()
    }

    /// Execute an operation behind the breaker.
    ///
    /// Rejected calls return [`Error::CircuitOpen`] without running the
    /// operation. When `operation_timeout` is set, the deadline converts a
    /// hang into [`Error::Timeout`], which counts as a failure.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, Error>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        self.before_call()?;

        let result = match self.config.operation_timeout {
            Some(limit) => {
                let started = std::time::Instant::now();
                match tokio::time::timeout(limit, operation()).await {
                    Ok(inner) => inner,
                    Err(_) => Err(Error::Timeout { elapsed: started.elapsed(), limit }),
                }
            }
            None => operation().await,
        };

        self.after_call(result.is_ok());
        result
    }

    /// The health checker observed a successful probe: an open breaker
    /// moves to half-open immediately instead of waiting out the cooldown.
    pub fn probe_succeeded(&self) {
        let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
        if shared.state == CircuitState::Open {
            self.transition(&mut shared, CircuitState::HalfOpen);
        }
    }

    /// Manual reset back to closed. Fires the transition listener so the
    /// health checker re-evaluates.
    pub fn reset(&self) {
        let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
        if shared.state != CircuitState::Closed {
            self.transition(&mut shared, CircuitState::Closed);
        } else {
            shared.counts.reset();
            shared.interval_started_ms = self.clock.now_millis();
        }
    }

    fn before_call(&self) -> Result<(), Error> {
        let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());
        let now = self.clock.now_millis();

        match shared.state {
            CircuitState::Closed => {
                let interval_ms = self.config.interval.as_millis() as i64;
                if interval_ms > 0 && now - shared.interval_started_ms >= interval_ms {
                    shared.counts.reset();
                    shared.interval_started_ms = now;
                }
                shared.counts.on_request();
                Ok(())
            }
            CircuitState::Open => {
                let cooldown_ms = self.config.timeout.as_millis() as i64;
                if now - shared.opened_at_ms >= cooldown_ms {
                    self.transition(&mut shared, CircuitState::HalfOpen);
                    shared.half_open_in_flight += 1;
                    shared.counts.on_request();
                    Ok(())
                } else {
                    Err(Error::CircuitOpen { service: self.service.clone() })
                }
            }
            CircuitState::HalfOpen => {
                if shared.half_open_in_flight >= self.config.max_requests {
                    return Err(Error::CircuitOpen { service: self.service.clone() });
                }
                shared.half_open_in_flight += 1;
                shared.counts.on_request();
                Ok(())
            }
        }
    }

    fn after_call(&self, success: bool) {
        let mut shared = self.shared.lock().unwrap_or_else(|p| p.into_inner());

        if shared.state == CircuitState::HalfOpen {
            shared.half_open_in_flight = shared.half_open_in_flight.saturating_sub(1);
        }

        if success {
            shared.counts.on_success();
            if shared.state == CircuitState::HalfOpen
                && shared.counts.consecutive_successes >= self.config.max_requests
            {
                self.transition(&mut shared, CircuitState::Closed);
            }
        } else {
            shared.counts.on_failure();
            match shared.state {
                CircuitState::HalfOpen => self.transition(&mut shared, CircuitState::Open),
                CircuitState::Closed => {
                    if self.should_trip(&shared.counts) {
                        self.transition(&mut shared, CircuitState::Open);
                    }
                }
                CircuitState::Open => {}
            }
        }
    }

    fn should_trip(&self, counts: &Counts) -> bool {
        if counts.consecutive_failures >= self.config.consecutive_failures {
            return true;
        }
        counts.requests >= self.config.min_requests
            && (counts.total_failures as f64 / counts.requests as f64)
                >= self.config.failure_ratio
    }

    fn transition(&self, shared: &mut Shared, to: CircuitState) {
        let from = shared.state;
        if from == to {
            return;
        }

        // Snapshot before the reset so listeners see the counts that
        // caused the transition.
        let snapshot = shared.counts;

        shared.state = to;
        shared.counts.reset();
        match to {
            CircuitState::Open => shared.opened_at_ms = self.clock.now_millis(),
            CircuitState::HalfOpen => shared.half_open_in_flight = 0,
            CircuitState::Closed => shared.interval_started_ms = self.clock.now_millis(),
        }

        match to {
            CircuitState::Open => tracing::error!(
                service = %self.service,
                failures = snapshot.consecutive_failures,
                "circuit breaker -> open"
            ),
            CircuitState::HalfOpen => {
                tracing::info!(service = %self.service, "circuit breaker -> half-open")
            }
            CircuitState::Closed => {
                tracing::info!(service = %self.service, "circuit breaker -> closed")
            }
        }

        self.sink.record(&WorkerEvent::Breaker(BreakerEvent::Transition {
            service: self.service.clone(),
            from,
            to,
            counts: snapshot,
        }));
        let _ = self.state_tx.send(to);
    }
}

/// Registry of named breakers for operator access (reset/inspection).
#[derive(Default, Clone, Debug)]
pub struct CircuitBreakerRegistry {
    inner: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a breaker under its service name. An existing entry is
    /// overwritten.
    pub fn register(&self, breaker: CircuitBreaker) {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(breaker.service().to_string(), breaker);
    }

    pub fn get(&self, service: &str) -> Option<CircuitBreaker> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).get(service).cloned()
    }

    /// Reset a registered breaker by service name.
    pub fn reset(&self, service: &str) -> Result<(), Error> {
        match self.get(service) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => Err(Error::Config(format!("unknown breaker: {service}"))),
        }
    }

    /// Snapshot of all breaker states, sorted by service name.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::telemetry::MemorySink;

    fn breaker_with(
        config: CircuitBreakerConfig,
    ) -> (CircuitBreaker, ManualClock, MemorySink) {
        let clock = ManualClock::at(1_000_000);
        let sink = MemorySink::new();
        let breaker = CircuitBreaker::with_parts(
            "broker",
            config,
            Arc::new(clock.clone()),
            Arc::new(sink.clone()),
        );
        (breaker, clock, sink)
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .execute(|| async { Err::<(), _>(Error::Broker("publish failed".into())) })
            .await;
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32, Error> {
        breaker.execute(|| async { Ok(42) }).await
    }

    #[tokio::test]
    async fn trips_after_consecutive_failures() {
        let (breaker, _clock, sink) = breaker_with(CircuitBreakerConfig {
            consecutive_failures: 15,
            ..CircuitBreakerConfig::default()
        });

        for _ in 0..14 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // Fast rejection without running the operation.
        let result = succeed(&breaker).await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));

        // Listener saw the pre-transition counts.
        let transitions: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                WorkerEvent::Breaker(BreakerEvent::Transition { from, to, counts, .. }) => {
                    Some((from, to, counts))
                }
                _ => None,
            })
            .collect();
        assert_eq!(transitions.len(), 1);
        let (from, to, counts) = &transitions[0];
        assert_eq!(*from, CircuitState::Closed);
        assert_eq!(*to, CircuitState::Open);
        assert_eq!(counts.consecutive_failures, 15);
        assert_eq!(counts.requests, 15);
    }

    #[tokio::test]
    async fn trips_on_failure_ratio_once_min_requests_met() {
        let (breaker, _clock, _sink) = breaker_with(CircuitBreakerConfig {
            consecutive_failures: 1_000,
            failure_ratio: 0.5,
            min_requests: 10,
            ..CircuitBreakerConfig::default()
        });

        // Alternate: 5 failures / 9 requests is above ratio but below the
        // denominator floor.
        for _ in 0..4 {
            fail(&breaker).await;
            let _ = succeed(&breaker).await;
        }
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail(&breaker).await; // 6 failures / 10 requests
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn cooldown_admits_half_open_probes() {
        let (breaker, clock, _sink) = breaker_with(CircuitBreakerConfig {
            consecutive_failures: 1,
            timeout: Duration::from_secs(30),
            max_requests: 3,
            ..CircuitBreakerConfig::default()
        });

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(succeed(&breaker).await.is_err());

        clock.advance_secs(30);
        assert_eq!(succeed(&breaker).await.unwrap(), 42);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Two more consecutive successes close it (max_requests = 3).
        let _ = succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let _ = succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let (breaker, clock, _sink) = breaker_with(CircuitBreakerConfig {
            consecutive_failures: 1,
            timeout: Duration::from_secs(30),
            ..CircuitBreakerConfig::default()
        });

        fail(&breaker).await;
        clock.advance_secs(30);
        let _ = succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_bounds_concurrent_probes() {
        let (breaker, clock, _sink) = breaker_with(CircuitBreakerConfig {
            consecutive_failures: 1,
            timeout: Duration::from_secs(1),
            max_requests: 1,
            ..CircuitBreakerConfig::default()
        });

        fail(&breaker).await;
        clock.advance_secs(1);

        let gate = Arc::new(tokio::sync::Notify::new());
        let slow = {
            let breaker = breaker.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        gate.notified().await;
                        Ok::<_, Error>(1)
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        // Budget of one probe is in flight; the next call is rejected.
        let rejected = succeed(&breaker).await;
        assert!(matches!(rejected, Err(Error::CircuitOpen { .. })));

        gate.notify_one();
        assert_eq!(slow.await.unwrap().unwrap(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn interval_resets_closed_counts() {
        let (breaker, clock, _sink) = breaker_with(CircuitBreakerConfig {
            consecutive_failures: 1_000,
            failure_ratio: 0.5,
            min_requests: 4,
            interval: Duration::from_secs(120),
            ..CircuitBreakerConfig::default()
        });

        fail(&breaker).await;
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.counts().total_failures, 3);

        clock.advance_secs(120);
        let _ = succeed(&breaker).await;
        // Counts restarted with the new interval window.
        assert_eq!(breaker.counts().total_failures, 0);
        assert_eq!(breaker.counts().requests, 1);
    }

    #[tokio::test]
    async fn successful_probe_short_circuits_cooldown() {
        let (breaker, _clock, _sink) = breaker_with(CircuitBreakerConfig {
            consecutive_failures: 1,
            timeout: Duration::from_secs(3_600),
            ..CircuitBreakerConfig::default()
        });

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.probe_succeeded();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn operation_timeout_counts_as_failure() {
        let (breaker, _clock, _sink) = breaker_with(CircuitBreakerConfig {
            consecutive_failures: 1,
            operation_timeout: Some(Duration::from_millis(10)),
            ..CircuitBreakerConfig::default()
        });

        let result: Result<(), Error> = breaker
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn manual_reset_closes_and_notifies() {
        let (breaker, _clock, _sink) = breaker_with(CircuitBreakerConfig {
            consecutive_failures: 1,
            ..CircuitBreakerConfig::default()
        });
        let mut watch = breaker.subscribe();

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        watch.changed().await.unwrap();
        assert_eq!(*watch.borrow_and_update(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        watch.changed().await.unwrap();
        assert_eq!(*watch.borrow_and_update(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn registry_resets_by_service_name() {
        let registry = CircuitBreakerRegistry::new();
        let (breaker, _clock, _sink) = breaker_with(CircuitBreakerConfig {
            consecutive_failures: 1,
            ..CircuitBreakerConfig::default()
        });
        registry.register(breaker.clone());

        fail(&breaker).await;
        assert_eq!(registry.snapshot(), vec![("broker".to_string(), CircuitState::Open)]);

        registry.reset("broker").unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(registry.reset("nope").is_err());
    }
}

//! Active health probing for an open circuit breaker.
//!
//! The checker is state-aware: while the breaker is closed it parks on the
//! breaker's state channel and costs nothing. In open or half-open it
//! ticks at `interval`, invoking the probe with a per-call deadline. A
//! successful probe moves an open breaker straight to half-open instead of
//! waiting out the cooldown. Manual resets publish a state change, which
//! wakes the checker for re-evaluation.

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::error::Error;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{BreakerEvent, MetricsSink, NullSink, WorkerEvent};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// User-supplied reachability probe for the guarded downstream.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<(), Error>;
}

/// Probe built from a closure, for wiring and tests.
pub struct FnProbe<F>(pub F);

#[async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), Error>> + Send,
{
    async fn check(&self) -> Result<(), Error> {
        (self.0)().await
    }
}

/// Probe loop configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct HealthCheckerConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(30), timeout: Duration::from_secs(10) }
    }
}

/// Drives probes against the downstream while the breaker is not closed.
pub struct HealthChecker {
    breaker: CircuitBreaker,
    probe: Arc<dyn HealthProbe>,
    config: HealthCheckerConfig,
    sleeper: Arc<dyn Sleeper>,
    sink: Arc<dyn MetricsSink>,
}

impl HealthChecker {
    pub fn new(
        breaker: CircuitBreaker,
        probe: Arc<dyn HealthProbe>,
        config: HealthCheckerConfig,
    ) -> Self {
        Self {
            breaker,
            probe,
            config,
            sleeper: Arc::new(TokioSleeper),
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut state_rx = self.breaker.subscribe();

        loop {
            if *shutdown.borrow() {
                return;
            }

            let current_state = *state_rx.borrow_and_update();
            match current_state {
                CircuitState::Closed => {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        changed = state_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }
                CircuitState::Open | CircuitState::HalfOpen => {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        changed = state_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        _ = self.sleeper.sleep(self.config.interval) => {
                            self.probe_once().await;
                        }
                    }
                }
            }
        }
    }

    async fn probe_once(&self) {
        let healthy =
            match tokio::time::timeout(self.config.timeout, self.probe.check()).await {
                Ok(Ok(())) => true,
                Ok(Err(err)) => {
                    tracing::debug!(service = %self.breaker.service(), %err, "health probe failed");
                    false
                }
                Err(_) => {
                    tracing::debug!(service = %self.breaker.service(), "health probe timed out");
                    false
                }
            };

        self.sink.record(&WorkerEvent::Breaker(BreakerEvent::Probe {
            service: self.breaker.service().to_string(),
            healthy,
        }));

        if healthy {
            self.breaker.probe_succeeded();
        }
    }
}

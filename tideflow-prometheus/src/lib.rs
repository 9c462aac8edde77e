#![forbid(unsafe_code)]

//! Prometheus metrics sink for `tideflow` worker events.
//! Bring your own `prometheus::Registry`; counters and gauges are
//! registered on construction and updated per event.

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};
use std::sync::Arc;
use tideflow::telemetry::{
    BalanceSyncEvent, BreakerEvent, ConsumerEvent, DlqEvent, MetricsSink, OutboxEvent,
    StaleTxEvent, TenantEvent, WorkerEvent,
};

#[derive(Clone)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    events: IntCounterVec,
    breaker_transitions: IntCounterVec,
    breaker_state: IntGaugeVec,
    breaker_counts: IntGaugeVec,
    balance_synced: IntCounterVec,
    tenant_connections: IntCounterVec,
    dlq_lost: IntCounterVec,
    failures: IntCounterVec,
}

impl std::fmt::Debug for PrometheusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrometheusSink")
    }
}

impl PrometheusSink {
    /// Create a sink and register its metrics into the provided registry.
    ///
    /// # Errors
    /// Returns an error when a metric cannot be registered (e.g. name
    /// conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();

        let events = IntCounterVec::new(
            Opts::new("tideflow_events_total", "Worker events by subsystem"),
            &["subsystem", "event"],
        )?;
        let breaker_transitions = IntCounterVec::new(
            Opts::new("tideflow_breaker_transitions_total", "Circuit breaker transitions"),
            &["service", "from_state", "to_state"],
        )?;
        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "tideflow_breaker_state",
                "Circuit breaker state (0=closed, 1=open, 2=half_open)",
            ),
            &["service"],
        )?;
        let breaker_counts = IntGaugeVec::new(
            Opts::new(
                "tideflow_breaker_counts",
                "Circuit breaker counters as observed before the last transition",
            ),
            &["service", "field"],
        )?;
        let balance_synced = IntCounterVec::new(
            Opts::new("tideflow_balance_synced_total", "Balances flushed to the durable store"),
            &["organization", "ledger"],
        )?;
        let tenant_connections = IntCounterVec::new(
            Opts::new("tideflow_tenant_connections_total", "Tenant store handle resolutions"),
            &["tenant", "db", "outcome"],
        )?;
        let dlq_lost = IntCounterVec::new(
            Opts::new("tideflow_dlq_messages_lost_total", "Dead-letter messages dropped for good"),
            &["queue"],
        )?;
        let failures = IntCounterVec::new(
            Opts::new("tideflow_failures_total", "Classified worker failures"),
            &["service", "error_kind"],
        )?;

        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(breaker_transitions.clone()))?;
        registry.register(Box::new(breaker_state.clone()))?;
        registry.register(Box::new(breaker_counts.clone()))?;
        registry.register(Box::new(balance_synced.clone()))?;
        registry.register(Box::new(tenant_connections.clone()))?;
        registry.register(Box::new(dlq_lost.clone()))?;
        registry.register(Box::new(failures.clone()))?;

        Ok(Self {
            registry,
            events,
            breaker_transitions,
            breaker_state,
            breaker_counts,
            balance_synced,
            tenant_connections,
            dlq_lost,
            failures,
        })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn labels(event: &WorkerEvent) -> (&'static str, &'static str) {
        match event {
            WorkerEvent::Breaker(e) => (
                "breaker",
                match e {
                    BreakerEvent::Transition { .. } => "transition",
                    BreakerEvent::Probe { healthy: true, .. } => "probe_healthy",
                    BreakerEvent::Probe { healthy: false, .. } => "probe_unhealthy",
                },
            ),
            WorkerEvent::Consumer(e) => (
                "consumer",
                match e {
                    ConsumerEvent::ValidationRejected { .. } => "validation_rejected",
                    ConsumerEvent::Retried { .. } => "retried",
                    ConsumerEvent::DeadLettered { .. } => "dead_lettered",
                    ConsumerEvent::Handled { .. } => "handled",
                },
            ),
            WorkerEvent::Dlq(e) => (
                "dlq",
                match e {
                    DlqEvent::Replayed { .. } => "replayed",
                    DlqEvent::UnknownQueueDropped { .. } => "unknown_queue_dropped",
                    DlqEvent::MessageLost { .. } => "message_lost",
                    DlqEvent::TickCompleted { .. } => "tick_completed",
                },
            ),
            WorkerEvent::BalanceSync(e) => (
                "balance_sync",
                match e {
                    BalanceSyncEvent::Synced { .. } => "synced",
                    BalanceSyncEvent::MemberDropped { .. } => "member_dropped",
                },
            ),
            WorkerEvent::StaleTx(e) => (
                "stale_tx",
                match e {
                    StaleTxEvent::Replayed { .. } => "replayed",
                    StaleTxEvent::LockContended { .. } => "lock_contended",
                },
            ),
            WorkerEvent::Outbox(e) => (
                "outbox",
                match e {
                    OutboxEvent::Published { .. } => "published",
                    OutboxEvent::RetryScheduled { .. } => "retry_scheduled",
                    OutboxEvent::DeadLettered { .. } => "dead_lettered",
                    OutboxEvent::Cleaned { .. } => "cleaned",
                },
            ),
            WorkerEvent::Tenant(e) => (
                "tenant",
                match e {
                    TenantEvent::ConnectionEstablished { .. } => "connection_established",
                    TenantEvent::ConnectionError { .. } => "connection_error",
                },
            ),
            WorkerEvent::Failure(_) => ("failure", "failure"),
        }
    }
}

impl MetricsSink for PrometheusSink {
    fn record(&self, event: &WorkerEvent) {
        let (subsystem, name) = Self::labels(event);
        self.events.with_label_values(&[subsystem, name]).inc();

        match event {
            WorkerEvent::Breaker(BreakerEvent::Transition { service, from, to, counts }) => {
                self.breaker_transitions
                    .with_label_values(&[service.as_str(), from.as_str(), to.as_str()])
                    .inc();
                self.breaker_state
                    .with_label_values(&[service.as_str()])
                    .set(i64::from(to.as_gauge()));
                for (field, value) in [
                    ("requests", counts.requests),
                    ("total_failures", counts.total_failures),
                    ("consecutive_failures", counts.consecutive_failures),
                    ("consecutive_successes", counts.consecutive_successes),
                ] {
                    self.breaker_counts
                        .with_label_values(&[service.as_str(), field])
                        .set(value as i64);
                }
            }
            WorkerEvent::BalanceSync(BalanceSyncEvent::Synced { organization, ledger }) => {
                let organization = organization.to_string();
                let ledger = ledger.to_string();
                self.balance_synced
                    .with_label_values(&[organization.as_str(), ledger.as_str()])
                    .inc();
            }
            WorkerEvent::Tenant(TenantEvent::ConnectionEstablished { tenant, store }) => {
                self.tenant_connections
                    .with_label_values(&[tenant.as_str(), store.as_str(), "established"])
                    .inc();
            }
            WorkerEvent::Tenant(TenantEvent::ConnectionError { tenant, store }) => {
                self.tenant_connections
                    .with_label_values(&[tenant.as_str(), store.as_str(), "error"])
                    .inc();
            }
            WorkerEvent::Dlq(DlqEvent::MessageLost { queue }) => {
                self.dlq_lost.with_label_values(&[queue.as_str()]).inc();
            }
            WorkerEvent::Failure(failure) => {
                self.failures
                    .with_label_values(&[failure.service.as_str(), failure.kind.as_str()])
                    .inc();
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tideflow::{CircuitState, Counts};
    use uuid::Uuid;

    fn gather_value(registry: &Registry, name: &str) -> f64 {
        registry
            .gather()
            .iter()
            .filter(|family| family.get_name() == name)
            .flat_map(|family| family.get_metric())
            .map(|metric| metric.get_counter().value() + metric.get_gauge().value())
            .sum()
    }

    #[test]
    fn breaker_transition_sets_state_and_counts() {
        let sink = PrometheusSink::new(Registry::new()).unwrap();
        sink.record(&WorkerEvent::Breaker(BreakerEvent::Transition {
            service: "broker".into(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
            counts: Counts {
                requests: 15,
                total_failures: 15,
                consecutive_failures: 15,
                consecutive_successes: 0,
            },
        }));

        assert_eq!(gather_value(sink.registry(), "tideflow_breaker_transitions_total"), 1.0);
        assert_eq!(gather_value(sink.registry(), "tideflow_breaker_state"), 1.0);
        assert_eq!(gather_value(sink.registry(), "tideflow_events_total"), 1.0);
    }

    #[test]
    fn balance_synced_is_labeled_per_ledger() {
        let sink = PrometheusSink::new(Registry::new()).unwrap();
        let event = WorkerEvent::BalanceSync(BalanceSyncEvent::Synced {
            organization: Uuid::from_u128(1),
            ledger: Uuid::from_u128(2),
        });
        sink.record(&event);
        sink.record(&event);

        assert_eq!(gather_value(sink.registry(), "tideflow_balance_synced_total"), 2.0);
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let registry = Arc::new(Registry::new());
        assert!(PrometheusSink::new(registry.clone()).is_ok());
        assert!(PrometheusSink::new(registry).is_err());
    }
}

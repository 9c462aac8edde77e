//! Breaker trip and probe-driven recovery across publisher and checker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tideflow::memory::MemoryBroker;
use tideflow::prelude::*;
use tideflow::telemetry::BreakerEvent;
use tideflow::{CircuitBreaker, FnProbe, ManualClock};

#[tokio::test]
async fn fifteen_failures_trip_and_a_probe_recovers() {
    let clock = ManualClock::at(1_700_000_000);
    let sink = MemorySink::new();
    let breaker = CircuitBreaker::with_parts(
        "broker",
        CircuitBreakerConfig { timeout: Duration::from_secs(3_600), ..Default::default() },
        Arc::new(clock.clone()),
        Arc::new(sink.clone()),
    );

    let broker = MemoryBroker::new();
    let publisher = Publisher::guarded(Arc::new(broker.clone()), breaker.clone());

    // The broker is down: fifteen identical publish failures.
    broker.set_publish_failure(true);
    for _ in 0..15 {
        let err = publisher.publish("balances", b"m", &Headers::new()).await.unwrap_err();
        assert!(matches!(err, Error::Broker(_)));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // Fast-fail without touching the broker while open.
    let rejected = publisher.publish("balances", b"m", &Headers::new()).await.unwrap_err();
    assert!(rejected.is_circuit_open());

    let transitions = sink.count_where(|e| {
        matches!(
            e,
            WorkerEvent::Breaker(BreakerEvent::Transition {
                from: CircuitState::Closed,
                to: CircuitState::Open,
                counts,
                ..
            }) if counts.consecutive_failures == 15
        )
    });
    assert_eq!(transitions, 1);

    // The health checker is active only now that the breaker is open; a
    // successful probe moves it to half-open without waiting the hour out.
    let healthy = Arc::new(AtomicBool::new(false));
    let probe_flag = healthy.clone();
    let checker = HealthChecker::new(
        breaker.clone(),
        Arc::new(FnProbe(move || {
            let healthy = probe_flag.clone();
            async move {
                if healthy.load(Ordering::SeqCst) {
                    Ok(())
                } else {
                    Err(Error::Broker("still down".into()))
                }
            }
        })),
        HealthCheckerConfig {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(100),
        },
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(async move { checker.run(shutdown_rx).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    broker.set_publish_failure(false);
    healthy.store(true, Ordering::SeqCst);
    for _ in 0..100 {
        if breaker.state() == CircuitState::HalfOpen {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    // Three consecutive successful publishes close the breaker again.
    for _ in 0..3 {
        publisher.publish("balances", b"m", &Headers::new()).await.unwrap();
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(broker.depth("balances"), 3);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

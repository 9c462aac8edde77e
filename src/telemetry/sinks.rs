//! Metric sinks consuming worker events.
//!
//! A sink is shared by every worker task as an `Arc<dyn MetricsSink>`, so
//! the trait is object-safe and recording is synchronous and infallible.
//! Exporter-backed sinks live in companion crates.

use super::events::WorkerEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A sink that consumes worker events.
pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    fn record(&self, event: &WorkerEvent);
}

/// A no-op sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record(&self, _event: &WorkerEvent) {}
}

/// A sink that logs events through the `tracing` crate.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn record(&self, event: &WorkerEvent) {
        tracing::info!(event = %event, "worker_event");
    }
}

/// A sink that stores events in memory, for tests and local inspection.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<WorkerEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<WorkerEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Count recorded events matching a predicate.
    pub fn count_where<F: Fn(&WorkerEvent) -> bool>(&self, predicate: F) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| predicate(e))
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for MemorySink {
    fn record(&self, event: &WorkerEvent) {
        let mut guard = self.events.lock().unwrap_or_else(|p| p.into_inner());
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event.clone());
    }
}

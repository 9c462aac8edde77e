//! Lifecycle launcher.
//!
//! Runs every registered worker concurrently under one shutdown channel.
//! The group follows first-return semantics: as soon as any worker
//! returns (or the process receives an interrupt/terminate signal) the
//! shutdown flag flips and the launcher waits for the rest to drain.

use crate::balance_sync::BalanceSyncWorker;
use crate::consumer::MultiQueueConsumer;
use crate::dlq::DlqConsumer;
use crate::error::Error;
use crate::health::HealthChecker;
use crate::outbox::MetadataOutboxWorker;
use crate::stale_tx::StaleTransactionSweeper;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// A long-running component the launcher supervises.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    /// Run until the shutdown flag flips. A clean shutdown returns `Ok`.
    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), Error>;
}

/// Supervises the execution core's workers.
#[derive(Default)]
pub struct Launcher {
    workers: Vec<Arc<dyn Worker>>,
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.workers.iter().map(|w| w.name()).collect();
        f.debug_struct("Launcher").field("workers", &names).finish()
    }
}

impl Launcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, worker: Arc<dyn Worker>) -> Self {
        self.workers.push(worker);
        self
    }

    /// Run all workers until an interrupt/terminate signal or the first
    /// worker return.
    pub async fn run(&self) -> Result<(), Error> {
        self.run_with_signal(shutdown_signal()).await
    }

    /// Like [`run`](Self::run) with a caller-supplied shutdown future, so
    /// embedders and tests control the trigger.
    pub async fn run_with_signal<F>(&self, signal: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send,
    {
        if self.workers.is_empty() {
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: JoinSet<(String, Result<(), Error>)> = JoinSet::new();
        for worker in &self.workers {
            let worker = worker.clone();
            let rx = shutdown_rx.clone();
            tasks.spawn(async move {
                let name = worker.name().to_string();
                tracing::info!(worker = %name, "worker starting");
                let result = worker.run(rx).await;
                (name, result)
            });
        }
        drop(shutdown_rx);

        let mut first_error: Option<Error> = None;

        tokio::pin!(signal);
        tokio::select! {
            _ = &mut signal => {
                tracing::info!("shutdown signal received");
            }
            joined = tasks.join_next() => {
                Self::collect(joined, &mut first_error);
            }
        }

        // First return (or the signal) propagates to the group.
        let _ = shutdown_tx.send(true);
        while let Some(joined) = tasks.join_next().await {
            Self::collect(Some(joined), &mut first_error);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn collect(
        joined: Option<Result<(String, Result<(), Error>), tokio::task::JoinError>>,
        first_error: &mut Option<Error>,
    ) {
        match joined {
            Some(Ok((name, Ok(())))) => {
                tracing::info!(worker = %name, "worker returned");
            }
            Some(Ok((name, Err(err)))) => {
                tracing::error!(worker = %name, %err, "worker failed");
                if first_error.is_none() {
                    *first_error = Some(err);
                }
            }
            Some(Err(join_err)) => {
                tracing::error!(%join_err, "worker task aborted");
                if first_error.is_none() {
                    *first_error = Some(Error::PanicRecovered(join_err.to_string()));
                }
            }
            None => {}
        }
    }
}

/// Resolves when the process receives an interrupt or terminate signal.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to install interrupt handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}

#[async_trait]
impl Worker for BalanceSyncWorker {
    fn name(&self) -> &str {
        "balance_sync"
    }

    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        BalanceSyncWorker::run(self, shutdown).await
    }
}

#[async_trait]
impl Worker for MultiQueueConsumer {
    fn name(&self) -> &str {
        "multi_queue_consumer"
    }

    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        MultiQueueConsumer::run(self, shutdown).await
    }
}

#[async_trait]
impl Worker for DlqConsumer {
    fn name(&self) -> &str {
        "dlq_consumer"
    }

    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        DlqConsumer::run(self, shutdown).await
    }
}

#[async_trait]
impl Worker for StaleTransactionSweeper {
    fn name(&self) -> &str {
        "stale_transaction_sweeper"
    }

    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        StaleTransactionSweeper::run(self, shutdown).await
    }
}

#[async_trait]
impl Worker for MetadataOutboxWorker {
    fn name(&self) -> &str {
        "metadata_outbox"
    }

    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        MetadataOutboxWorker::run(self, shutdown).await
    }
}

#[async_trait]
impl Worker for HealthChecker {
    fn name(&self) -> &str {
        "broker_health_checker"
    }

    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        HealthChecker::run(self, shutdown).await;
        Ok(())
    }
}

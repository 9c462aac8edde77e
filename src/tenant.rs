//! Per-tenant store resolution.
//!
//! Every unit of work passes through [`TenantResolver::resolve`] before
//! the use case runs. Single-tenant deployments (empty tenant id, or no
//! directory wired) pass the context through untouched; resolution
//! failures surface as errors so the delivery is nacked for redelivery.

use crate::error::Error;
use crate::telemetry::{MetricsSink, NullSink, TenantEvent, TenantStoreKind, WorkerEvent};
use crate::usecase::{ExecutionContext, TenantDirectory, TenantStores};
use std::sync::Arc;

pub struct TenantResolver {
    enabled: bool,
    directory: Option<Arc<dyn TenantDirectory>>,
    sink: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for TenantResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantResolver")
            .field("enabled", &self.enabled)
            .field("directory", &self.directory.is_some())
            .finish()
    }
}

impl TenantResolver {
    pub fn new(enabled: bool, directory: Option<Arc<dyn TenantDirectory>>) -> Self {
        Self { enabled, directory, sink: Arc::new(NullSink) }
    }

    /// Single-tenant resolver: every context passes through unchanged.
    pub fn disabled() -> Self {
        Self::new(false, None)
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// True when resolution will actually happen: the feature is enabled
    /// and a directory is wired. Otherwise every worker falls back to the
    /// shared single-tenant handles.
    pub fn is_ready(&self) -> bool {
        self.enabled && self.directory.is_some()
    }

    /// Attach per-tenant store handles to the context.
    ///
    /// A context without a tenant id, or a resolver without a directory,
    /// comes back unchanged. A directory failure is an error so the
    /// caller can nack the delivery and retry on redelivery.
    pub async fn resolve(&self, ctx: ExecutionContext) -> Result<ExecutionContext, Error> {
        let Some(tenant) = ctx.tenant().map(str::to_owned) else {
            return Ok(ctx);
        };
        let Some(directory) = self.directory.as_ref().filter(|_| self.enabled) else {
            return Ok(ctx);
        };

        let relational = match directory.relational_for(&tenant).await {
            Ok(handle) => {
                self.sink.record(&WorkerEvent::Tenant(TenantEvent::ConnectionEstablished {
                    tenant: tenant.clone(),
                    store: TenantStoreKind::Relational,
                }));
                handle
            }
            Err(err) => {
                tracing::warn!(%tenant, %err, "tenant relational handle resolution failed");
                self.sink.record(&WorkerEvent::Tenant(TenantEvent::ConnectionError {
                    tenant: tenant.clone(),
                    store: TenantStoreKind::Relational,
                }));
                return Err(Error::TenantResolution { tenant, reason: err.to_string() });
            }
        };

        let documents = match directory.documents_for(&tenant).await {
            Ok(handle) => {
                self.sink.record(&WorkerEvent::Tenant(TenantEvent::ConnectionEstablished {
                    tenant: tenant.clone(),
                    store: TenantStoreKind::Document,
                }));
                Some(handle)
            }
            Err(err) => {
                tracing::warn!(%tenant, %err, "tenant document handle resolution failed");
                self.sink.record(&WorkerEvent::Tenant(TenantEvent::ConnectionError {
                    tenant: tenant.clone(),
                    store: TenantStoreKind::Document,
                }));
                return Err(Error::TenantResolution { tenant, reason: err.to_string() });
            }
        };

        Ok(ExecutionContext {
            tenant_id: Some(tenant),
            stores: Some(TenantStores { relational, documents }),
        })
    }
}

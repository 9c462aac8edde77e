//! Seams to the synchronous command layer and the tenant manager.
//!
//! Transaction construction and double-entry validation live outside this
//! crate; the workers drive them through [`TransactionCommands`]. Every
//! unit of work carries an [`ExecutionContext`] so multi-tenant
//! deployments can swap store handles per delivery.

use crate::domain::{Balance, StaleTransactionRecord};
use crate::error::Error;
use crate::messages::{BalanceCreateMessage, BalanceOperationMessage};
use crate::stores::{DocumentStore, LedgerStore};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Per-tenant store handles attached to a resolved context.
#[derive(Clone)]
pub struct TenantStores {
    pub relational: Arc<dyn LedgerStore>,
    pub documents: Option<Arc<dyn DocumentStore>>,
}

impl std::fmt::Debug for TenantStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantStores")
            .field("documents", &self.documents.is_some())
            .finish()
    }
}

/// Unit-of-work carrier. A context without stores uses the process-wide
/// single-tenant handles.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub tenant_id: Option<String>,
    pub stores: Option<TenantStores>,
}

impl ExecutionContext {
    pub fn single_tenant() -> Self {
        Self::default()
    }

    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self { tenant_id: Some(tenant_id.into()), stores: None }
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant_id.as_deref().filter(|t| !t.is_empty())
    }
}

/// Tenant summary returned by the tenant manager service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantSummary {
    pub id: String,
    pub name: String,
}

/// External tenant manager: lists active tenants and resolves per-tenant
/// store handles.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn active_tenants(&self, service: &str) -> Result<Vec<TenantSummary>, Error>;

    async fn relational_for(&self, tenant: &str) -> Result<Arc<dyn LedgerStore>, Error>;

    async fn documents_for(&self, tenant: &str) -> Result<Arc<dyn DocumentStore>, Error>;
}

/// Outcome of flushing a cached balance to the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The row was written.
    Synced,
    /// The store already held a newer version; nothing to do.
    SkippedNewer,
}

/// The command use case driven by the workers.
#[async_trait]
pub trait TransactionCommands: Send + Sync {
    /// Create the balance described by a creation message.
    async fn create_balance(
        &self,
        ctx: &ExecutionContext,
        message: &BalanceCreateMessage,
    ) -> Result<(), Error>;

    /// Apply a balance transaction operation asynchronously.
    async fn create_balance_operations(
        &self,
        ctx: &ExecutionContext,
        message: &BalanceOperationMessage,
    ) -> Result<(), Error>;

    /// Re-drive an aged in-flight transaction through the async executor.
    /// Idempotent per transaction id.
    async fn send_bto_execute(
        &self,
        ctx: &ExecutionContext,
        record: &StaleTransactionRecord,
    ) -> Result<(), Error>;

    /// Flush a cached balance to the durable store.
    async fn sync_balance(
        &self,
        organization: Uuid,
        ledger: Uuid,
        balance: &Balance,
    ) -> Result<SyncOutcome, Error>;
}

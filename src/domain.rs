//! Core data model shared by the workers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Default lifetime of a cached balance entry.
pub const BALANCE_CACHE_TTL: Duration = Duration::from_secs(600);

/// Hash-tagged prefix shared by every balance cache key so all balance
/// entries land in the same cluster slot.
pub const BALANCE_KEY_PREFIX: &str = "balance:{transactions}";

/// A record of current and on-hold funds for one (account, asset, key)
/// triple. While the cache entry exists it is the most recent value;
/// absence means "consult the durable store".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub ledger_id: Uuid,
    pub account_id: Uuid,
    pub alias: String,
    #[serde(default)]
    pub key: String,
    pub asset_code: String,
    pub available: i64,
    pub on_hold: i64,
    pub version: i64,
    #[serde(default)]
    pub account_type: String,
    pub allow_sending: bool,
    pub allow_receiving: bool,
}

/// Build the cache key for an account sub-balance.
pub fn balance_cache_key(organization: &Uuid, ledger: &Uuid, suffix: &str) -> String {
    format!("{BALANCE_KEY_PREFIX}:{organization}:{ledger}:{suffix}")
}

/// Extract the organization and ledger ids from a schedule member.
///
/// The member is the cache key itself; the first two `:`-separated
/// segments that look like UUIDs (36 chars) are taken, in order, as the
/// organization and ledger id. Aliases and key suffixes never match
/// because they are not UUID-shaped.
pub fn parse_schedule_member(member: &str) -> Option<(Uuid, Uuid)> {
    let mut found = member
        .split(':')
        .filter(|segment| segment.len() == 36)
        .filter_map(|segment| Uuid::parse_str(segment).ok());
    let organization = found.next()?;
    let ledger = found.next()?;
    Some((organization, ledger))
}

/// An in-flight transaction parked in the cache queue, eligible for
/// replay once it ages past the liveness threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleTransactionRecord {
    #[serde(default)]
    pub header_id: Option<String>,
    pub transaction_id: Uuid,
    pub organization_id: Uuid,
    pub ledger_id: Uuid,
    #[serde(default)]
    pub balances: Vec<Balance>,
    #[serde(default)]
    pub parsed_dsl: Value,
    /// `None` marks a record that never passed validation; such records
    /// are skipped by the sweeper.
    #[serde(default)]
    pub validated_responses: Option<Value>,
    /// Alive-until instant, epoch seconds.
    pub ttl: i64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub transaction_date: String,
}

/// Status of a metadata outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Published,
    Failed,
    Dlq,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
            OutboxStatus::Dlq => "dlq",
        }
    }

    /// Terminal states are removed by retention cleanup, never retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Published | OutboxStatus::Dlq)
    }
}

/// A staged metadata write awaiting propagation to the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub metadata: Value,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Earliest epoch second at which the row may be claimed again.
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl OutboxEntry {
    /// Fresh pending row for a metadata write.
    pub fn pending(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        metadata: Value,
        max_retries: u32,
        now: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            metadata,
            status: OutboxStatus::Pending,
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org() -> Uuid {
        Uuid::parse_str("3bcdd6cf-9cfb-44a8-9b11-0060e6e4e0e9").unwrap()
    }

    fn ledger() -> Uuid {
        Uuid::parse_str("5f4872ab-bd29-4ecd-8a52-93b43f4b4a43").unwrap()
    }

    #[test]
    fn cache_key_carries_prefix_and_suffix() {
        let key = balance_cache_key(&org(), &ledger(), "@acc#1");
        assert_eq!(
            key,
            format!("balance:{{transactions}}:{}:{}:@acc#1", org(), ledger())
        );
    }

    #[test]
    fn schedule_member_parses_first_two_uuid_segments() {
        let member = balance_cache_key(&org(), &ledger(), "@acc#1");
        let (parsed_org, parsed_ledger) = parse_schedule_member(&member).unwrap();
        assert_eq!(parsed_org, org());
        assert_eq!(parsed_ledger, ledger());
    }

    #[test]
    fn schedule_member_without_two_uuids_is_rejected() {
        assert!(parse_schedule_member("balance:{transactions}:not-a-uuid:also-not").is_none());
        assert!(parse_schedule_member(&format!("balance:{{transactions}}:{}", org())).is_none());
        assert!(parse_schedule_member("").is_none());
    }

    #[test]
    fn outbox_status_terminality() {
        assert!(OutboxStatus::Published.is_terminal());
        assert!(OutboxStatus::Dlq.is_terminal());
        assert!(!OutboxStatus::Pending.is_terminal());
        assert!(!OutboxStatus::Processing.is_terminal());
        assert!(!OutboxStatus::Failed.is_terminal());
    }

    #[test]
    fn pending_outbox_entry_defaults() {
        let entry = OutboxEntry::pending("Account", "acc-1", serde_json::json!({"k": "v"}), 10, 99);
        assert_eq!(entry.status, OutboxStatus::Pending);
        assert_eq!(entry.retry_count, 0);
        assert_eq!(entry.max_retries, 10);
        assert_eq!(entry.next_retry_at, None);
        assert_eq!(entry.created_at, 99);
        assert_eq!(entry.updated_at, 99);
    }

    #[test]
    fn stale_record_with_null_validation_deserializes() {
        let raw = serde_json::json!({
            "transaction_id": "0b8a98e0-7f4b-43f3-a8c4-7ba853ab4b51",
            "organization_id": org().to_string(),
            "ledger_id": ledger().to_string(),
            "validated_responses": null,
            "ttl": 1_700_000_000,
        });
        let record: StaleTransactionRecord = serde_json::from_value(raw).unwrap();
        assert!(record.validated_responses.is_none());
        assert!(record.balances.is_empty());
    }
}

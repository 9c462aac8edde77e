//! Wire formats consumed from the broker queues.
//!
//! Balance creation arrives as JSON; balance operations arrive as msgpack.
//! Both shapes validate their invariants before any use case runs, and a
//! violation is terminal for the delivery.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One element of a message's `queue_data` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Option<Uuid>,
    #[serde(default)]
    pub value: Value,
}

/// Balance-creation request (JSON body).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceCreateMessage {
    pub organization_id: Option<Uuid>,
    pub ledger_id: Option<Uuid>,
    pub account_id: Option<Uuid>,
    #[serde(default)]
    pub queue_data: Vec<QueueItem>,
}

impl BalanceCreateMessage {
    pub fn from_json(body: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Enforce the creation invariants: all three ids present, exactly one
    /// queue entry, and that entry keyed by the account id.
    pub fn validate(&self) -> Result<(), Error> {
        self.organization_id
            .ok_or_else(|| Error::Validation("balance create: organization_id is nil".into()))?;
        self.ledger_id
            .ok_or_else(|| Error::Validation("balance create: ledger_id is nil".into()))?;
        let account = self
            .account_id
            .ok_or_else(|| Error::Validation("balance create: account_id is nil".into()))?;

        if self.queue_data.len() != 1 {
            return Err(Error::Validation(format!(
                "balance create: expected 1 queue entry, got {}",
                self.queue_data.len()
            )));
        }
        match self.queue_data[0].id {
            Some(id) if id == account => Ok(()),
            Some(id) => Err(Error::Validation(format!(
                "balance create: queue entry id {id} does not match account {account}"
            ))),
            None => Err(Error::Validation("balance create: queue entry id is nil".into())),
        }
    }
}

/// Balance-operation request (msgpack body).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceOperationMessage {
    pub organization_id: Option<Uuid>,
    pub ledger_id: Option<Uuid>,
    #[serde(default)]
    pub queue_data: Vec<QueueItem>,
}

impl BalanceOperationMessage {
    pub fn from_msgpack(body: &[u8]) -> Result<Self, Error> {
        Ok(rmp_serde::from_slice(body)?)
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, Error> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Enforce the operation invariants: both ids present and exactly one
    /// queue entry with a non-nil id.
    pub fn validate(&self) -> Result<(), Error> {
        self.organization_id
            .ok_or_else(|| Error::Validation("balance operation: organization_id is nil".into()))?;
        self.ledger_id
            .ok_or_else(|| Error::Validation("balance operation: ledger_id is nil".into()))?;

        if self.queue_data.len() != 1 {
            return Err(Error::Validation(format!(
                "balance operation: expected 1 queue entry, got {}",
                self.queue_data.len()
            )));
        }
        if self.queue_data[0].id.is_none() {
            return Err(Error::Validation("balance operation: queue entry id is nil".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn valid_create() -> BalanceCreateMessage {
        BalanceCreateMessage {
            organization_id: Some(uuid(1)),
            ledger_id: Some(uuid(2)),
            account_id: Some(uuid(3)),
            queue_data: vec![QueueItem { id: Some(uuid(3)), value: serde_json::json!({"a": 1}) }],
        }
    }

    #[test]
    fn create_round_trips_through_json() {
        let msg = valid_create();
        let decoded = BalanceCreateMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        decoded.validate().unwrap();
    }

    #[test]
    fn create_rejects_nil_ids() {
        let mut msg = valid_create();
        msg.ledger_id = None;
        assert!(matches!(msg.validate(), Err(Error::Validation(_))));

        let mut msg = valid_create();
        msg.organization_id = None;
        assert!(matches!(msg.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn create_rejects_mismatched_queue_entry() {
        let mut msg = valid_create();
        msg.queue_data[0].id = Some(uuid(99));
        assert!(matches!(msg.validate(), Err(Error::Validation(_))));

        let mut msg = valid_create();
        msg.queue_data.push(QueueItem { id: Some(uuid(3)), value: Value::Null });
        assert!(matches!(msg.validate(), Err(Error::Validation(_))));

        let mut msg = valid_create();
        msg.queue_data.clear();
        assert!(matches!(msg.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn create_decode_failure_is_a_decode_error() {
        assert!(matches!(
            BalanceCreateMessage::from_json(b"not json"),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn operation_round_trips_through_msgpack() {
        let msg = BalanceOperationMessage {
            organization_id: Some(uuid(1)),
            ledger_id: Some(uuid(2)),
            queue_data: vec![QueueItem { id: Some(uuid(7)), value: Value::Null }],
        };
        let decoded = BalanceOperationMessage::from_msgpack(&msg.to_msgpack().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        decoded.validate().unwrap();
    }

    #[test]
    fn operation_rejects_invalid_shapes() {
        let msg = BalanceOperationMessage {
            organization_id: Some(uuid(1)),
            ledger_id: None,
            queue_data: vec![QueueItem { id: Some(uuid(7)), value: Value::Null }],
        };
        assert!(matches!(msg.validate(), Err(Error::Validation(_))));

        let msg = BalanceOperationMessage {
            organization_id: Some(uuid(1)),
            ledger_id: Some(uuid(2)),
            queue_data: vec![],
        };
        assert!(matches!(msg.validate(), Err(Error::Validation(_))));

        let msg = BalanceOperationMessage {
            organization_id: Some(uuid(1)),
            ledger_id: Some(uuid(2)),
            queue_data: vec![QueueItem { id: None, value: Value::Null }],
        };
        assert!(matches!(msg.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn operation_decode_failure_is_a_decode_error() {
        assert!(matches!(
            BalanceOperationMessage::from_msgpack(&[0xc1]),
            Err(Error::Decode(_))
        ));
    }
}

//! Unified error type for the execution core.
//!
//! Every port and worker funnels failures through [`Error`]; delivery
//! handlers decide ack/nack from the coarse [`ErrorKind`] classification
//! rather than from concrete variants.

use std::time::Duration;
use thiserror::Error;

/// Message fragments that mark an error as infrastructure-caused.
///
/// Use-case errors arrive as opaque strings, so classification falls back
/// to substring matching against this fixed denylist.
const INFRASTRUCTURE_TOKENS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection closed",
    "broken pipe",
    "no route to host",
    "timeout",
    "timed out",
    "temporarily unavailable",
    "unexpected eof",
    "amqp",
    "rabbitmq",
    "redis",
    "postgres",
    "mongo",
    "database",
];

/// Unified error type for workers, ports, and the circuit breaker.
#[derive(Debug, Error)]
pub enum Error {
    /// Broker publish/consume failure.
    #[error("broker error: {0}")]
    Broker(String),

    /// Cache or sorted-set command failure.
    #[error("cache error: {0}")]
    Cache(String),

    /// Relational store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Document store failure.
    #[error("document store error: {0}")]
    Document(String),

    /// An operation exceeded its deadline.
    #[error("operation timed out after {elapsed:?} (limit: {limit:?})")]
    Timeout { elapsed: Duration, limit: Duration },

    /// The circuit breaker rejected the call without touching the broker.
    #[error("circuit breaker '{service}' is open")]
    CircuitOpen { service: String },

    /// Malformed message body.
    #[error("decode error: {0}")]
    Decode(String),

    /// A message violated a wire-format invariant.
    #[error("validation error: {0}")]
    Validation(String),

    /// Error surfaced by the command use case.
    #[error("{0}")]
    Business(String),

    /// Per-tenant store handle resolution failed.
    #[error("tenant resolution failed for '{tenant}': {reason}")]
    TenantResolution { tenant: String, reason: String },

    /// A worker task panicked; the panic was contained at the join point.
    #[error("panic recovered: {0}")]
    PanicRecovered(String),

    /// Invalid worker configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Coarse classification driving ack/nack and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Terminal at the consumer: nack without requeue, never retried.
    Validation,
    /// Retryable with bounded retries; DLQ on exhaustion.
    Infrastructure,
    /// Terminal use-case outcome; straight to the DLQ.
    Business,
    /// Retryable by redelivery: nack-requeue the same message.
    TransientResolution,
    /// Contained panic; reported and counted, never retried.
    Fatal,
}

impl ErrorKind {
    /// Stable label for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Infrastructure => "infrastructure",
            ErrorKind::Business => "business",
            ErrorKind::TransientResolution => "transient_resolution",
            ErrorKind::Fatal => "fatal",
        }
    }
}

/// True when the message text matches the infrastructure denylist.
pub fn looks_like_infrastructure(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    INFRASTRUCTURE_TOKENS.iter().any(|token| lower.contains(token))
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Decode(_) | Error::Validation(_) => ErrorKind::Validation,
            Error::Broker(_)
            | Error::Cache(_)
            | Error::Store(_)
            | Error::Document(_)
            | Error::Timeout { .. }
            | Error::CircuitOpen { .. } => ErrorKind::Infrastructure,
            Error::Business(message) => {
                if looks_like_infrastructure(message) {
                    ErrorKind::Infrastructure
                } else {
                    ErrorKind::Business
                }
            }
            Error::TenantResolution { .. } => ErrorKind::TransientResolution,
            Error::PanicRecovered(_) => ErrorKind::Fatal,
            Error::Config(_) => ErrorKind::Business,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

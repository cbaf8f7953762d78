//! The `error` module defines the error type shared by every broker operation.
//!
//! All variants are structural: they are returned synchronously to the
//! immediate caller and retrying without changing the request yields the same
//! failure. The type is `Clone + PartialEq` so per-queue failures can be kept
//! in a [`Published`](crate::broker::Published) report and compared in tests.

use thiserror::Error;

use crate::broker::DeliveryTag;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("exchange '{name}' already declared as {existing}, cannot redeclare as {requested}")]
    ExchangeConflict {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("invalid binding pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: &'static str },

    #[error("unknown delivery tag {tag} on queue '{queue}'")]
    UnknownDeliveryTag { queue: String, tag: DeliveryTag },

    #[error("queue '{0}' is exclusive and already has a consumer")]
    ResourceLocked(String),

    #[error("queue '{queue}' reached its limit of {limit} consumers")]
    ConsumerLimitReached { queue: String, limit: usize },

    #[error("failed to encode payload: {0}")]
    Encode(String),
}

impl BrokerError {
    pub(crate) fn exchange_not_found(name: &str) -> Self {
        Self::NotFound {
            kind: "exchange",
            name: name.to_string(),
        }
    }

    pub(crate) fn queue_not_found(name: &str) -> Self {
        Self::NotFound {
            kind: "queue",
            name: name.to_string(),
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Encode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

//! Event payload conventions
//!
//! The broker treats payloads as opaque bytes. Producers and consumers of
//! the order and notification flows agree on these JSON shapes.

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::Result;

pub const ORDER_CREATED: &str = "order_created";
pub const NOTIFICATION: &str = "notification";
pub const DEFAULT_NOTIFICATION_MESSAGE: &str = "A new important update!";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    pub order_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    pub amount: f64,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl OrderEvent {
    /// Build an `order_created` event. Without an id, one is derived from
    /// the current time (`ORDER_<millis>`).
    pub fn new(order_id: Option<String>, amount: f64) -> Self {
        let now = Utc::now();
        Self {
            order_id: order_id.unwrap_or_else(|| format!("ORDER_{}", now.timestamp_millis())),
            customer_id: None,
            amount,
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            kind: ORDER_CREATED.to_string(),
        }
    }

    pub fn with_customer(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }

    pub fn to_payload(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: String,
    pub message: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl NotificationEvent {
    pub fn new(message: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("NOTIFICATION_{}", now.timestamp_millis()),
            message: message.unwrap_or_else(|| DEFAULT_NOTIFICATION_MESSAGE.to_string()),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            kind: NOTIFICATION.to_string(),
        }
    }

    pub fn to_payload(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

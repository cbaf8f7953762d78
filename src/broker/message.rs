//! Message definitions for the broker
//!
//! A `Message` is created by the broker at publish time, one copy per target
//! queue. Copies of one publish share `id` and `payload` but are otherwise
//! independent: each queue owns its copy and tracks its delivery count.
//!
//! Notes on fields:
//! - `id`: identifier shared by all copies of one publish
//! - `exchange`: exchange the message was published to
//! - `routing_key`: key used for routing, kept for consumers
//! - `payload`: opaque bytes, never inspected by the broker
//! - `enqueued_at`: milliseconds since UNIX epoch, set at publish
//! - `delivery_count`: number of times the queue handed this copy out

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Bytes,
    pub enqueued_at: i64,
    pub delivery_count: u32,
}

impl Message {
    pub fn new(id: Uuid, exchange: &str, routing_key: &str, payload: Bytes) -> Self {
        Self {
            id,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
            enqueued_at: chrono::Utc::now().timestamp_millis(),
            delivery_count: 0,
        }
    }

    /// True once the message has been handed out more than once.
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }
}

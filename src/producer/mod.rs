//! The `producer` module publishes the domain events of the order and
//! notification flows.
//!
//! `Producer` asserts the exchange it is about to publish to before every
//! publish, so a producer can run against a fresh broker without any prior
//! setup.

pub mod events;

use std::sync::Arc;

use tracing::info;

use crate::broker::{Broker, ExchangeKind, Published};
use crate::utils::Result;

pub use events::{NotificationEvent, OrderEvent};

pub const ORDER_EXCHANGE: &str = "order_events";
pub const ORDER_CREATED_KEY: &str = "order.created";
pub const NOTIFICATION_EXCHANGE: &str = "notification_broadcast";

#[derive(Debug, Clone)]
pub struct Producer {
    broker: Arc<Broker>,
}

impl Producer {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    /// Publish an order on the `order_events` topic exchange.
    pub fn publish_order(&self, order: &OrderEvent) -> Result<Published> {
        self.broker
            .declare_exchange(ORDER_EXCHANGE, ExchangeKind::Topic, true)?;
        let published =
            self.broker
                .publish(ORDER_EXCHANGE, ORDER_CREATED_KEY, order.to_payload()?)?;
        info!(order = %order.order_id, queues = published.routed.len(), "order published");
        Ok(published)
    }

    /// Broadcast a notification on the `notification_broadcast` fanout
    /// exchange.
    pub fn publish_notification(&self, notification: &NotificationEvent) -> Result<Published> {
        self.broker
            .declare_exchange(NOTIFICATION_EXCHANGE, ExchangeKind::Fanout, true)?;
        let published = self
            .broker
            .publish(NOTIFICATION_EXCHANGE, "", notification.to_payload()?)?;
        info!(notification = %notification.id, queues = published.routed.len(), "notification published");
        Ok(published)
    }
}

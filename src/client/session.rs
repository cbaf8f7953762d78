//! Consumer sessions
//!
//! A `Subscription` is one consumer attached to one queue. Deliveries are
//! pushed into it by the broker and read as a `futures::Stream` (or through
//! `recv`). In manual-ack mode a session holds at most one outstanding
//! delivery: the next one is pushed only after the current one is acked or
//! nacked. In auto-ack mode deliveries are settled as they are handed out.
//!
//! Ending a session:
//! - `cancel` detaches the consumer. In-flight deliveries are not requeued
//!   and can still be acked or nacked through this subscription.
//! - `lost` detaches and settles every in-flight delivery with an explicit
//!   [`SessionLossPolicy`].
//! - dropping the subscription behaves like `lost` with the broker's
//!   configured policy.

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, warn};

use crate::broker::{Broker, DeliveryTag, message::Message};
use crate::utils::Result;

pub type ConsumerTag = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// The consumer must ack or nack every delivery.
    #[default]
    Manual,
    /// Deliveries are acknowledged as soon as they are handed out.
    Auto,
}

/// One message handed to one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub queue: String,
    pub consumer_tag: ConsumerTag,
    pub tag: DeliveryTag,
    pub message: Message,
}

/// What to do with an in-flight message whose consumer went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossDecision {
    Requeue,
    Drop,
}

/// Decides the fate of in-flight messages of a lost session, one message at
/// a time.
pub trait SessionLossPolicy: Send + Sync {
    fn on_session_lost(
        &self,
        queue: &str,
        consumer: &ConsumerTag,
        message: &Message,
    ) -> LossDecision;
}

impl SessionLossPolicy for LossDecision {
    fn on_session_lost(&self, _: &str, _: &ConsumerTag, _: &Message) -> LossDecision {
        *self
    }
}

impl<F> SessionLossPolicy for F
where
    F: Fn(&str, &ConsumerTag, &Message) -> LossDecision + Send + Sync,
{
    fn on_session_lost(
        &self,
        queue: &str,
        consumer: &ConsumerTag,
        message: &Message,
    ) -> LossDecision {
        self(queue, consumer, message)
    }
}

/// Outcome of settling a lost session's in-flight messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LossReport {
    pub requeued: usize,
    pub dropped: usize,
}

#[derive(Debug)]
pub struct Subscription {
    broker: Arc<Broker>,
    queue: String,
    consumer_tag: ConsumerTag,
    ack_mode: AckMode,
    receiver: UnboundedReceiver<Delivery>,
    released: bool,
}

impl Subscription {
    pub(crate) fn new(
        broker: Arc<Broker>,
        queue: String,
        consumer_tag: ConsumerTag,
        ack_mode: AckMode,
        receiver: UnboundedReceiver<Delivery>,
    ) -> Self {
        Self {
            broker,
            queue,
            consumer_tag,
            ack_mode,
            receiver,
            released: false,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &ConsumerTag {
        &self.consumer_tag
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    /// Wait for the next delivery. `None` once the session is detached and
    /// every pushed delivery has been read.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Next delivery if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }

    /// Acknowledge a delivery this session received.
    pub fn ack(&self, tag: DeliveryTag) -> Result<()> {
        self.broker.ack_as(&self.queue, &self.consumer_tag, tag)
    }

    /// Reject a delivery this session received.
    pub fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.broker
            .nack_as(&self.queue, &self.consumer_tag, tag, requeue)
    }

    /// Stop receiving new deliveries. Idempotent.
    ///
    /// Deliveries already handed out stay owned by this subscription; settle
    /// them before dropping it, or the broker's loss policy decides.
    pub fn cancel(&mut self) {
        self.broker.cancel(&self.queue, &self.consumer_tag);
    }

    /// Treat the session as lost and settle its in-flight deliveries with
    /// `policy`.
    pub fn lost(mut self, policy: &dyn SessionLossPolicy) -> LossReport {
        self.released = true;
        self.broker
            .session_lost(&self.queue, &self.consumer_tag, policy)
    }

    /// Drive the session with `handler` until it is detached.
    ///
    /// In manual mode an `Ok` result acks the delivery; an `Err` or a panic
    /// inside the handler nacks it with requeue, so a faulty handler never
    /// loses a message. In auto mode handler failures are only logged.
    pub async fn run<F, Fut, E>(mut self, mut handler: F)
    where
        F: FnMut(Delivery) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        while let Some(delivery) = self.recv().await {
            let tag = delivery.tag;
            let outcome = tokio::spawn(handler(delivery)).await;

            let requeue = match outcome {
                Ok(Ok(())) => false,
                Ok(Err(e)) => {
                    warn!(queue = %self.queue, consumer = %self.consumer_tag, tag, "handler failed: {e}");
                    true
                }
                Err(e) => {
                    error!(queue = %self.queue, consumer = %self.consumer_tag, tag, "handler aborted: {e}");
                    true
                }
            };

            if self.ack_mode == AckMode::Auto {
                continue;
            }
            let settled = if requeue {
                self.nack(tag, true)
            } else {
                self.ack(tag)
            };
            if let Err(e) = settled {
                warn!(queue = %self.queue, consumer = %self.consumer_tag, tag, "could not settle delivery: {e}");
            }
        }
    }
}

impl Stream for Subscription {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Delivery>> {
        self.receiver.poll_recv(cx)
    }
}

/// Dropping a subscription that was not passed to `lost` settles whatever is
/// still in flight with the broker's configured `session_loss` policy. This
/// includes a cancelled subscription: with the default `requeue` policy an
/// unsettled delivery goes back to the queue and will be handed out again.
impl Drop for Subscription {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let policy = self.broker.session_loss_policy();
        self.broker
            .session_lost(&self.queue, &self.consumer_tag, &policy);
    }
}

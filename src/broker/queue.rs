//! Queue state
//!
//! A `Queue` holds two disjoint collections: `messages`, the ready messages
//! in delivery order, and `unacked`, the messages handed to a consumer and
//! waiting for an ack or nack. A message is always in exactly one of them.
//!
//! The queue also keeps its attached consumers and pushes deliveries to them
//! in round-robin order (`dispatch`). Pushing goes through an unbounded
//! channel, so dispatching never blocks and never calls back into the broker.
//!
//! Concurrency note: the broker wraps every queue in its own mutex; nothing
//! here synchronizes on its own.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::broker::message::Message;
use crate::client::{AckMode, ConsumerTag, Delivery};
use crate::utils::{BrokerError, Result};

/// Handle for one in-flight delivery. Unique within its queue.
pub type DeliveryTag = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Long-lived work queue shared by competing consumers.
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }

    /// Private per-subscriber queue that disappears with its consumer.
    pub fn transient() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

#[derive(Debug)]
struct InFlight {
    message: Message,
    owner: Option<ConsumerTag>,
}

#[derive(Debug)]
struct Consumer {
    tag: ConsumerTag,
    ack_mode: AckMode,
    sender: UnboundedSender<Delivery>,
    outstanding: Option<DeliveryTag>,
}

impl Consumer {
    fn ready(&self) -> bool {
        if self.sender.is_closed() {
            return false;
        }
        match self.ack_mode {
            AckMode::Auto => true,
            AckMode::Manual => self.outstanding.is_none(),
        }
    }
}

#[derive(Debug)]
pub struct Queue {
    pub name: String,
    pub options: QueueOptions,
    messages: VecDeque<Message>,
    unacked: HashMap<DeliveryTag, InFlight>,
    consumers: Vec<Consumer>,
    cursor: usize,
    next_tag: DeliveryTag,
    deleted: bool,
}

impl Queue {
    pub fn new(name: &str, options: QueueOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
            messages: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: Vec::new(),
            cursor: 0,
            next_tag: 0,
            deleted: false,
        }
    }

    /// Append a message to the tail.
    ///
    /// Fails with `NotFound` once the queue has been deleted, which happens
    /// when a publisher raced a `delete_queue`.
    pub fn enqueue(&mut self, message: Message) -> Result<()> {
        if self.deleted {
            return Err(BrokerError::queue_not_found(&self.name));
        }
        self.messages.push_back(message);
        Ok(())
    }

    /// Move the head message into `unacked` under a fresh delivery tag.
    pub fn dequeue_for_delivery(
        &mut self,
        owner: Option<&ConsumerTag>,
    ) -> Option<(DeliveryTag, Message)> {
        let mut message = self.messages.pop_front()?;
        message.delivery_count += 1;
        self.next_tag += 1;
        let tag = self.next_tag;
        self.unacked.insert(
            tag,
            InFlight {
                message: message.clone(),
                owner: owner.cloned(),
            },
        );
        Some((tag, message))
    }

    /// Acknowledge a delivery regardless of which consumer holds it.
    pub fn ack(&mut self, tag: DeliveryTag) -> Result<Message> {
        self.settle(tag, None).map(|in_flight| in_flight.message)
    }

    /// Acknowledge a delivery on behalf of `owner`.
    pub fn ack_as(&mut self, tag: DeliveryTag, owner: &ConsumerTag) -> Result<Message> {
        self.settle(tag, Some(owner)).map(|in_flight| in_flight.message)
    }

    /// Reject a delivery. With `requeue` the message goes back to the head
    /// with its delivery count kept; otherwise it is discarded.
    pub fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let in_flight = self.settle(tag, None)?;
        self.reject(in_flight.message, requeue);
        Ok(())
    }

    pub fn nack_as(&mut self, tag: DeliveryTag, owner: &ConsumerTag, requeue: bool) -> Result<()> {
        let in_flight = self.settle(tag, Some(owner))?;
        self.reject(in_flight.message, requeue);
        Ok(())
    }

    fn reject(&mut self, message: Message, requeue: bool) {
        if requeue {
            self.messages.push_front(message);
        } else {
            debug!(queue = %self.name, id = %message.id, "message discarded");
        }
    }

    fn settle(&mut self, tag: DeliveryTag, owner: Option<&ConsumerTag>) -> Result<InFlight> {
        let owned = match (self.unacked.get(&tag), owner) {
            (Some(_), None) => true,
            (Some(in_flight), Some(owner)) => in_flight.owner.as_ref() == Some(owner),
            (None, _) => false,
        };
        let in_flight = if owned { self.unacked.remove(&tag) } else { None };
        let Some(in_flight) = in_flight else {
            return Err(BrokerError::UnknownDeliveryTag {
                queue: self.name.clone(),
                tag,
            });
        };

        if let Some(owner) = &in_flight.owner {
            for consumer in self.consumers.iter_mut().filter(|c| &c.tag == owner) {
                if consumer.outstanding == Some(tag) {
                    consumer.outstanding = None;
                }
            }
        }
        Ok(in_flight)
    }

    /// Drop every ready message. In-flight messages are left alone.
    pub fn purge(&mut self) -> usize {
        let purged = self.messages.len();
        self.messages.clear();
        purged
    }

    /// Register a consumer. Exclusive queues accept a single consumer and
    /// `limit` (0 = unbounded) caps the rest.
    pub fn attach(
        &mut self,
        tag: ConsumerTag,
        ack_mode: AckMode,
        sender: UnboundedSender<Delivery>,
        limit: usize,
    ) -> Result<()> {
        if self.deleted {
            return Err(BrokerError::queue_not_found(&self.name));
        }
        if self.options.exclusive && !self.consumers.is_empty() {
            return Err(BrokerError::ResourceLocked(self.name.clone()));
        }
        if limit > 0 && self.consumers.len() >= limit {
            return Err(BrokerError::ConsumerLimitReached {
                queue: self.name.clone(),
                limit,
            });
        }
        self.consumers.push(Consumer {
            tag,
            ack_mode,
            sender,
            outstanding: None,
        });
        Ok(())
    }

    /// Remove a consumer. Returns `false` when it was not attached.
    ///
    /// Its in-flight deliveries stay in `unacked`, still owned by it.
    pub fn detach(&mut self, tag: &ConsumerTag) -> bool {
        let Some(idx) = self.consumers.iter().position(|c| &c.tag == tag) else {
            return false;
        };
        self.consumers.remove(idx);
        if self.cursor > idx {
            self.cursor -= 1;
        }
        true
    }

    /// Delivery tags currently held by `owner`, oldest first.
    pub fn in_flight_of(&self, owner: &ConsumerTag) -> Vec<DeliveryTag> {
        let mut tags: Vec<DeliveryTag> = self
            .unacked
            .iter()
            .filter(|(_, in_flight)| in_flight.owner.as_ref() == Some(owner))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();
        tags
    }

    /// In-flight message behind `tag`, if any.
    pub fn in_flight(&self, tag: DeliveryTag) -> Option<&Message> {
        self.unacked.get(&tag).map(|in_flight| &in_flight.message)
    }

    /// Push ready messages to ready consumers, round-robin. Returns how many
    /// deliveries were handed over.
    pub fn dispatch(&mut self) -> usize {
        let mut delivered = 0;

        while !self.messages.is_empty() {
            let Some(idx) = self.next_ready_consumer() else {
                break;
            };
            let consumer_tag = self.consumers[idx].tag.clone();
            let Some((tag, message)) = self.dequeue_for_delivery(Some(&consumer_tag)) else {
                break;
            };

            let delivery = Delivery {
                queue: self.name.clone(),
                consumer_tag: consumer_tag.clone(),
                tag,
                message,
            };
            let consumer = &mut self.consumers[idx];
            if consumer.sender.send(delivery).is_err() {
                // receiver went away before the hand-off; the message was never seen
                warn!(queue = %self.name, consumer = %consumer_tag, "consumer channel closed");
                if let Some(in_flight) = self.unacked.remove(&tag) {
                    self.messages.push_front(in_flight.message);
                }
                continue;
            }

            match consumer.ack_mode {
                AckMode::Manual => consumer.outstanding = Some(tag),
                AckMode::Auto => {
                    self.unacked.remove(&tag);
                }
            }
            debug!(queue = %self.name, consumer = %consumer_tag, tag, "delivered");
            delivered += 1;
        }

        delivered
    }

    fn next_ready_consumer(&mut self) -> Option<usize> {
        let n = self.consumers.len();
        for step in 0..n {
            let idx = (self.cursor + step) % n;
            if self.consumers[idx].ready() {
                self.cursor = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }

    /// Mark the queue deleted and drop its consumers, which ends their
    /// delivery streams.
    pub(crate) fn close(&mut self) {
        self.deleted = true;
        self.consumers.clear();
        self.messages.clear();
        self.unacked.clear();
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn ready_len(&self) -> usize {
        self.messages.len()
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn has_consumer(&self, tag: &ConsumerTag) -> bool {
        self.consumers.iter().any(|c| &c.tag == tag)
    }

    /// Ready messages never share an id with in-flight ones, and no id
    /// appears twice.
    pub fn is_consistent(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        self.messages
            .iter()
            .map(|m| m.id)
            .chain(self.unacked.values().map(|f| f.message.id))
            .all(|id| seen.insert(id))
    }
}

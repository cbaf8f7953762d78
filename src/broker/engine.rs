//! Broker engine
//!
//! This module contains the in-memory broker responsible for:
//! - declaring exchanges and queues, and binding them together
//! - routing published messages to every matching queue
//! - attaching consumer sessions and pushing deliveries to them
//! - settling deliveries through ack/nack and session loss
//!
//! Concurrency and usage notes:
//! - The broker is shared as `Arc<Broker>`; every method takes `&self`.
//! - Each queue sits behind its own mutex, so unrelated queues never
//!   contend. Exchanges and bindings share one read-mostly lock.
//! - Lock order is topology, then queue. Publish reads the topology, lets go
//!   of it, and only then locks target queues one at a time.
//! - Deliveries go out through unbounded channels while the queue lock is
//!   held; handing a delivery over never blocks and never re-enters the
//!   broker.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::exchange::{Binding, BindingTable, Exchange, ExchangeKind};
use crate::broker::message::Message;
use crate::broker::queue::{DeliveryTag, Queue, QueueOptions};
use crate::client::{AckMode, ConsumerTag, LossDecision, LossReport, SessionLossPolicy, Subscription};
use crate::config::BrokerSettings;
use crate::utils::{BrokerError, Result};

#[derive(Debug, Default)]
struct Topology {
    exchanges: HashMap<String, Exchange>,
    bindings: BindingTable,
}

/// A queue that could not take its copy of a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueFailure {
    pub queue: String,
    pub error: BrokerError,
}

/// Report of one publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub message_id: Uuid,
    /// Queues that accepted a copy, sorted.
    pub routed: Vec<String>,
    /// Queues that were resolved as targets but failed to enqueue.
    pub failures: Vec<EnqueueFailure>,
}

impl Published {
    /// True when no queue matched the routing key.
    pub fn is_unroutable(&self) -> bool {
        self.routed.is_empty() && self.failures.is_empty()
    }
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub options: QueueOptions,
    pub ready: usize,
    pub unacked: usize,
    pub consumers: usize,
}

#[derive(Debug)]
pub struct Broker {
    topology: RwLock<Topology>,
    queues: DashMap<String, Arc<Mutex<Queue>>>,
    settings: BrokerSettings,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerSettings::default())
    }
}

impl Broker {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            topology: RwLock::new(Topology::default()),
            queues: DashMap::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Policy applied when a subscription is dropped without being released.
    pub fn session_loss_policy(&self) -> LossDecision {
        self.settings.session_loss
    }

    /// Declare an exchange, or confirm an identical existing one.
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<Exchange> {
        if name.is_empty() {
            return Err(BrokerError::PreconditionFailed(
                "exchange name must not be empty".to_string(),
            ));
        }

        let mut topology = self.topology.write();
        if let Some(existing) = topology.exchanges.get(name) {
            if existing.kind != kind {
                return Err(BrokerError::ExchangeConflict {
                    name: name.to_string(),
                    existing: existing.kind.to_string(),
                    requested: kind.to_string(),
                });
            }
            if existing.durable != durable {
                return Err(BrokerError::PreconditionFailed(format!(
                    "exchange '{name}' already declared with durable={}",
                    existing.durable
                )));
            }
            return Ok(existing.clone());
        }

        let exchange = Exchange {
            name: name.to_string(),
            kind,
            durable,
        };
        topology.exchanges.insert(name.to_string(), exchange.clone());
        info!(exchange = %name, %kind, durable, "exchange declared");
        Ok(exchange)
    }

    pub fn exchange(&self, name: &str) -> Option<Exchange> {
        self.topology.read().exchanges.get(name).cloned()
    }

    /// Declare a queue and return its name.
    ///
    /// An empty `name` asks the broker to generate a unique one. Redeclaring
    /// with identical options is a no-op; different options fail with
    /// `PreconditionFailed`.
    pub fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let name = if name.is_empty() {
            format!("{}{}", self.settings.generated_queue_prefix, Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        let entry = self
            .queues
            .entry(name.clone())
            .or_insert_with(|| {
                info!(queue = %name, ?options, "queue declared");
                Arc::new(Mutex::new(Queue::new(&name, options)))
            })
            .clone();

        let existing = entry.lock().options;
        if existing != options {
            return Err(BrokerError::PreconditionFailed(format!(
                "queue '{name}' already declared with {existing:?}"
            )));
        }
        Ok(name)
    }

    /// Create a queue that must not exist yet.
    ///
    /// Unlike `declare_queue` this never adopts an existing queue: a taken
    /// name fails with `ResourceLocked`, so the caller owns whatever it gets
    /// back and may delete it freely.
    pub fn create_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        match self.queues.entry(name.to_string()) {
            Entry::Occupied(_) => Err(BrokerError::ResourceLocked(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(Queue::new(name, options))));
                info!(queue = %name, ?options, "queue created");
                Ok(name.to_string())
            }
        }
    }

    /// Delete a queue together with its bindings. Attached sessions see the
    /// end of their delivery stream. Returns the number of ready messages
    /// that were dropped.
    pub fn delete_queue(&self, name: &str) -> Result<usize> {
        let mut topology = self.topology.write();
        let (_, queue) = self
            .queues
            .remove(name)
            .ok_or_else(|| BrokerError::queue_not_found(name))?;
        let unbound = topology.bindings.remove_queue(name);
        drop(topology);

        let mut queue = queue.lock();
        let dropped = queue.ready_len();
        queue.close();
        info!(queue = %name, unbound, dropped, "queue deleted");
        Ok(dropped)
    }

    /// Drop every ready message of a queue.
    pub fn purge_queue(&self, name: &str) -> Result<usize> {
        let queue = self.queue(name)?;
        let purged = queue.lock().purge();
        debug!(queue = %name, purged, "queue purged");
        Ok(purged)
    }

    pub fn queue_info(&self, name: &str) -> Result<QueueInfo> {
        let queue = self.queue(name)?;
        let queue = queue.lock();
        Ok(QueueInfo {
            name: queue.name.clone(),
            options: queue.options,
            ready: queue.ready_len(),
            unacked: queue.unacked_len(),
            consumers: queue.consumer_count(),
        })
    }

    /// Names of all declared queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Run `f` against the locked queue. Meant for inspection.
    pub fn with_queue<R>(&self, name: &str, f: impl FnOnce(&Queue) -> R) -> Result<R> {
        let queue = self.queue(name)?;
        let queue = queue.lock();
        Ok(f(&queue))
    }

    fn queue(&self, name: &str) -> Result<Arc<Mutex<Queue>>> {
        self.queues
            .get(name)
            .map(|q| q.value().clone())
            .ok_or_else(|| BrokerError::queue_not_found(name))
    }

    pub fn bind(&self, exchange: &str, queue: &str, pattern: &str) -> Result<()> {
        let mut topology = self.topology.write();
        let target = topology
            .exchanges
            .get(exchange)
            .cloned()
            .ok_or_else(|| BrokerError::exchange_not_found(exchange))?;
        if !self.queues.contains_key(queue) {
            return Err(BrokerError::queue_not_found(queue));
        }
        if topology.bindings.insert(&target, queue, pattern)? {
            info!(exchange = %exchange, queue = %queue, pattern = %pattern, "queue bound");
        }
        Ok(())
    }

    pub fn unbind(&self, exchange: &str, queue: &str, pattern: &str) -> Result<()> {
        let mut topology = self.topology.write();
        if !topology.exchanges.contains_key(exchange) {
            return Err(BrokerError::exchange_not_found(exchange));
        }
        if !self.queues.contains_key(queue) {
            return Err(BrokerError::queue_not_found(queue));
        }
        if !topology.bindings.remove(exchange, queue, pattern) {
            return Err(BrokerError::NotFound {
                kind: "binding",
                name: format!("{exchange} -> {queue} ({pattern})"),
            });
        }
        info!(exchange = %exchange, queue = %queue, pattern = %pattern, "queue unbound");
        Ok(())
    }

    pub fn bindings(&self, exchange: &str) -> Vec<Binding> {
        self.topology.read().bindings.bindings(exchange)
    }

    /// Queues a message published to `exchange` with `routing_key` would
    /// reach.
    pub fn resolve_targets(&self, exchange: &str, routing_key: &str) -> Result<BTreeSet<String>> {
        let topology = self.topology.read();
        let exchange = topology
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::exchange_not_found(exchange))?;
        Ok(topology.bindings.resolve(exchange, routing_key))
    }

    /// Publish a message.
    ///
    /// Every target queue gets its own copy. A queue that fails to take its
    /// copy is reported in `failures` without affecting the others. A
    /// message that matches no binding is dropped.
    pub fn publish(&self, exchange: &str, routing_key: &str, payload: impl Into<Bytes>) -> Result<Published> {
        let targets = self.resolve_targets(exchange, routing_key)?;
        let message_id = Uuid::new_v4();
        let payload = payload.into();

        let mut routed = Vec::with_capacity(targets.len());
        let mut failures = Vec::new();
        for target in targets {
            let message = Message::new(message_id, exchange, routing_key, payload.clone());
            let enqueued = self.queue(&target).and_then(|queue| {
                let mut queue = queue.lock();
                queue.enqueue(message)?;
                queue.dispatch();
                Ok(())
            });
            match enqueued {
                Ok(()) => routed.push(target),
                Err(error) => {
                    warn!(exchange = %exchange, queue = %target, "enqueue failed: {error}");
                    failures.push(EnqueueFailure { queue: target, error });
                }
            }
        }

        if routed.is_empty() && failures.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "unroutable message dropped");
        } else {
            debug!(exchange = %exchange, routing_key = %routing_key, id = %message_id, queues = routed.len(), "message published");
        }

        Ok(Published {
            message_id,
            routed,
            failures,
        })
    }

    /// Attach a consumer to `queue`. Ready messages are pushed right away.
    pub fn consume(self: &Arc<Self>, queue: &str, ack_mode: AckMode) -> Result<Subscription> {
        let target = self.queue(queue)?;
        let consumer_tag: ConsumerTag = format!("ctag-{}", Uuid::new_v4().simple());
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut target = target.lock();
            target.attach(
                consumer_tag.clone(),
                ack_mode,
                tx,
                self.settings.max_consumers_per_queue,
            )?;
            target.dispatch();
        }
        info!(queue = %queue, consumer = %consumer_tag, ?ack_mode, "consumer attached");

        Ok(Subscription::new(
            Arc::clone(self),
            queue.to_string(),
            consumer_tag,
            ack_mode,
            rx,
        ))
    }

    /// Acknowledge a delivery on `queue`, whichever session holds it.
    pub fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<()> {
        self.settle(queue, |q| q.ack(tag).map(|_| ()))
    }

    /// Reject a delivery on `queue`, whichever session holds it.
    pub fn nack(&self, queue: &str, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.settle(queue, |q| q.nack(tag, requeue))
    }

    pub(crate) fn ack_as(&self, queue: &str, consumer: &ConsumerTag, tag: DeliveryTag) -> Result<()> {
        self.settle(queue, |q| q.ack_as(tag, consumer).map(|_| ()))
    }

    pub(crate) fn nack_as(
        &self,
        queue: &str,
        consumer: &ConsumerTag,
        tag: DeliveryTag,
        requeue: bool,
    ) -> Result<()> {
        self.settle(queue, |q| q.nack_as(tag, consumer, requeue))
    }

    fn settle(&self, queue: &str, op: impl FnOnce(&mut Queue) -> Result<()>) -> Result<()> {
        let target = self.queue(queue)?;
        let mut target = target.lock();
        op(&mut target)?;
        target.dispatch();
        Ok(())
    }

    /// Detach a consumer without touching its in-flight deliveries.
    ///
    /// Idempotent. When the queue is auto-delete and this was its last
    /// consumer, the queue and its bindings are removed.
    pub fn cancel(&self, queue: &str, consumer: &ConsumerTag) {
        let Ok(target) = self.queue(queue) else {
            return;
        };
        let last_gone = {
            let mut target = target.lock();
            if !target.detach(consumer) {
                return;
            }
            target.dispatch();
            target.options.auto_delete && target.consumer_count() == 0
        };
        info!(queue = %queue, consumer = %consumer, "consumer detached");

        if last_gone {
            self.auto_delete(queue);
        }
    }

    /// Detach a consumer whose connection is gone and settle each of its
    /// in-flight deliveries as `policy` decides.
    pub fn session_lost(
        &self,
        queue: &str,
        consumer: &ConsumerTag,
        policy: &dyn SessionLossPolicy,
    ) -> LossReport {
        let mut report = LossReport::default();
        let Ok(target) = self.queue(queue) else {
            return report;
        };

        let last_gone = {
            let mut target = target.lock();
            let was_attached = target.detach(consumer);
            for tag in target.in_flight_of(consumer) {
                let decision = match target.in_flight(tag) {
                    Some(message) => policy.on_session_lost(queue, consumer, message),
                    None => continue,
                };
                let requeue = decision == LossDecision::Requeue;
                if target.nack_as(tag, consumer, requeue).is_ok() {
                    if requeue {
                        report.requeued += 1;
                    } else {
                        report.dropped += 1;
                    }
                }
            }
            target.dispatch();
            was_attached && target.options.auto_delete && target.consumer_count() == 0
        };

        if report != LossReport::default() {
            warn!(queue = %queue, consumer = %consumer, requeued = report.requeued, dropped = report.dropped, "session lost with deliveries in flight");
        } else {
            debug!(queue = %queue, consumer = %consumer, "session released");
        }
        if last_gone {
            self.auto_delete(queue);
        }
        report
    }

    fn auto_delete(&self, name: &str) {
        let mut topology = self.topology.write();
        // a consumer may have attached after the last one left
        let removed = self.queues.remove_if(name, |_, queue| {
            let queue = queue.lock();
            queue.options.auto_delete && queue.consumer_count() == 0
        });
        let Some((_, queue)) = removed else {
            return;
        };
        let unbound = topology.bindings.remove_queue(name);
        drop(topology);

        queue.lock().close();
        info!(queue = %name, unbound, "auto-delete queue removed");
    }
}

#[cfg(test)]
mod partial_failure_tests {
    use super::*;

    fn fanout_with_queues(queues: &[&str]) -> Broker {
        let broker = Broker::default();
        broker
            .declare_exchange("fan", ExchangeKind::Fanout, true)
            .unwrap();
        for q in queues {
            broker.declare_queue(q, QueueOptions::default()).unwrap();
            broker.bind("fan", q, "").unwrap();
        }
        broker
    }

    #[test]
    fn publish_reports_queue_gone_after_routing() {
        let broker = fanout_with_queues(&["a", "b"]);
        // the queue left the directory but its binding was still resolved
        broker.queues.remove("a");

        let published = broker.publish("fan", "", "x").unwrap();
        assert_eq!(published.routed, vec!["b"]);
        assert_eq!(
            published.failures,
            vec![EnqueueFailure {
                queue: "a".to_string(),
                error: BrokerError::queue_not_found("a"),
            }]
        );
        assert_eq!(broker.queue_info("b").unwrap().ready, 1);
    }

    #[test]
    fn publish_reports_queue_closed_mid_publish() {
        let broker = fanout_with_queues(&["a", "b", "c"]);
        broker.queue("b").unwrap().lock().close();

        let published = broker.publish("fan", "", "x").unwrap();
        assert_eq!(published.routed, vec!["a", "c"]);
        assert_eq!(published.failures.len(), 1);
        assert_eq!(published.failures[0].queue, "b");
        assert!(!published.is_unroutable());
    }
}

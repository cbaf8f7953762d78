//! The `bridge` module forwards broker traffic to short-lived downstream
//! connections, such as a browser push channel.
//!
//! Each connection gets its own exclusive, auto-delete queue bound to the
//! exchange it listens to. A background task forwards every delivered
//! payload to the connection's downstream channel and acks it once handed
//! over. When either side goes away the session is cancelled, which removes
//! the queue and its binding, so connections that come and go leave nothing
//! behind.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{Broker, QueueOptions};
use crate::client::{AckMode, ConsumerTag};
use crate::utils::Result;

#[derive(Debug)]
pub struct BroadcastBridge {
    broker: Arc<Broker>,
    queue: String,
    consumer_tag: ConsumerTag,
    task: JoinHandle<()>,
}

impl BroadcastBridge {
    /// Open a bridge for `connection_id`, listening on `exchange` with
    /// `pattern`. Must be called from within a tokio runtime.
    ///
    /// Fails with `ResourceLocked` while another bridge for the same
    /// connection and exchange is open.
    pub fn open(
        broker: &Arc<Broker>,
        connection_id: &str,
        exchange: &str,
        pattern: &str,
        downstream: UnboundedSender<Bytes>,
    ) -> Result<Self> {
        let queue = format!("{exchange}_bridge_{connection_id}");
        // a live bridge for the same connection keeps its queue
        broker.create_queue(&queue, QueueOptions::transient())?;

        let subscription = broker
            .bind(exchange, &queue, pattern)
            .and_then(|_| broker.consume(&queue, AckMode::Manual));
        let mut subscription = match subscription {
            Ok(subscription) => subscription,
            Err(e) => {
                // nothing is attached yet, so auto-delete will not fire
                let _ = broker.delete_queue(&queue);
                return Err(e);
            }
        };
        let consumer_tag = subscription.consumer_tag().clone();
        info!(connection = %connection_id, queue = %queue, "bridge opened");

        let connection = connection_id.to_string();
        let task = tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    delivery = subscription.recv() => delivery,
                    _ = downstream.closed() => {
                        debug!(connection = %connection, "downstream closed");
                        subscription.cancel();
                        break;
                    }
                };
                let Some(delivery) = delivery else {
                    break;
                };

                if downstream.send(delivery.message.payload.clone()).is_err() {
                    if let Err(e) = subscription.nack(delivery.tag, true) {
                        warn!(connection = %connection, "failed to requeue undelivered payload: {e}");
                    }
                    subscription.cancel();
                    break;
                }
                if let Err(e) = subscription.ack(delivery.tag) {
                    warn!(connection = %connection, "failed to ack forwarded delivery: {e}");
                }
            }
            info!(connection = %connection, "bridge closed");
        });

        Ok(Self {
            broker: Arc::clone(broker),
            queue,
            consumer_tag,
            task,
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stop forwarding and wait for the forwarding task to finish. The
    /// bridge queue and its binding are gone once this returns.
    pub async fn close(self) {
        self.broker.cancel(&self.queue, &self.consumer_tag);
        if let Err(e) = self.task.await {
            warn!(queue = %self.queue, "bridge task ended abnormally: {e}");
        }
    }
}

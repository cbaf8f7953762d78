use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::timeout;

use super::session::{AckMode, Delivery, LossDecision};
use crate::broker::{Broker, ExchangeKind, QueueOptions};
use crate::config::BrokerSettings;

fn broker_with_queue(queue: &str) -> Arc<Broker> {
    let broker = Arc::new(Broker::default());
    broker
        .declare_exchange("fan", ExchangeKind::Fanout, true)
        .unwrap();
    broker.declare_queue(queue, QueueOptions::durable()).unwrap();
    broker.bind("fan", queue, "").unwrap();
    broker
}

#[test]
fn test_subscription_new() {
    let broker = broker_with_queue("q");
    let sub = broker.consume("q", AckMode::Manual).unwrap();
    assert_eq!(sub.queue(), "q");
    assert!(sub.consumer_tag().starts_with("ctag-"));
    assert_eq!(sub.ack_mode(), AckMode::Manual);
    assert_eq!(broker.queue_info("q").unwrap().consumers, 1);
}

#[test]
fn test_loss_decision_is_a_policy() {
    use super::session::SessionLossPolicy;
    use crate::broker::Message;

    let message = Message::new(uuid::Uuid::new_v4(), "fan", "", "x".into());
    let tag = "ctag-1".to_string();
    assert_eq!(
        LossDecision::Drop.on_session_lost("q", &tag, &message),
        LossDecision::Drop
    );
    assert_eq!(
        LossDecision::Requeue.on_session_lost("q", &tag, &message),
        LossDecision::Requeue
    );
}

#[tokio::test]
async fn test_subscription_is_a_stream() {
    let broker = broker_with_queue("q");
    let mut sub = broker.consume("q", AckMode::Auto).unwrap();
    broker.publish("fan", "", "one").unwrap();
    broker.publish("fan", "", "two").unwrap();

    let first = sub.next().await.unwrap();
    let second = sub.next().await.unwrap();
    assert_eq!(first.message.payload, "one");
    assert_eq!(second.message.payload, "two");
    assert_eq!(first.queue, "q");
    assert_eq!(&first.consumer_tag, sub.consumer_tag());
}

#[tokio::test]
async fn test_cancel_ends_the_stream() {
    let broker = broker_with_queue("q");
    let mut sub = broker.consume("q", AckMode::Manual).unwrap();
    sub.cancel();
    let next = timeout(Duration::from_secs(1), sub.recv()).await.unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn test_run_acks_successful_deliveries() {
    let broker = broker_with_queue("q");
    let sub = broker.consume("q", AckMode::Manual).unwrap();
    let handled = Arc::new(AtomicUsize::new(0));

    let counter = handled.clone();
    let worker = tokio::spawn(sub.run(move |_delivery: Delivery| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), String>(())
        }
    }));

    for n in 0..3 {
        broker.publish("fan", "", format!("m{n}")).unwrap();
    }
    wait_until(|| handled.load(Ordering::SeqCst) == 3).await;
    wait_until(|| broker.queue_info("q").unwrap().unacked == 0).await;
    assert_eq!(broker.queue_info("q").unwrap().ready, 0);

    broker.delete_queue("q").unwrap();
    timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_run_requeues_on_error_and_panic() {
    let broker = broker_with_queue("q");
    let sub = broker.consume("q", AckMode::Manual).unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let worker = tokio::spawn(sub.run(move |delivery: Delivery| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            match attempt {
                0 => Err(format!("transient failure on {}", delivery.message.id)),
                1 => panic!("handler blew up"),
                _ => {
                    assert_eq!(delivery.message.delivery_count, 3);
                    Ok(())
                }
            }
        }
    }));

    broker.publish("fan", "", "fragile").unwrap();
    wait_until(|| attempts.load(Ordering::SeqCst) == 3).await;
    wait_until(|| {
        let info = broker.queue_info("q").unwrap();
        info.ready == 0 && info.unacked == 0
    })
    .await;

    broker.delete_queue("q").unwrap();
    timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_lost_session_policy_requeues_to_other_consumer() {
    let broker = broker_with_queue("q");
    broker.publish("fan", "", "job").unwrap();

    let mut flaky = broker.consume("q", AckMode::Manual).unwrap();
    let delivery = flaky.recv().await.unwrap();
    let mut steady = broker.consume("q", AckMode::Manual).unwrap();

    let report = flaky.lost(&LossDecision::Requeue);
    assert_eq!(report.requeued, 1);

    let redelivered = timeout(Duration::from_secs(1), steady.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(redelivered.message.id, delivery.message.id);
    assert!(redelivered.message.redelivered());
    steady.ack(redelivered.tag).unwrap();
}

#[test]
fn test_cancelled_then_dropped_follows_the_loss_policy() {
    let broker = broker_with_queue("q");
    broker.publish("fan", "", "email").unwrap();

    let mut sub = broker.consume("q", AckMode::Manual).unwrap();
    let delivery = sub.try_recv().unwrap();
    sub.cancel();
    let info = broker.queue_info("q").unwrap();
    assert_eq!((info.ready, info.unacked, info.consumers), (0, 1, 0));

    drop(sub);
    let info = broker.queue_info("q").unwrap();
    assert_eq!((info.ready, info.unacked), (1, 0));
    let again = broker.consume("q", AckMode::Manual).unwrap().try_recv().unwrap();
    assert_eq!(again.message.id, delivery.message.id);
}

#[test]
fn test_cancelled_then_dropped_with_drop_policy_discards() {
    let broker = Arc::new(Broker::new(BrokerSettings {
        session_loss: LossDecision::Drop,
        ..BrokerSettings::default()
    }));
    broker
        .declare_exchange("fan", ExchangeKind::Fanout, true)
        .unwrap();
    broker.declare_queue("q", QueueOptions::durable()).unwrap();
    broker.bind("fan", "q", "").unwrap();
    broker.publish("fan", "", "email").unwrap();

    let mut sub = broker.consume("q", AckMode::Manual).unwrap();
    sub.try_recv().unwrap();
    sub.cancel();
    drop(sub);

    let info = broker.queue_info("q").unwrap();
    assert_eq!((info.ready, info.unacked), (0, 0));
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

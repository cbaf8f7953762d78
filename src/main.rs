//! CLI for PopRoute
//!
//! Subcommands:
//! - `demo`: run the order and notification flows in-process
//! - `topology`: print the exchanges declared at startup

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use poproute::bridge::BroadcastBridge;
use poproute::broker::{Broker, QueueOptions};
use poproute::client::{AckMode, Delivery};
use poproute::config::{Settings, load_config};
use poproute::producer::{
    NOTIFICATION_EXCHANGE, NotificationEvent, ORDER_EXCHANGE, OrderEvent, Producer,
};
use tokio::sync::mpsc;
use tracing::{error, info};

const ORDER_QUEUE: &str = "order_processing_queue";

#[derive(Parser)]
#[command(name = "poproute")]
enum Command {
    /// Publish orders and notifications and consume them in-process
    Demo {
        /// Number of orders to publish
        #[arg(long, default_value_t = 3)]
        orders: usize,
        /// Number of notifications to broadcast
        #[arg(long, default_value_t = 2)]
        notifications: usize,
    },
    /// Print the configured exchanges
    Topology,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    poproute::utils::logging::init(&config.logging.level);

    match Command::parse() {
        Command::Demo {
            orders,
            notifications,
        } => {
            tokio::select! {
                result = run_demo(config, orders, notifications) => {
                    if let Err(e) = result {
                        error!("Demo failed: {}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received. Exiting gracefully.");
                }
            }
        }
        Command::Topology => {
            for exchange in &config.exchanges {
                println!(
                    "{} ({}, durable={})",
                    exchange.name, exchange.kind, exchange.durable
                );
            }
        }
    }
}

fn declare_topology(broker: &Broker, settings: &Settings) -> poproute::utils::Result<()> {
    for exchange in &settings.exchanges {
        broker.declare_exchange(&exchange.name, exchange.kind, exchange.durable)?;
    }
    Ok(())
}

async fn run_demo(
    settings: Settings,
    orders: usize,
    notifications: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let broker = Arc::new(Broker::new(settings.broker.clone()));
    declare_topology(&broker, &settings)?;
    let producer = Producer::new(broker.clone());
    broker.declare_queue(ORDER_QUEUE, QueueOptions::durable())?;
    broker.bind(ORDER_EXCHANGE, ORDER_QUEUE, "order.#")?;

    let order_consumer = broker.consume(ORDER_QUEUE, AckMode::Manual)?;
    let mut workers = vec![tokio::spawn(order_consumer.run(|delivery: Delivery| async move {
        let order = OrderEvent::from_payload(&delivery.message.payload)?;
        info!(order = %order.order_id, amount = order.amount, "processing order");
        tokio::time::sleep(Duration::from_millis(200)).await;
        info!(order = %order.order_id, "order processing completed");
        Ok::<(), poproute::utils::BrokerError>(())
    }))];

    for channel in ["email", "sms"] {
        let queue = broker.declare_queue(
            "",
            QueueOptions {
                exclusive: true,
                ..QueueOptions::default()
            },
        )?;
        broker.bind(NOTIFICATION_EXCHANGE, &queue, "")?;
        let consumer = broker.consume(&queue, AckMode::Manual)?;
        workers.push(tokio::spawn(consumer.run(move |delivery: Delivery| async move {
            let notification = NotificationEvent::from_payload(&delivery.message.payload)?;
            info!(notification = %notification.id, channel, "sending notification");
            Ok::<(), poproute::utils::BrokerError>(())
        })));
    }

    let (downstream, mut forwarded) = mpsc::unbounded_channel();
    let bridge = BroadcastBridge::open(&broker, "demo", NOTIFICATION_EXCHANGE, "", downstream)?;
    let printer = tokio::spawn(async move {
        while let Some(payload) = forwarded.recv().await {
            info!("bridge forwarded {}", String::from_utf8_lossy(&payload));
        }
    });

    for n in 0..orders {
        let order = OrderEvent::new(Some(format!("ORDER_{}", n + 1)), 10.0 * (n + 1) as f64)
            .with_customer(format!("CUSTOMER_{}", n + 1));
        producer.publish_order(&order)?;
    }
    for n in 0..notifications {
        producer.publish_notification(&NotificationEvent::new(Some(format!(
            "update #{}",
            n + 1
        ))))?;
    }

    // let the consumers drain their queues
    tokio::time::sleep(Duration::from_millis(300 * (orders as u64 + 1))).await;

    bridge.close().await;
    let _ = printer.await;
    for queue in broker.queue_names() {
        let info = broker.queue_info(&queue)?;
        info!(queue = %info.name, ready = info.ready, unacked = info.unacked, consumers = info.consumers, "queue state");
        broker.delete_queue(&queue)?;
    }
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}

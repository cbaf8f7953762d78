//! The broker: exchanges, queues, bindings and the engine that ties them
//! together.
//!
//! Public types:
//! - `Broker`: declare/bind/publish/consume/ack/nack entry point
//! - `Queue`, `Exchange`, `BindingTable`: the state the broker owns
//! - `TopicPattern` and `matches`: routing-key pattern matching

pub mod engine;
pub mod exchange;
pub mod message;
pub mod queue;
pub mod topic;

pub use engine::{Broker, EnqueueFailure, Published, QueueInfo};
pub use exchange::{Binding, BindingTable, Exchange, ExchangeKind};
pub use message::Message;
pub use queue::{DeliveryTag, Queue, QueueOptions};
pub use topic::{TopicPattern, matches};

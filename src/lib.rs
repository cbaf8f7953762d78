//! # PopRoute
//!
//! `poproute` is an embeddable, in-memory message routing and delivery core.
//! Producers publish messages to named exchanges with a routing key; the
//! broker copies each message into every queue whose binding matches, and
//! consumer sessions receive those copies with at-least-once, ack-driven
//! delivery.
//!
//! ## Core Modules
//!
//! - `broker`: exchanges, queues, bindings, topic matching and the engine that routes and delivers.
//! - `client`: consumer sessions, deliveries and the session-loss policy hook.
//! - `bridge`: per-connection queues forwarding broadcast traffic to a downstream channel.
//! - `producer`: the order and notification event conventions and their publisher.
//! - `config`: loading and merging configuration.
//! - `utils`: the error type and logging setup.

pub mod bridge;
pub mod broker;
pub mod client;
pub mod config;
pub mod producer;
pub mod utils;

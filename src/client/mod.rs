//! The `client` module defines the consumer side of the broker.
//!
//! It provides the `Subscription`, the session of one consumer attached to a
//! queue, along with the `Delivery` it receives and the policy hook used
//! when a session disappears with deliveries still in flight.

pub mod session;

pub use session::{
    AckMode, ConsumerTag, Delivery, LossDecision, LossReport, SessionLossPolicy, Subscription,
};

#[cfg(test)]
mod tests;

//! The `utils` module provides the pieces shared across the `poproute` crate:
//! the broker error type and logging initialisation.

pub mod error;
pub mod logging;

pub use error::{BrokerError, Result};

use serde::Deserialize;

use crate::broker::ExchangeKind;
use crate::client::LossDecision;

/// Top-level configuration settings for the application.
///
/// Includes settings for the broker, logging, and the exchanges declared at
/// startup.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub logging: LoggingSettings,
    pub exchanges: Vec<ExchangeSettings>,
}

/// Configuration settings for the broker.
///
/// `max_consumers_per_queue` of 0 means unbounded. `session_loss` is the
/// policy applied to in-flight messages when a subscription is dropped.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub max_consumers_per_queue: usize,
    pub generated_queue_prefix: String,
    pub session_loss: LossDecision,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// An exchange declared when the broker starts.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ExchangeSettings {
    pub name: String,
    pub kind: ExchangeKind,
    #[serde(default = "default_durable")]
    pub durable: bool,
}

fn default_durable() -> bool {
    true
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from
/// defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub logging: Option<PartialLoggingSettings>,
    pub exchanges: Option<Vec<ExchangeSettings>>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub max_consumers_per_queue: Option<usize>,
    pub generated_queue_prefix: Option<String>,
    pub session_loss: Option<LossDecision>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_consumers_per_queue: 0,
            generated_queue_prefix: "gen.".to_string(),
            session_loss: LossDecision::Requeue,
        }
    }
}

/// Provides default values for `Settings`.
///
/// The default topology is the order and notification exchanges the
/// producer publishes to.
impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
            },
            exchanges: vec![
                ExchangeSettings {
                    name: "order_events".to_string(),
                    kind: ExchangeKind::Topic,
                    durable: true,
                },
                ExchangeSettings {
                    name: "notification_broadcast".to_string(),
                    kind: ExchangeKind::Fanout,
                    durable: true,
                },
            ],
        }
    }
}

mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{BrokerSettings, ExchangeSettings, LoggingSettings, Settings};

/// Prefix of environment variables read by [`load_config`], e.g.
/// `POPROUTE__BROKER__MAX_CONSUMERS_PER_QUEUE=4`.
pub const ENV_PREFIX: &str = "POPROUTE";

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct containing the broker, logging and topology configuration
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    let default = Settings::default();

    Ok(Settings {
        broker: BrokerSettings {
            max_consumers_per_queue: partial
                .broker
                .as_ref()
                .and_then(|b| b.max_consumers_per_queue)
                .unwrap_or(default.broker.max_consumers_per_queue),
            generated_queue_prefix: partial
                .broker
                .as_ref()
                .and_then(|b| b.generated_queue_prefix.clone())
                .unwrap_or(default.broker.generated_queue_prefix),
            session_loss: partial
                .broker
                .as_ref()
                .and_then(|b| b.session_loss)
                .unwrap_or(default.broker.session_loss),
        },
        logging: LoggingSettings {
            level: partial
                .logging
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or(default.logging.level),
        },
        exchanges: partial.exchanges.unwrap_or(default.exchanges),
    })
}

#[cfg(test)]
mod tests;

//! Settings loading.
//!
//! Sources, lowest precedence first: built-in defaults, `config/default.*`
//! (optional), then `POPMQ__SECTION__KEY` environment variables.

mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{BrokerSettings, LogSettings, Settings};

/// Loads the configuration from the default file and environment variables,
/// merged over `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("POPMQ")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    let partial: PartialSettings = config.try_deserialize()?;
    let default = Settings::default();

    Ok(Settings {
        broker: BrokerSettings {
            default_prefetch: partial
                .broker
                .as_ref()
                .and_then(|b| b.default_prefetch)
                .unwrap_or(default.broker.default_prefetch),
            anonymous_queue_prefix: partial
                .broker
                .as_ref()
                .and_then(|b| b.anonymous_queue_prefix.clone())
                .unwrap_or(default.broker.anonymous_queue_prefix),
        },
        log: LogSettings {
            level: partial
                .log
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or(default.log.level),
        },
    })
}

#[cfg(test)]
mod tests;

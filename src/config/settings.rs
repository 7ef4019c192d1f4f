use serde::Deserialize;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub log: LogSettings,
}

/// Configuration settings for the broker.
///
/// `default_prefetch` applies to channels that never set their own QoS;
/// 0 means unlimited.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub default_prefetch: u16,
    pub anonymous_queue_prefix: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from the defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub default_prefetch: Option<u16>,
    pub anonymous_queue_prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            default_prefetch: 0,
            anonymous_queue_prefix: "amq.gen-".to_string(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

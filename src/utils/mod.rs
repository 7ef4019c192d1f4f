//! Shared utilities: the broker error type and logging setup.

pub mod error;
pub mod logging;

pub use error::{BrokerError, Result};

#[cfg(test)]
mod tests {
    use super::error::BrokerError;
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        logging::init("info");
        logging::init("debug");
        logging::init("warning");
        logging::init("nonsense");
    }

    #[test]
    fn only_unknown_exchange_is_channel_fatal() {
        assert!(BrokerError::UnknownExchange("logs".into()).is_channel_fatal());
        assert!(!BrokerError::UnknownQueue("q".into()).is_channel_fatal());
        assert!(!BrokerError::UnknownDelivery(7).is_channel_fatal());
        assert!(!BrokerError::ChannelClosed.is_channel_fatal());
    }
}

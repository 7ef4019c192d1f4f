//! The `error` module defines the error taxonomy of the broker.
//!
//! Configuration mistakes (`*Conflict`, `Unknown*` on declare/bind) are
//! returned to the caller as-is and never retried. `UnknownExchange` raised by
//! a publish is fatal to the publishing channel, see [`BrokerError::is_channel_fatal`].

use thiserror::Error;

use crate::broker::consumer::ConsumerId;
use crate::broker::exchange::ExchangeKind;
use crate::broker::message::DeliveryId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("no exchange '{0}'")]
    UnknownExchange(String),

    #[error("no queue '{0}'")]
    UnknownQueue(String),

    #[error("queue '{name}' already declared with durable={existing}")]
    QueueConflict { name: String, existing: bool },

    #[error("exchange '{name}' already declared as {existing}, not {requested}")]
    ExchangeConflict {
        name: String,
        existing: ExchangeKind,
        requested: ExchangeKind,
    },

    /// Internal: raised by the queue store when popping from an empty buffer.
    #[error("queue '{0}' has no ready messages")]
    EmptyQueue(String),

    #[error("unknown delivery id {0}")]
    UnknownDelivery(DeliveryId),

    #[error("unknown consumer {0}")]
    UnknownConsumer(ConsumerId),

    #[error("access refused: {0}")]
    AccessRefused(String),

    #[error("channel is closed")]
    ChannelClosed,
}

impl BrokerError {
    /// Whether the session that received this error must be torn down
    /// instead of reused.
    pub fn is_channel_fatal(&self) -> bool {
        matches!(self, BrokerError::UnknownExchange(_))
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

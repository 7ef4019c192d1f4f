//! The broker core: exchange routing, queue storage, delivery tracking and
//! fair dispatch, composed by [`Broker`].

pub mod consumer;
pub mod dispatch;
pub mod engine;
pub mod exchange;
pub mod message;
pub mod queue;
pub mod tracker;

pub use consumer::{Consumer, ConsumerId, SubscribeOptions};
pub use engine::{Broker, Published, QueueInfo};
pub use exchange::{DEFAULT_EXCHANGE, ExchangeKind};
pub use message::{Delivery, DeliveryId, Message};
pub use queue::{Declared, OwnerId};

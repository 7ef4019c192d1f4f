//! Message definitions for the broker
//!
//! `Message` is what sits in a queue's ready buffer. Each bound queue gets its
//! own copy at publish time, so the copies evolve independently (delivery
//! counts differ per queue once requeues happen).
//!
//! `Delivery` is what a consumer receives: one hand-off of one message,
//! identified by a broker-wide delivery id.

use serde::{Deserialize, Serialize};

/// Strictly increasing per broker instance, never reused.
pub type DeliveryId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub exchange: String,
    pub routing_key: Option<String>,
    pub payload: Vec<u8>,
    /// Persist-on-enqueue hint. Carried through, never acted on in memory.
    pub durable: bool,
    /// Number of times this message went back to a ready buffer.
    pub delivery_count: u32,
    /// Milliseconds since UNIX epoch, set at publish.
    pub timestamp: i64,
}

impl Message {
    pub fn new(exchange: &str, routing_key: &str, payload: impl Into<Vec<u8>>, durable: bool) -> Self {
        Self {
            exchange: exchange.to_string(),
            routing_key: (!routing_key.is_empty()).then(|| routing_key.to_string()),
            payload: payload.into(),
            durable,
            delivery_count: 0,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn redelivered(&self) -> bool {
        self.delivery_count > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub delivery_id: DeliveryId,
    pub queue: String,
    pub exchange: String,
    pub routing_key: Option<String>,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    pub delivery_count: u32,
}

impl Delivery {
    pub(crate) fn new(delivery_id: DeliveryId, queue: &str, message: &Message) -> Self {
        Self {
            delivery_id,
            queue: queue.to_string(),
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            payload: message.payload.clone(),
            redelivered: message.redelivered(),
            delivery_count: message.delivery_count,
        }
    }

    /// Payload as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

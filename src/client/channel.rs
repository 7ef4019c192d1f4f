//! Channel
//!
//! A `Channel` is one session against a [`Broker`]. It owns the non-durable
//! queues it declares and the consumers it starts; closing it (explicitly or
//! by dropping it) cancels those consumers and deletes those queues.
//!
//! Publishing to an undeclared exchange closes the channel: every later call
//! fails with `ChannelClosed` and the caller must open a new one.

use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{
    Broker, Consumer, ConsumerId, Declared, Delivery, ExchangeKind, Published, SubscribeOptions,
};
use crate::utils::{BrokerError, Result};

#[derive(Debug)]
pub struct Channel {
    id: String,
    broker: Broker,
    prefetch: u16,
    consumers: Vec<ConsumerId>,
    closed: bool,
}

impl Channel {
    /// Open a channel. Its prefetch starts at the broker's configured default.
    pub fn open(broker: &Broker) -> Self {
        let id = format!("channel-{}", Uuid::new_v4());
        info!(channel = %id, "channel opened");
        Self {
            id,
            broker: broker.clone(),
            prefetch: broker.settings().default_prefetch,
            consumers: Vec::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn prefetch(&self) -> u16 {
        self.prefetch
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(BrokerError::ChannelClosed);
        }
        Ok(())
    }

    pub fn exchange_declare(&self, name: &str, kind: ExchangeKind) -> Result<Declared> {
        self.ensure_open()?;
        self.broker.declare_exchange(name, kind)
    }

    /// Declare a named queue. A non-durable queue is owned by this channel
    /// when this channel creates it.
    pub fn queue_declare(&self, name: &str, durable: bool) -> Result<Declared> {
        self.ensure_open()?;
        self.broker.declare_queue_owned(name, durable, Some(self.id.as_str()))
    }

    /// Declare a server-named, non-durable queue owned by this channel.
    pub fn queue_declare_anonymous(&self) -> Result<String> {
        self.ensure_open()?;
        self.broker.declare_anonymous_queue(&self.id)
    }

    pub fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker.bind(queue, exchange, routing_key)
    }

    pub fn queue_unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker.unbind(queue, exchange, routing_key)
    }

    /// Set the prefetch limit for consumers started after this call.
    pub fn basic_qos(&mut self, prefetch: u16) -> Result<()> {
        self.ensure_open()?;
        self.prefetch = prefetch;
        Ok(())
    }

    pub fn basic_publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: impl Into<Vec<u8>>,
        durable: bool,
    ) -> Result<Published> {
        self.ensure_open()?;
        match self.broker.publish(exchange, routing_key, payload, durable) {
            Err(e) if e.is_channel_fatal() => {
                warn!(channel = %self.id, error = %e, "channel-fatal publish error, closing channel");
                self.close();
                Err(e)
            }
            other => other,
        }
    }

    pub fn basic_consume(&mut self, queue: &str, auto_ack: bool) -> Result<Consumer> {
        self.ensure_open()?;
        let options = SubscribeOptions {
            prefetch: self.prefetch,
            auto_ack,
        };
        let consumer = self.broker.subscribe_with(queue, options)?;
        self.consumers.push(consumer.id());
        Ok(consumer)
    }

    pub fn basic_ack(&self, delivery: &Delivery) -> Result<()> {
        self.ensure_open()?;
        self.broker.ack(delivery.delivery_id)
    }

    pub fn basic_nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        self.broker.nack(delivery.delivery_id, requeue)
    }

    /// Cancel this channel's consumers and delete the queues it owns.
    /// Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut requeued = 0;
        for consumer in self.consumers.drain(..) {
            // handles dropped earlier have already been removed
            if let Ok(n) = self.broker.unsubscribe(consumer) {
                requeued += n;
            }
        }
        let deleted = self.broker.purge_ephemeral(&self.id);
        info!(channel = %self.id, requeued, deleted = deleted.len(), "channel closed");
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

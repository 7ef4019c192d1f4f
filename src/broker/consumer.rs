//! Consumer handle
//!
//! `Consumer` is the receiving end of one subscription. Deliveries arrive on a
//! per-consumer channel; waiting on it never holds a broker lock. Dropping the
//! handle counts as losing the consumer: everything it still holds unacked is
//! requeued.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::debug;

use crate::broker::engine::Broker;
use crate::broker::message::Delivery;
use crate::utils::Result;

pub type ConsumerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Max unacked deliveries, 0 for unlimited.
    pub prefetch: u16,
    /// Resolve deliveries at hand-off instead of waiting for an ack.
    pub auto_ack: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            prefetch: 0,
            auto_ack: false,
        }
    }
}

impl SubscribeOptions {
    pub fn prefetch(prefetch: u16) -> Self {
        Self {
            prefetch,
            auto_ack: false,
        }
    }

    pub fn auto_ack() -> Self {
        Self {
            prefetch: 0,
            auto_ack: true,
        }
    }
}

#[derive(Debug)]
pub struct Consumer {
    id: ConsumerId,
    queue: String,
    receiver: UnboundedReceiver<Delivery>,
    cancelled: Arc<AtomicBool>,
    broker: Broker,
}

impl Consumer {
    pub(crate) fn new(
        id: ConsumerId,
        queue: &str,
        receiver: UnboundedReceiver<Delivery>,
        cancelled: Arc<AtomicBool>,
        broker: Broker,
    ) -> Self {
        Self {
            id,
            queue: queue.to_string(),
            receiver,
            cancelled,
            broker,
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Wait for the next delivery. Returns `None` once the subscription is
    /// gone (unsubscribed, queue deleted, or owning channel closed).
    pub async fn recv(&mut self) -> Option<Delivery> {
        if self.is_cancelled() {
            return None;
        }
        let delivery = self.receiver.recv().await?;
        // deliveries buffered before a cancel were already requeued
        if self.is_cancelled() {
            return None;
        }
        Some(delivery)
    }

    /// Non-blocking variant of [`Consumer::recv`].
    pub fn try_recv(&mut self) -> Option<Delivery> {
        if self.is_cancelled() {
            return None;
        }
        match self.receiver.try_recv() {
            Ok(delivery) if !self.is_cancelled() => Some(delivery),
            Ok(_) | Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.broker.ack(delivery.delivery_id)
    }

    pub fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.broker.nack(delivery.delivery_id, requeue)
    }

    /// Unsubscribe explicitly, returning how many deliveries were requeued.
    ///
    /// The slot is removed under the queue lock before the receiver closes,
    /// so a concurrent dispatch never finds this consumer half gone.
    pub fn cancel(mut self) -> Result<usize> {
        let requeued = self.broker.unsubscribe(self.id);
        self.cancelled.store(true, Ordering::SeqCst);
        self.receiver.close();
        requeued
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if self.is_cancelled() {
            return;
        }
        if let Err(e) = self.broker.consumer_lost(self.id) {
            debug!(consumer = self.id, error = %e, "consumer already removed on drop");
        }
        self.receiver.close();
    }
}

//! Delivery tracking
//!
//! Every hand-off from a queue to an acknowledging consumer gets a delivery
//! id and an in-flight record. The record lives in the queue's own
//! `InFlightTable` (so resolving it only needs that queue's lock), while the
//! tracker keeps a broker-wide id -> queue index used to find the right queue
//! when a bare id comes back in an ack or nack.
//!
//! Lock order: a queue lock may be held while taking the index lock, never
//! the other way round.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::broker::consumer::ConsumerId;
use crate::broker::engine::{QueueHandle, QueueState, lock};
use crate::broker::message::{DeliveryId, Message};
use crate::utils::{BrokerError, Result};

#[derive(Debug, Clone)]
pub struct InFlight {
    pub message: Message,
    pub consumer: ConsumerId,
    /// Milliseconds since UNIX epoch.
    pub delivered_at: i64,
}

/// In-flight deliveries of a single queue, ordered by delivery id.
#[derive(Debug, Default)]
pub struct InFlightTable {
    entries: BTreeMap<DeliveryId, InFlight>,
}

impl InFlightTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, id: DeliveryId, entry: InFlight) {
        self.entries.insert(id, entry);
    }

    fn remove(&mut self, id: DeliveryId) -> Option<InFlight> {
        self.entries.remove(&id)
    }

    /// Remove all entries owned by `consumer`, oldest first.
    fn drain_consumer(&mut self, consumer: ConsumerId) -> Vec<(DeliveryId, InFlight)> {
        let ids: Vec<DeliveryId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.consumer == consumer)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|e| (id, e)))
            .collect()
    }

    fn drain_all(&mut self) -> Vec<DeliveryId> {
        std::mem::take(&mut self.entries).into_keys().collect()
    }
}

#[derive(Debug)]
pub struct DeliveryTracker {
    next_id: AtomicU64,
    index: Mutex<HashMap<DeliveryId, Arc<QueueHandle>>>,
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            index: Mutex::new(HashMap::new()),
        }
    }

    /// Next delivery id. Ids only ever grow, including for auto-ack
    /// hand-offs that are never recorded.
    pub fn allocate(&self) -> DeliveryId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Record `message` as in flight to `consumer` and charge the consumer's
    /// prefetch counter. Caller holds the queue lock behind `state`.
    pub(crate) fn begin_delivery(
        &self,
        handle: &Arc<QueueHandle>,
        state: &mut QueueState,
        consumer: ConsumerId,
        message: Message,
    ) -> DeliveryId {
        let id = self.allocate();
        state.in_flight.insert(
            id,
            InFlight {
                message,
                consumer,
                delivered_at: chrono::Utc::now().timestamp_millis(),
            },
        );
        if let Some(slot) = state.consumers.get_mut(consumer) {
            slot.in_flight += 1;
        }
        lock(&self.index).insert(id, Arc::clone(handle));
        id
    }

    /// Queue currently holding delivery `id`.
    pub(crate) fn lookup(&self, id: DeliveryId) -> Result<Arc<QueueHandle>> {
        lock(&self.index)
            .get(&id)
            .cloned()
            .ok_or(BrokerError::UnknownDelivery(id))
    }

    /// Remove the in-flight record for `id` and free the consumer's prefetch
    /// slot. Fails if `id` is not in flight on this queue.
    fn resolve(&self, state: &mut QueueState, id: DeliveryId) -> Result<InFlight> {
        let entry = state
            .in_flight
            .remove(id)
            .ok_or(BrokerError::UnknownDelivery(id))?;
        if let Some(slot) = state.consumers.get_mut(entry.consumer) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
        lock(&self.index).remove(&id);
        Ok(entry)
    }

    /// Undo a delivery whose hand-off failed and return its message. The
    /// caller puts it back without counting a redelivery.
    pub(crate) fn retract(&self, state: &mut QueueState, id: DeliveryId) -> Option<Message> {
        self.resolve(state, id).ok().map(|entry| entry.message)
    }

    /// Acknowledge: the message is gone for good.
    pub(crate) fn ack(&self, state: &mut QueueState, id: DeliveryId) -> Result<()> {
        self.resolve(state, id)?;
        debug!(delivery_id = id, queue = %state.queue.name, "ack");
        Ok(())
    }

    /// Negative acknowledge, optionally putting the message back at the head
    /// of its queue.
    pub(crate) fn nack(&self, state: &mut QueueState, id: DeliveryId, requeue: bool) -> Result<()> {
        let entry = self.resolve(state, id)?;
        debug!(delivery_id = id, queue = %state.queue.name, requeue, "nack");
        if requeue {
            state.queue.requeue_front(entry.message);
        }
        Ok(())
    }

    /// Requeue every delivery `consumer` holds on this queue in one sweep.
    /// Relative order is preserved: the oldest delivery ends up first.
    pub(crate) fn on_consumer_lost(&self, state: &mut QueueState, consumer: ConsumerId) -> usize {
        let drained = state.in_flight.drain_consumer(consumer);
        let count = drained.len();
        {
            let mut index = lock(&self.index);
            for (id, _) in &drained {
                index.remove(id);
            }
        }
        for (_, entry) in drained.into_iter().rev() {
            state.queue.requeue_front(entry.message);
        }
        if let Some(slot) = state.consumers.get_mut(consumer) {
            slot.in_flight = 0;
        }
        count
    }

    /// Drop every in-flight record of a queue that is going away. Their ids
    /// become unknown.
    pub(crate) fn forget_queue(&self, state: &mut QueueState) -> usize {
        let ids = state.in_flight.drain_all();
        let mut index = lock(&self.index);
        for id in &ids {
            index.remove(id);
        }
        ids.len()
    }

    /// Number of deliveries currently in flight across the broker.
    pub fn in_flight(&self) -> usize {
        lock(&self.index).len()
    }
}

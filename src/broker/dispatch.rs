//! Fair dispatch
//!
//! Each queue keeps the consumers subscribed to it in a `ConsumerSet`. A ready
//! message goes to the next *eligible* consumer in round-robin order, where
//! eligibility depends only on the consumer's prefetch counter:
//!
//! `Idle (0 in flight) -> Busy (1..limit-1) -> Saturated (== limit) -> Idle`
//!
//! Saturated consumers are skipped until an ack or nack frees a slot. A
//! prefetch of 0 means unlimited, and auto-ack consumers never saturate.
//!
//! `dispatch` runs with the queue lock held and never blocks: hand-off is a
//! send on an unbounded channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::broker::consumer::ConsumerId;
use crate::broker::engine::{QueueHandle, QueueState};
use crate::broker::message::Delivery;
use crate::broker::tracker::DeliveryTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Busy,
    Saturated,
}

#[derive(Debug)]
pub struct ConsumerSlot {
    pub id: ConsumerId,
    pub prefetch: u16,
    pub auto_ack: bool,
    pub in_flight: usize,
    sender: UnboundedSender<Delivery>,
    cancelled: Arc<AtomicBool>,
}

impl ConsumerSlot {
    pub(crate) fn new(
        id: ConsumerId,
        prefetch: u16,
        auto_ack: bool,
        sender: UnboundedSender<Delivery>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            prefetch,
            auto_ack,
            in_flight: 0,
            sender,
            cancelled,
        }
    }

    pub fn state(&self) -> SlotState {
        if self.in_flight == 0 {
            SlotState::Idle
        } else if !self.auto_ack && self.prefetch != 0 && self.in_flight >= self.prefetch as usize {
            SlotState::Saturated
        } else {
            SlotState::Busy
        }
    }

    pub fn is_eligible(&self) -> bool {
        self.state() != SlotState::Saturated
    }

    /// Mark the handle side cancelled; dropping the slot closes the channel.
    fn close(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Consumers of one queue plus the round-robin cursor.
#[derive(Debug, Default)]
pub struct ConsumerSet {
    slots: Vec<ConsumerSlot>,
    cursor: usize,
}

impl ConsumerSet {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn add(&mut self, slot: ConsumerSlot) {
        self.slots.push(slot);
    }

    pub fn get(&self, id: ConsumerId) -> Option<&ConsumerSlot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: ConsumerId) -> Option<&mut ConsumerSlot> {
        self.slots.iter_mut().find(|s| s.id == id)
    }

    pub fn remove(&mut self, id: ConsumerId) -> Option<ConsumerSlot> {
        let idx = self.slots.iter().position(|s| s.id == id)?;
        let slot = self.slots.remove(idx);
        slot.close();
        if idx < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.slots.len() {
            self.cursor = 0;
        }
        Some(slot)
    }

    /// Close and drop every consumer.
    pub fn clear(&mut self) -> usize {
        let n = self.slots.len();
        for slot in self.slots.drain(..) {
            slot.close();
        }
        self.cursor = 0;
        n
    }

    /// Index of the next eligible consumer, advancing the cursor past it.
    pub fn next_eligible(&mut self) -> Option<usize> {
        let n = self.slots.len();
        for step in 0..n {
            let idx = (self.cursor + step) % n;
            if self.slots[idx].is_eligible() {
                self.cursor = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }
}

/// Hand ready messages to eligible consumers until either runs out.
/// Returns the number of hand-offs made.
pub(crate) fn dispatch(
    tracker: &DeliveryTracker,
    handle: &Arc<QueueHandle>,
    state: &mut QueueState,
) -> usize {
    let mut handed = 0;

    while state.queue.peek_ready().is_some() {
        let Some(idx) = state.consumers.next_eligible() else {
            break;
        };
        let Ok(message) = state.queue.remove_ready() else {
            break;
        };
        let consumer = state.consumers.slots[idx].id;

        let sent = if state.consumers.slots[idx].auto_ack {
            let delivery = Delivery::new(tracker.allocate(), &handle.name, &message);
            match state.consumers.slots[idx].sender.send(delivery) {
                Ok(()) => true,
                Err(_) => {
                    state.queue.return_front(message);
                    false
                }
            }
        } else {
            let id = tracker.begin_delivery(handle, state, consumer, message.clone());
            let delivery = Delivery::new(id, &handle.name, &message);
            match state.consumers.slots[idx].sender.send(delivery) {
                Ok(()) => true,
                Err(_) => {
                    // never seen by anyone, so not a redelivery
                    if let Some(message) = tracker.retract(state, id) {
                        state.queue.return_front(message);
                    }
                    false
                }
            }
        };

        if sent {
            handed += 1;
            debug!(queue = %handle.name, consumer, "dispatched");
        } else {
            // receiver is gone: same as losing the consumer
            let requeued = tracker.on_consumer_lost(state, consumer);
            state.consumers.remove(consumer);
            info!(queue = %handle.name, consumer, requeued, "consumer channel closed, dropped consumer");
        }
    }

    handed
}

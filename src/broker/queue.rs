//! Queue store
//!
//! A `Queue` is the ready buffer of one named queue plus its declare-time
//! attributes. FIFO order is kept per queue; redelivered work goes back to the
//! front so it is handed out before anything published after it.
//!
//! Callers must hold the queue's lock (see `engine::QueueHandle`) for every
//! operation here.

use std::collections::VecDeque;

use crate::broker::message::Message;
use crate::utils::{BrokerError, Result};

/// Identifies the session that owns non-durable queues.
pub type OwnerId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Declared {
    Created,
    AlreadyExists,
}

#[derive(Debug)]
pub struct Queue {
    pub name: String,
    pub durable: bool,
    pub owner: Option<OwnerId>,
    ready: VecDeque<Message>,
}

impl Queue {
    pub fn new(name: &str, durable: bool, owner: Option<OwnerId>) -> Self {
        Self {
            name: name.to_string(),
            durable,
            owner,
            ready: VecDeque::new(),
        }
    }

    /// Check a re-declaration against the existing attributes.
    pub fn redeclare(&self, durable: bool) -> Result<Declared> {
        if self.durable != durable {
            return Err(BrokerError::QueueConflict {
                name: self.name.clone(),
                existing: self.durable,
            });
        }
        Ok(Declared::AlreadyExists)
    }

    /// Append a freshly published message to the tail of the ready buffer.
    pub fn enqueue(&mut self, message: Message) {
        self.ready.push_back(message);
    }

    /// The message the next dispatch would hand out, without removing it.
    /// `None` when nothing is ready.
    pub fn peek_ready(&self) -> Option<&Message> {
        self.ready.front()
    }

    pub fn remove_ready(&mut self) -> Result<Message> {
        self.ready
            .pop_front()
            .ok_or_else(|| BrokerError::EmptyQueue(self.name.clone()))
    }

    /// Put a message back at the head of the buffer, counting the redelivery.
    pub fn requeue_front(&mut self, mut message: Message) {
        message.delivery_count += 1;
        self.ready.push_front(message);
    }

    /// Put back a message whose hand-off failed before any consumer saw it.
    /// Its delivery count is left alone.
    pub fn return_front(&mut self, message: Message) {
        self.ready.push_front(message);
    }

    /// Drop every ready message, returning how many were dropped.
    pub fn purge(&mut self) -> usize {
        let n = self.ready.len();
        self.ready.clear();
        n
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        !self.durable && self.owner.as_deref() == Some(owner)
    }
}

//! Broker engine
//!
//! `Broker` is the owned context every operation goes through. It composes:
//! - the exchange table (routing)
//! - the queue table, one `QueueHandle` per queue (ready buffer, in-flight
//!   records and consumers, all behind that queue's own lock)
//! - the delivery tracker (id allocation and the id -> queue index)
//! - the consumer index (consumer id -> queue)
//!
//! Concurrency notes:
//! - Every mutation of a queue happens under its lock together with the
//!   dispatch pass it triggers, so "enqueue then dispatch" and "ack then
//!   dispatch" are atomic with respect to each other. Different queues only
//!   share the delivery index, which is held for single map operations.
//! - Lock order is exchanges -> queue table -> queue -> delivery index. The
//!   consumer index is only taken with no other lock held, or after a queue
//!   lock has been released.
//! - Nothing here awaits. Consumers wait on their own channel outside any lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::consumer::{Consumer, ConsumerId, SubscribeOptions};
use crate::broker::dispatch::{ConsumerSet, ConsumerSlot, dispatch};
use crate::broker::exchange::{DEFAULT_EXCHANGE, Exchange, ExchangeKind};
use crate::broker::message::{DeliveryId, Message};
use crate::broker::queue::{Declared, Queue};
use crate::broker::tracker::{DeliveryTracker, InFlightTable};
use crate::config::BrokerSettings;
use crate::utils::{BrokerError, Result};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

/// Everything that belongs to one queue, guarded together.
#[derive(Debug)]
pub struct QueueState {
    pub queue: Queue,
    pub in_flight: InFlightTable,
    pub consumers: ConsumerSet,
    pub deleted: bool,
}

#[derive(Debug)]
pub struct QueueHandle {
    pub name: String,
    state: Mutex<QueueState>,
}

impl QueueHandle {
    pub(crate) fn new(queue: Queue) -> Self {
        Self {
            name: queue.name.clone(),
            state: Mutex::new(QueueState {
                queue,
                in_flight: InFlightTable::default(),
                consumers: ConsumerSet::default(),
                deleted: false,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueState> {
        lock(&self.state)
    }
}

/// Outcome of an accepted publish. Zero routed copies is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Published {
    pub routed: usize,
}

impl Published {
    pub fn is_routed(&self) -> bool {
        self.routed > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    pub name: String,
    pub durable: bool,
    pub ready: usize,
    pub unacked: usize,
    pub consumers: usize,
}

#[derive(Debug)]
struct BrokerInner {
    exchanges: RwLock<HashMap<String, Exchange>>,
    queues: RwLock<HashMap<String, Arc<QueueHandle>>>,
    consumers: Mutex<HashMap<ConsumerId, Arc<QueueHandle>>>,
    tracker: DeliveryTracker,
    next_consumer_id: AtomicU64,
    settings: BrokerSettings,
}

/// Cheap to clone; all clones share the same broker state.
#[derive(Debug, Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self::with_settings(BrokerSettings::default())
    }

    pub fn with_settings(settings: BrokerSettings) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                exchanges: RwLock::new(HashMap::new()),
                queues: RwLock::new(HashMap::new()),
                consumers: Mutex::new(HashMap::new()),
                tracker: DeliveryTracker::new(),
                next_consumer_id: AtomicU64::new(1),
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.inner.settings
    }

    fn queue_handle(&self, name: &str) -> Result<Arc<QueueHandle>> {
        read(&self.inner.queues)
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownQueue(name.to_string()))
    }

    // ---- exchanges ----

    /// Declare an exchange. Re-declaring with the same kind is a no-op.
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<Declared> {
        if name == DEFAULT_EXCHANGE {
            return Err(BrokerError::AccessRefused(
                "the default exchange cannot be declared".to_string(),
            ));
        }
        let mut exchanges = write(&self.inner.exchanges);
        if let Some(existing) = exchanges.get(name) {
            if existing.kind != kind {
                return Err(BrokerError::ExchangeConflict {
                    name: name.to_string(),
                    existing: existing.kind,
                    requested: kind,
                });
            }
            return Ok(Declared::AlreadyExists);
        }
        exchanges.insert(name.to_string(), Exchange::new(name, kind));
        info!(exchange = name, %kind, "exchange declared");
        Ok(Declared::Created)
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        if name == DEFAULT_EXCHANGE {
            return Some(ExchangeKind::Direct);
        }
        read(&self.inner.exchanges).get(name).map(|e| e.kind)
    }

    /// Bind `queue` to `exchange`. For fanout exchanges the key is ignored
    /// when routing but still identifies the binding.
    pub fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        if exchange == DEFAULT_EXCHANGE {
            return Err(BrokerError::AccessRefused(
                "queues cannot be bound to the default exchange".to_string(),
            ));
        }
        let mut exchanges = write(&self.inner.exchanges);
        let ex = exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
        if !read(&self.inner.queues).contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        if ex.bind(queue, routing_key) {
            info!(queue, exchange, routing_key, "queue bound");
        }
        Ok(())
    }

    /// Remove a binding. Removing one that does not exist is a no-op.
    pub fn unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        if exchange == DEFAULT_EXCHANGE {
            return Err(BrokerError::AccessRefused(
                "queues cannot be unbound from the default exchange".to_string(),
            ));
        }
        let mut exchanges = write(&self.inner.exchanges);
        let ex = exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
        if !read(&self.inner.queues).contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        if ex.unbind(queue, routing_key) {
            info!(queue, exchange, routing_key, "queue unbound");
        }
        Ok(())
    }

    /// Names of the queues a publish to (`exchange`, `routing_key`) reaches.
    pub fn route(&self, exchange: &str, routing_key: &str) -> Result<BTreeSet<String>> {
        if exchange == DEFAULT_EXCHANGE {
            let mut targets = BTreeSet::new();
            if read(&self.inner.queues).contains_key(routing_key) {
                targets.insert(routing_key.to_string());
            }
            return Ok(targets);
        }
        read(&self.inner.exchanges)
            .get(exchange)
            .map(|ex| ex.route(routing_key))
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))
    }

    // ---- queues ----

    /// Declare a queue with no owning session.
    ///
    /// Idempotent: re-declaring with the same durability leaves the queue and
    /// its contents untouched. A different durability is a `QueueConflict`.
    pub fn declare_queue(&self, name: &str, durable: bool) -> Result<Declared> {
        self.declare_queue_owned(name, durable, None)
    }

    /// Declare a queue on behalf of `owner`. Only non-durable queues keep the
    /// owner, and only the first declarer owns it.
    pub fn declare_queue_owned(&self, name: &str, durable: bool, owner: Option<&str>) -> Result<Declared> {
        let mut queues = write(&self.inner.queues);
        if let Some(handle) = queues.get(name) {
            return handle.lock().queue.redeclare(durable);
        }
        let owner = owner.filter(|_| !durable).map(str::to_string);
        queues.insert(
            name.to_string(),
            Arc::new(QueueHandle::new(Queue::new(name, durable, owner))),
        );
        info!(queue = name, durable, "queue declared");
        Ok(Declared::Created)
    }

    /// Declare a non-durable queue with a generated unique name.
    pub fn declare_anonymous_queue(&self, owner: &str) -> Result<String> {
        let name = format!("{}{}", self.inner.settings.anonymous_queue_prefix, Uuid::new_v4());
        self.declare_queue_owned(&name, false, Some(owner))?;
        Ok(name)
    }

    pub fn queue_info(&self, name: &str) -> Result<QueueInfo> {
        let handle = self.queue_handle(name)?;
        let state = handle.lock();
        Ok(QueueInfo {
            name: handle.name.clone(),
            durable: state.queue.durable,
            ready: state.queue.ready_len(),
            unacked: state.in_flight.len(),
            consumers: state.consumers.len(),
        })
    }

    /// Copy of the message at the head of the ready buffer, if any.
    pub fn peek_ready(&self, name: &str) -> Result<Option<Message>> {
        let handle = self.queue_handle(name)?;
        let state = handle.lock();
        Ok(state.queue.peek_ready().cloned())
    }

    /// Drop all ready messages of a queue. In-flight deliveries are kept.
    pub fn purge_queue(&self, name: &str) -> Result<usize> {
        let handle = self.queue_handle(name)?;
        let purged = handle.lock().queue.purge();
        info!(queue = name, purged, "queue purged");
        Ok(purged)
    }

    /// Remove a queue with its bindings, ready messages, in-flight records
    /// and consumers.
    pub fn delete_queue(&self, name: &str) -> Result<()> {
        let handle = write(&self.inner.queues)
            .remove(name)
            .ok_or_else(|| BrokerError::UnknownQueue(name.to_string()))?;

        for exchange in write(&self.inner.exchanges).values_mut() {
            exchange.unbind_queue(name);
        }

        let mut state = handle.lock();
        state.deleted = true;
        let dropped = state.queue.purge();
        let forgotten = self.inner.tracker.forget_queue(&mut state);
        let consumers = state.consumers.clear();
        info!(queue = name, dropped, forgotten, consumers, "queue deleted");
        Ok(())
    }

    /// Delete every non-durable queue owned by `owner`. Called when the
    /// owning session goes away.
    pub fn purge_ephemeral(&self, owner: &str) -> Vec<String> {
        let owned: Vec<String> = read(&self.inner.queues)
            .values()
            .filter(|h| h.lock().queue.is_owned_by(owner))
            .map(|h| h.name.clone())
            .collect();

        owned
            .into_iter()
            .filter(|name| self.delete_queue(name).is_ok())
            .collect()
    }

    // ---- publish ----

    /// Route a message and enqueue one copy per target queue, dispatching on
    /// each queue right away.
    ///
    /// A routing miss is accepted silently. An unknown exchange is an error
    /// the publishing session must treat as fatal.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: impl Into<Vec<u8>>,
        durable: bool,
    ) -> Result<Published> {
        let targets = match self.route(exchange, routing_key) {
            Ok(targets) => targets,
            Err(e) => {
                warn!(exchange, routing_key, error = %e, "publish to unknown exchange");
                return Err(e);
            }
        };

        if targets.is_empty() {
            debug!(exchange, routing_key, "unroutable message dropped");
            return Ok(Published { routed: 0 });
        }

        let handles: Vec<Arc<QueueHandle>> = {
            let queues = read(&self.inner.queues);
            targets.iter().filter_map(|q| queues.get(q).cloned()).collect()
        };

        let message = Message::new(exchange, routing_key, payload, durable);
        let mut routed = 0;
        for handle in handles {
            let mut state = handle.lock();
            if state.deleted {
                continue;
            }
            state.queue.enqueue(message.clone());
            dispatch(&self.inner.tracker, &handle, &mut state);
            routed += 1;
        }

        debug!(exchange, routing_key, routed, "published");
        Ok(Published { routed })
    }

    // ---- consumers ----

    /// Subscribe with a prefetch limit and explicit acknowledgements.
    pub fn subscribe(&self, queue: &str, prefetch: u16) -> Result<Consumer> {
        self.subscribe_with(queue, SubscribeOptions::prefetch(prefetch))
    }

    /// Register a consumer on `queue` and hand it whatever is already ready,
    /// up to its prefetch limit.
    ///
    /// With `auto_ack` deliveries are resolved at hand-off and never tracked.
    pub fn subscribe_with(&self, queue: &str, options: SubscribeOptions) -> Result<Consumer> {
        let handle = self.queue_handle(queue)?;
        let id = self.inner.next_consumer_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));

        {
            let mut state = handle.lock();
            if state.deleted {
                return Err(BrokerError::UnknownQueue(queue.to_string()));
            }
            state.consumers.add(ConsumerSlot::new(
                id,
                options.prefetch,
                options.auto_ack,
                tx,
                Arc::clone(&cancelled),
            ));
            dispatch(&self.inner.tracker, &handle, &mut state);
        }

        lock(&self.inner.consumers).insert(id, Arc::clone(&handle));
        info!(queue, consumer = id, prefetch = options.prefetch, auto_ack = options.auto_ack, "consumer subscribed");
        Ok(Consumer::new(id, queue, rx, cancelled, self.clone()))
    }

    /// Cancel a subscription. Its unacked deliveries go back to the front of
    /// the queue first, so nothing is orphaned. Returns how many were requeued.
    pub fn unsubscribe(&self, consumer: ConsumerId) -> Result<usize> {
        let requeued = self.remove_consumer(consumer)?;
        info!(consumer, requeued, "consumer unsubscribed");
        Ok(requeued)
    }

    /// Same as [`Broker::unsubscribe`], for a consumer that disappeared
    /// without cancelling.
    pub fn consumer_lost(&self, consumer: ConsumerId) -> Result<usize> {
        let requeued = self.remove_consumer(consumer)?;
        warn!(consumer, requeued, "consumer lost, unacked deliveries requeued");
        Ok(requeued)
    }

    fn remove_consumer(&self, consumer: ConsumerId) -> Result<usize> {
        let handle = lock(&self.inner.consumers)
            .remove(&consumer)
            .ok_or(BrokerError::UnknownConsumer(consumer))?;

        let mut state = handle.lock();
        if state.consumers.get(consumer).is_none() {
            // dropped earlier by dispatch or queue deletion
            return Err(BrokerError::UnknownConsumer(consumer));
        }
        let requeued = self.inner.tracker.on_consumer_lost(&mut state, consumer);
        state.consumers.remove(consumer);
        dispatch(&self.inner.tracker, &handle, &mut state);
        Ok(requeued)
    }

    // ---- acknowledgements ----

    /// Acknowledge a delivery. The message is removed for good and the
    /// consumer's prefetch slot is freed, which may dispatch more work.
    ///
    /// Unknown or already resolved ids fail with `UnknownDelivery`.
    pub fn ack(&self, delivery: DeliveryId) -> Result<()> {
        let handle = self.inner.tracker.lookup(delivery)?;
        let mut state = handle.lock();
        self.inner.tracker.ack(&mut state, delivery)?;
        dispatch(&self.inner.tracker, &handle, &mut state);
        Ok(())
    }

    /// Reject a delivery. With `requeue` the message goes back to the head of
    /// its queue with its delivery count bumped; otherwise it is discarded.
    pub fn nack(&self, delivery: DeliveryId, requeue: bool) -> Result<()> {
        let handle = self.inner.tracker.lookup(delivery)?;
        let mut state = handle.lock();
        self.inner.tracker.nack(&mut state, delivery, requeue)?;
        dispatch(&self.inner.tracker, &handle, &mut state);
        Ok(())
    }

    /// Deliveries in flight across all queues.
    pub fn unacked(&self) -> usize {
        self.inner.tracker.in_flight()
    }
}

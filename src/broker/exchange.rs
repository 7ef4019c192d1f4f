//! Exchange routing
//!
//! An `Exchange` holds a set of bindings and maps a routing key to the set of
//! queues a published message must be copied into:
//! - `fanout` ignores the routing key and targets every bound queue
//! - `direct` targets queues whose binding key equals the routing key exactly
//!
//! The nameless default exchange is not stored here; the engine resolves it
//! against the queue table directly (every queue is bound to it by name).

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Name of the implicit default exchange.
pub const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => f.write_str("direct"),
            ExchangeKind::Fanout => f.write_str("fanout"),
        }
    }
}

impl FromStr for ExchangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            other => Err(format!("unsupported exchange type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub queue: String,
    pub routing_key: String,
}

#[derive(Debug)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub bindings: HashSet<Binding>,
}

impl Exchange {
    pub fn new(name: &str, kind: ExchangeKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            bindings: HashSet::new(),
        }
    }

    /// Add a binding. Binding the same (queue, key) twice is a no-op.
    pub fn bind(&mut self, queue: &str, routing_key: &str) -> bool {
        self.bindings.insert(Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        })
    }

    pub fn unbind(&mut self, queue: &str, routing_key: &str) -> bool {
        self.bindings.remove(&Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        })
    }

    /// Drop every binding that targets `queue`.
    pub fn unbind_queue(&mut self, queue: &str) {
        self.bindings.retain(|b| b.queue != queue);
    }

    /// Queues a message published with `routing_key` must be copied into.
    /// A queue bound several times still appears once.
    pub fn route(&self, routing_key: &str) -> BTreeSet<String> {
        self.bindings
            .iter()
            .filter(|b| match self.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => b.routing_key == routing_key,
            })
            .map(|b| b.queue.clone())
            .collect()
    }
}

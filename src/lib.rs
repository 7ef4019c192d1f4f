//! # PopMQ
//!
//! `popmq` is the in-memory core of a small message broker: exchanges route
//! published messages into queues, and each queue hands its messages out to
//! competing consumers with at-least-once delivery and prefetch-based fair
//! dispatch.
//!
//! ## Core Modules
//!
//! - `broker`: exchanges, queues, delivery tracking and dispatch, composed by `Broker`.
//! - `client`: `Channel`, a session that owns ephemeral queues and consumers.
//! - `config`: loading settings from files and environment.
//! - `utils`: the error type and logging setup.
//!
//! ## Example
//!
//! ```rust
//! use popmq::broker::Broker;
//!
//! let broker = Broker::default();
//! broker.declare_queue("task_queue", true).unwrap();
//! let mut worker = broker.subscribe("task_queue", 1).unwrap();
//!
//! broker.publish("", "task_queue", "Hello World!", true).unwrap();
//!
//! let delivery = worker.try_recv().unwrap();
//! assert_eq!(delivery.text(), "Hello World!");
//! worker.ack(&delivery).unwrap();
//! ```

pub mod broker;
pub mod client;
pub mod config;
pub mod utils;

pub use broker::Broker;
pub use client::Channel;
pub use utils::{BrokerError, Result};

//! The `client` module provides [`Channel`], the session type user code and
//! transports drive the broker through.

pub mod channel;
pub use channel::Channel;

#[cfg(test)]
mod tests;

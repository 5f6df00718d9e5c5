//! # Broker Module
//!
//! Wires the queue registry to the network layer.
//!
//! - `handler`: maps request frames onto [`QueueRegistry`](crate::core::QueueRegistry) calls.
//! - `server`: binds the listener and runs the broker until shutdown.
//! - `client`: a TCP [`QueueEndpoint`](crate::core::QueueEndpoint) for talking to a
//!   running broker.

pub mod client;
pub mod handler;
pub mod server;

pub use self::client::BrokerClient;
pub use self::handler::BrokerHandler;
pub use self::server::{serve, start_broker};

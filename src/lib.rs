//! LeaseMQ – a small named-queue broker with client-side visibility timeouts.
//!
//! This crate exports
//!  * `core`    – lock-free queue, queue registry, delivery coordinator
//!  * `net`     – length-prefixed framing and the TCP request server
//!  * `broker`  – broker handler, server entry point and TCP client
//!  * `config`  – TOML + environment runtime configuration
//!  * `logging` – tracing subscriber setup
//!
//! Applications can embed the broker (`start_broker`) or connect to a running
//! one with [`BrokerClient`] and wrap it in a [`DeliveryCoordinator`].

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod broker;
pub mod config;
pub mod core;
pub mod logging;
pub mod net;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use broker::{start_broker, BrokerClient};
pub use config::{load_config, Config};
pub use crate::core::{BrokerError, DeliveryCoordinator, QueueEndpoint, QueueRegistry};

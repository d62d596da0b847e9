//! RelayMQ – a durable message broker core written in Rust.
//!
//! This crate exports
//!  * `core`        – addresses, messages, queues, post office, flow control
//!  * `journal`     – sequential files and the append-only journal
//!  * `persistence` – storage manager on top of the journal, recovery
//!  * `wire`        – packet codec used by the TCP adapter
//!  * `management`  – management operations
//!  * `broker`      – server context and TCP engine
//!  * `config`      – TOML-driven runtime configuration
//!
//! Downstream applications can embed the broker (`Broker::start`) or
//! build their own binaries on top of the library.

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod broker;
pub mod config;
pub mod core;
pub mod journal;
pub mod logging;
pub mod management;
pub mod persistence;
pub mod wire;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use broker::engine::serve as start_broker;
pub use broker::Broker;
pub use config::{load_config, Config};
pub use core::error::{BrokerError, Result};

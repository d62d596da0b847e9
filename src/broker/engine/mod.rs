//! TCP engine for the broker.
//!
//! Exposes [`serve`], which starts a broker from the configuration and
//! accepts length-prefixed packet frames, one session per connection.

pub mod server;

pub use server::{handle_connection, serve, serve_with};

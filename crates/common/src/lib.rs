//! Common websocket plumbing for the price gateway.

pub mod connection;
pub mod error;

pub use connection::{connect, is_benign_close, ConnectConfig, WsSink, WsSource, WsStream};
pub use error::{Error, Result};

//! Error types for the price stream.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(#[from] common::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Upstream error: {0}")]
    Upstream(#[from] external_services::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Stream closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;

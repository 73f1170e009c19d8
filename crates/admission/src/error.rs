//! Error types for admission control.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Store error: {0}")]
    Store(#[from] external_services::Error),

    #[error("Invalid client key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, Error>;

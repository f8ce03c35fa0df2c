//! Error types for minilock

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Identity Errors ===
    #[error("Node identity <{0}> is already online")]
    IdentityConflict(String),

    #[error("Lock node {0} is shut down")]
    ShutDown(String),

    // === Store Errors ===
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store unavailable: {0}")]
    Store(String),

    // === Config Errors ===
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Store(_) => true,
            Error::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
            }
            _ => false,
        }
    }

    /// Is this fatal for the node (it must not keep running)?
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::IdentityConflict(_))
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

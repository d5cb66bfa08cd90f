use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Errors that can occur while running the relay
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Environment '{name}' failed to start: {reason}")]
    EnvironmentStartup { name: String, reason: String },

    #[error("Feature store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a feature store backing
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Store command failed: {0}")]
    Command(String),

    #[error("Stored item could not be decoded: {0}")]
    Corrupt(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

//! Consumer errors

use thiserror::Error;

/// Result type for the ingestion pipeline
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Failure talking to the message bus
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("bus client error: {0}")]
    Client(String),

    #[error("subscription failed: {0}")]
    Subscribe(String),

    #[error("bus consumer is closed")]
    Closed,
}

impl BusError {
    pub fn client(msg: impl Into<String>) -> Self {
        Self::Client(msg.into())
    }
}

/// Failure turning a record payload into statement values
#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected payload shape: {0}")]
    Payload(String),
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Config(#[from] bmpsink_common::ConfigError),

    #[error("consumer instance {instance} stopped: {reason}")]
    InstanceFailed { instance: usize, reason: String },
}

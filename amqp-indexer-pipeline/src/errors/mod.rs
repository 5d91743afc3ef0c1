//! Error types for the AMQP indexer pipeline.

use amqp_indexer_repository::SinkError;
use thiserror::Error;

/// Errors that can occur in the AMQP indexer pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Failed to open a connection or channel to the broker.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// A broker operation failed on an open channel.
    #[error("Broker error: {0}")]
    BrokerError(String),

    /// The delivery stream failed or ended.
    #[error("Consumer error: {0}")]
    ConsumerError(String),

    /// Error from the bulk sink.
    #[error("Sink error: {0}")]
    SinkError(#[from] SinkError),

    /// Invalid pipeline configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl PipelineError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::ConnectionError(msg.into())
    }

    /// Create a broker error.
    pub fn broker(msg: impl Into<String>) -> Self {
        Self::BrokerError(msg.into())
    }

    /// Create a consumer error.
    pub fn consumer(msg: impl Into<String>) -> Self {
        Self::ConsumerError(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }
}

impl From<lapin::Error> for PipelineError {
    fn from(err: lapin::Error) -> Self {
        Self::BrokerError(err.to_string())
    }
}

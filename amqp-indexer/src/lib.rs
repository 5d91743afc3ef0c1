//! # AMQP Indexer
//!
//! Main library for the AMQP to OpenSearch bulk indexer.
//!
//! This crate provides the entry point, settings and logging setup for
//! running the consumer loop against a broker and a bulk sink.

pub mod config;
pub mod logging;

pub use config::{Dependencies, Settings};

use thiserror::Error;

/// Errors that can occur during indexer initialization or execution.
#[derive(Error, Debug)]
pub enum IndexingError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Pipeline error.
    #[error("Pipeline error: {0}")]
    PipelineError(#[from] amqp_indexer_pipeline::PipelineError),

    /// Sink error.
    #[error("Sink error: {0}")]
    SinkError(#[from] amqp_indexer_repository::SinkError),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl IndexingError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }
}

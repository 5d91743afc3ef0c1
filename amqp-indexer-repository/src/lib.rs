//! # AMQP Indexer Repository
//!
//! This crate provides the bulk sink side of the AMQP indexer. It includes
//! the bulk request and result types, error definitions, the `BulkSink`
//! interface, and a concrete implementation for OpenSearch.

pub mod config;
pub mod errors;
pub mod interfaces;
pub mod opensearch;
pub mod types;

pub use config::SinkConfig;
pub use errors::SinkError;
pub use interfaces::BulkSink;
pub use opensearch::OpenSearchSink;
pub use types::{
    ActionKind, BulkAction, BulkItemFailure, BulkItemResult, BulkRequest, BulkResult, FailureKind,
};

//! Error types for the AMQP indexer repository.

mod sink_error;

pub use sink_error::SinkError;

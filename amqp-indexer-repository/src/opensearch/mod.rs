//! OpenSearch implementation of the bulk sink.
//!
//! This module provides a concrete implementation of `BulkSink`
//! using OpenSearch as the backend.

mod client;
mod response;

pub use client::OpenSearchSink;
pub use response::parse_bulk_response;

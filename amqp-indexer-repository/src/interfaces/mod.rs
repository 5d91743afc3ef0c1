//! Interface definitions for the bulk sink.
//!
//! This module defines the abstract `BulkSink` trait that allows for
//! dependency injection and swappable indexing backends.

mod bulk_sink;

pub use bulk_sink::BulkSink;

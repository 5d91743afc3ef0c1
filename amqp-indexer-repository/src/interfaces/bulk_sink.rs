//! Bulk sink trait definition.
//!
//! This module defines the abstract interface for bulk indexing, allowing for
//! different backend implementations (OpenSearch, Elasticsearch, mocks).

use async_trait::async_trait;

use crate::errors::SinkError;
use crate::types::{BulkRequest, BulkResult};

/// Abstract interface for the indexing service accepting batched writes.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; unordered submissions call the
/// sink from several tasks at once.
///
/// # Error Handling
///
/// A returned `Err` means the request failed as a whole. Per-action failures
/// are reported inside an `Ok(BulkResult)`.
#[async_trait]
pub trait BulkSink: Send + Sync {
    /// Execute one bulk request.
    ///
    /// # Arguments
    ///
    /// * `request` - The validated actions to submit
    ///
    /// # Returns
    ///
    /// * `Ok(BulkResult)` - Per-action outcomes, in request order
    /// * `Err(SinkError)` - If the request could not be executed at all
    async fn bulk(&self, request: &BulkRequest) -> Result<BulkResult, SinkError>;

    /// Check if the sink is reachable.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - If the sink answered
    /// * `Ok(false)` - If the sink answered with an error status
    /// * `Err(SinkError)` - If the check could not be executed
    async fn health_check(&self) -> Result<bool, SinkError>;
}

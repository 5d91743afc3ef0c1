//! OpenSearch client implementation.
//!
//! This module provides the concrete implementation of `BulkSink`
//! using the OpenSearch Rust client.

use async_trait::async_trait;
use opensearch::{
    http::request::JsonBody,
    http::transport::{SingleNodeConnectionPool, TransportBuilder},
    BulkParts, OpenSearch,
};
use serde_json::Value;
use tracing::{debug, error, info, instrument};
use url::Url;

use crate::config::SinkConfig;
use crate::errors::SinkError;
use crate::interfaces::BulkSink;
use crate::opensearch::response::parse_bulk_response;
use crate::types::{BulkRequest, BulkResult};

/// OpenSearch bulk sink.
///
/// # Example
///
/// ```ignore
/// let sink = OpenSearchSink::new(&SinkConfig::new("http://localhost:9200"))?;
///
/// let mut request = BulkRequest::new();
/// request.add(b"{\"index\":{\"_index\":\"test\",\"_id\":\"1\"}}\n{\"field\":1}")?;
/// let result = sink.bulk(&request).await?;
/// ```
pub struct OpenSearchSink {
    client: OpenSearch,
}

impl OpenSearchSink {
    /// Create a new OpenSearch sink for the configured URL.
    ///
    /// # Returns
    ///
    /// * `Ok(OpenSearchSink)` - A new sink instance
    /// * `Err(SinkError)` - If the URL is invalid or transport setup fails
    pub fn new(config: &SinkConfig) -> Result<Self, SinkError> {
        let parsed_url =
            Url::parse(&config.url).map_err(|e| SinkError::connection(e.to_string()))?;

        let conn_pool = SingleNodeConnectionPool::new(parsed_url);
        let transport = TransportBuilder::new(conn_pool)
            .disable_proxy()
            .build()
            .map_err(|e| SinkError::connection(e.to_string()))?;

        let client = OpenSearch::new(transport);

        info!(url = %config.url, "Created OpenSearch sink");

        Ok(Self { client })
    }
}

#[async_trait]
impl BulkSink for OpenSearchSink {
    #[instrument(skip(self, request), fields(actions = request.number_of_actions()))]
    async fn bulk(&self, request: &BulkRequest) -> Result<BulkResult, SinkError> {
        let body: Vec<JsonBody<Value>> = request.to_body().into_iter().map(Into::into).collect();

        let response = self
            .client
            .bulk(BulkParts::None)
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::connection(e.to_string()))?;

        let status = response.status_code();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %error_body, "Bulk request failed");
            return Err(SinkError::rejected(status.as_u16(), error_body));
        }

        let response_body: Value = response
            .json()
            .await
            .map_err(|e| SinkError::parse(e.to_string()))?;

        let result = parse_bulk_response(response_body)?;
        if result.items.len() != request.number_of_actions() {
            return Err(SinkError::parse(format!(
                "Bulk response has {} items for {} actions",
                result.items.len(),
                request.number_of_actions()
            )));
        }

        debug!(
            took_ms = result.took_ms,
            has_failures = result.has_failures(),
            "Bulk request completed"
        );
        Ok(result)
    }

    async fn health_check(&self) -> Result<bool, SinkError> {
        let response = self
            .client
            .ping()
            .send()
            .await
            .map_err(|e| SinkError::connection(e.to_string()))?;

        Ok(response.status_code().is_success())
    }
}

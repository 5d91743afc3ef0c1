//! Configuration types for the bulk sink.

/// Default OpenSearch URL.
pub const DEFAULT_SINK_URL: &str = "http://localhost:9200";

/// Configuration for the OpenSearch bulk sink.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// The OpenSearch server URL.
    pub url: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SINK_URL.to_string(),
        }
    }
}

impl SinkConfig {
    /// Create a config pointing at the given URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

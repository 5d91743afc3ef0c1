//! Dependency initialization and wiring for the AMQP indexer.

use std::sync::Arc;
use tracing::info;

use crate::config::Settings;
use crate::IndexingError;
use amqp_indexer_pipeline::consumer::AmqpConnector;
use amqp_indexer_pipeline::orchestrator::{ConsumerLoop, River};
use amqp_indexer_repository::{BulkSink, OpenSearchSink};

/// Container for all initialized dependencies.
pub struct Dependencies {
    /// The configured river, ready to start.
    pub river: River,
}

impl Dependencies {
    /// Initialize all dependencies from the given settings.
    ///
    /// The bulk sink must answer a ping before the river is built. The
    /// broker is only contacted once the river starts.
    ///
    /// # Returns
    ///
    /// * `Ok(Dependencies)` - Initialized dependencies
    /// * `Err(IndexingError)` - If initialization fails
    pub async fn new(settings: Settings) -> Result<Self, IndexingError> {
        let topology = &settings.orchestrator.topology;
        info!(
            opensearch_url = %settings.sink.url,
            brokers = settings.broker.addresses.len(),
            queue = %topology.queue,
            dead_letter_queue = %topology.dead_letter_queue,
            bulk_size = settings.orchestrator.batcher.bulk_size,
            ordered = settings.orchestrator.loader.ordered,
            "Initializing dependencies"
        );

        // Initialize OpenSearch sink
        let sink = OpenSearchSink::new(&settings.sink)?;

        // Verify OpenSearch is reachable
        let healthy = sink
            .health_check()
            .await
            .map_err(|e| IndexingError::config(format!("OpenSearch health check failed: {}", e)))?;

        if !healthy {
            return Err(IndexingError::config("OpenSearch cluster is unhealthy"));
        }

        info!("OpenSearch connection verified");

        let connector = AmqpConnector::new(settings.broker);
        let consumer = ConsumerLoop::new(
            Arc::new(connector),
            Arc::new(sink),
            settings.orchestrator,
        );

        Ok(Self {
            river: River::new(consumer),
        })
    }
}

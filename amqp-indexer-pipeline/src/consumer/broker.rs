//! Broker capability traits and routing topology.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::consumer::messages::Delivery;
use crate::errors::PipelineError;

/// Stream of deliveries from one channel's consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, PipelineError>>;

/// Extra arguments passed to queue declaration (HA policy and the like).
///
/// Copied once at construction and never mutated afterwards, so clones can
/// be shared freely across reconnects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueArguments(Arc<BTreeMap<String, Value>>);

impl QueueArguments {
    pub fn new(arguments: BTreeMap<String, Value>) -> Self {
        Self(Arc::new(arguments))
    }

    /// Build the arguments from a JSON object such as `{"x-ha-policy": "all"}`.
    pub fn from_json(value: &Value) -> Result<Self, PipelineError> {
        match value {
            Value::Object(object) => Ok(Self::new(
                object
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            )),
            Value::Null => Ok(Self::default()),
            _ => Err(PipelineError::config("queue arguments must be a JSON object")),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Exchange, queues and bindings declared on every new channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    pub exchange: String,
    pub exchange_type: String,
    pub exchange_durable: bool,
    pub queue: String,
    pub queue_durable: bool,
    pub queue_auto_delete: bool,
    pub queue_arguments: QueueArguments,
    pub routing_key: String,
    /// Dead-letter queue; also used as its routing key on the same exchange.
    pub dead_letter_queue: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: "elasticsearch".to_string(),
            exchange_type: "direct".to_string(),
            exchange_durable: true,
            queue: "elasticsearch".to_string(),
            queue_durable: true,
            queue_auto_delete: false,
            queue_arguments: QueueArguments::default(),
            routing_key: "elasticsearch".to_string(),
            dead_letter_queue: "elasticsearch_failed".to_string(),
        }
    }
}

/// Opens broker channels.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a new connection and a channel on it.
    ///
    /// # Returns
    ///
    /// * `Ok(channel)` - A live channel owning its connection
    /// * `Err(PipelineError::ConnectionError)` - If no broker accepted the connection
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, PipelineError>;
}

/// A live broker channel together with the connection it runs on.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare the exchange, the primary and dead-letter queues, and their bindings.
    async fn declare(&self, topology: &Topology) -> Result<(), PipelineError>;

    /// Start a manual-ack consumer bounded by `prefetch_count` unacked messages.
    async fn consume(
        &self,
        queue: &str,
        prefetch_count: u16,
    ) -> Result<DeliveryStream, PipelineError>;

    /// Acknowledge a single delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), PipelineError>;

    /// Publish a persistent message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), PipelineError>;

    /// Close the channel and its connection.
    async fn close(&self, reason: &str) -> Result<(), PipelineError>;

    /// Whether delivery tags issued by this channel can still be acknowledged.
    fn is_open(&self) -> bool;
}

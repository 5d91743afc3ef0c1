//! AMQP implementation of the broker capability.
//!
//! Connects to RabbitMQ (or any AMQP 0-9-1 broker) through `lapin`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::consumer::broker::{
    BrokerChannel, BrokerConnector, DeliveryStream, QueueArguments, Topology,
};
use crate::consumer::messages::Delivery;
use crate::errors::PipelineError;

/// Default AMQP port.
pub const DEFAULT_AMQP_PORT: u16 = 5672;

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// `delivery_mode` value for messages that survive a broker restart.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A broker host and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for BrokerAddress {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_AMQP_PORT)
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for BrokerAddress {
    type Err = PipelineError;

    /// Parse `host` or `host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PipelineError::config("empty broker address"));
        }

        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    PipelineError::config(format!("invalid port in broker address {}: {}", s, e))
                })?;
                if host.is_empty() {
                    return Err(PipelineError::config(format!(
                        "missing host in broker address {}",
                        s
                    )));
                }
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(s, DEFAULT_AMQP_PORT)),
        }
    }
}

/// Connection settings for the broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Addresses tried in order until one accepts the connection.
    pub addresses: Vec<BrokerAddress>,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            addresses: vec![BrokerAddress::default()],
            user: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Build the AMQP URI for one address.
    fn uri(&self, address: &BrokerAddress) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.user),
            urlencoding::encode(&self.password),
            address.host,
            address.port,
            urlencoding::encode(&self.vhost)
        )
    }
}

/// Opens AMQP connections with a single channel each.
pub struct AmqpConnector {
    config: BrokerConfig,
}

impl AmqpConnector {
    pub fn new(config: BrokerConfig) -> Self {
        info!(
            addresses = ?config.addresses.iter().map(ToString::to_string).collect::<Vec<_>>(),
            user = %config.user,
            vhost = %config.vhost,
            "Created AMQP connector"
        );
        Self { config }
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    #[instrument(skip(self))]
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, PipelineError> {
        let mut last_error = None;

        for address in &self.config.addresses {
            let connection =
                match Connection::connect(&self.config.uri(address), ConnectionProperties::default())
                    .await
                {
                    Ok(connection) => connection,
                    Err(e) => {
                        warn!(address = %address, error = %e, "Failed to connect to broker");
                        last_error = Some(e);
                        continue;
                    }
                };

            let channel = match connection.create_channel().await {
                Ok(channel) => channel,
                Err(e) => {
                    if let Err(close_err) = connection
                        .close(REPLY_SUCCESS, "failed to create channel")
                        .await
                    {
                        debug!(error = %close_err, "Failed to close connection");
                    }
                    return Err(PipelineError::connection(e.to_string()));
                }
            };

            info!(address = %address, channel_id = channel.id(), "Connected to broker");
            return Ok(Arc::new(AmqpChannel {
                connection,
                channel,
            }));
        }

        Err(match last_error {
            Some(e) => PipelineError::connection(e.to_string()),
            None => PipelineError::connection("no broker addresses configured"),
        })
    }
}

/// A lapin channel and the connection that owns it.
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare(&self, topology: &Topology) -> Result<(), PipelineError> {
        self.channel
            .exchange_declare(
                &topology.exchange,
                exchange_kind(&topology.exchange_type),
                ExchangeDeclareOptions {
                    durable: topology.exchange_durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let arguments = field_table(&topology.queue_arguments);

        for (queue, routing_key) in [
            (&topology.queue, &topology.routing_key),
            (&topology.dead_letter_queue, &topology.dead_letter_queue),
        ] {
            self.channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: topology.queue_durable,
                        exclusive: false,
                        auto_delete: topology.queue_auto_delete,
                        ..QueueDeclareOptions::default()
                    },
                    arguments.clone(),
                )
                .await?;

            self.channel
                .queue_bind(
                    queue,
                    &topology.exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        debug!(
            exchange = %topology.exchange,
            queue = %topology.queue,
            dead_letter_queue = %topology.dead_letter_queue,
            "Declared topology"
        );
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch_count: u16,
    ) -> Result<DeliveryStream, PipelineError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;

        let consumer_tag = format!("amqp-indexer-{}", Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        info!(queue = %queue, prefetch_count, consumer_tag = %consumer_tag, "Started consuming");

        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(PipelineError::from))
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), PipelineError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), PipelineError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_content_type("text/plain".into());

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn close(&self, reason: &str) -> Result<(), PipelineError> {
        let channel_result = self.channel.close(REPLY_SUCCESS, reason).await;
        let connection_result = self.connection.close(REPLY_SUCCESS, reason).await;
        channel_result?;
        connection_result?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

fn exchange_kind(exchange_type: &str) -> ExchangeKind {
    match exchange_type {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

fn field_table(arguments: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments.iter() {
        match amqp_value(value) {
            Some(value) => table.insert(key.clone().into(), value),
            None => warn!(key = %key, "Skipping queue argument with unsupported value"),
        }
    }
    table
}

fn amqp_value(value: &Value) -> Option<AMQPValue> {
    match value {
        Value::String(s) => Some(AMQPValue::LongString(s.clone().into())),
        Value::Bool(b) => Some(AMQPValue::Boolean(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(AMQPValue::LongLongInt)
            .or_else(|| n.as_f64().map(AMQPValue::Double)),
        _ => None,
    }
}

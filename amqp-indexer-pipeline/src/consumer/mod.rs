//! Consumer module for the AMQP indexer pipeline.
//!
//! Provides the broker capability traits and their AMQP implementation.

mod amqp_consumer;
mod broker;
mod messages;

pub use amqp_consumer::{AmqpConnector, BrokerAddress, BrokerConfig};
pub use broker::{BrokerChannel, BrokerConnector, DeliveryStream, QueueArguments, Topology};
pub use messages::Delivery;

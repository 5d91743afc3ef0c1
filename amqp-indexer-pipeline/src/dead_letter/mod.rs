//! Dead-letter publisher.
//!
//! Republishes payloads that can never be indexed to the dead-letter route:
//! same exchange, dead-letter queue name as routing key, raw bytes with a
//! persistent delivery mode. Publish failures are logged and the message is
//! lost; the primary delivery has already been resolved at that point.

use tracing::{error, info, warn};

use crate::consumer::{BrokerChannel, Topology};

/// Publishes raw payloads to the dead-letter route.
#[derive(Debug, Clone)]
pub struct DeadLetterPublisher {
    exchange: String,
    routing_key: String,
}

impl DeadLetterPublisher {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Route dead letters to the topology's dead-letter queue.
    pub fn from_topology(topology: &Topology) -> Self {
        Self::new(&topology.exchange, &topology.dead_letter_queue)
    }

    /// Publish one payload, unmodified.
    ///
    /// Returns `true` if the broker accepted the message.
    pub async fn publish(&self, channel: &dyn BrokerChannel, payload: &[u8]) -> bool {
        if !channel.is_open() {
            warn!(
                routing_key = %self.routing_key,
                bytes = payload.len(),
                "Channel closed, dead letter lost"
            );
            return false;
        }

        match channel
            .publish(&self.exchange, &self.routing_key, payload)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!(
                    routing_key = %self.routing_key,
                    payload = %String::from_utf8_lossy(payload),
                    error = %e,
                    "Could not publish to the dead-letter queue"
                );
                false
            }
        }
    }

    /// Publish several payloads, logging how many were queued.
    pub async fn publish_all<'a>(
        &self,
        channel: &dyn BrokerChannel,
        payloads: impl IntoIterator<Item = &'a [u8]>,
    ) {
        let payloads: Vec<&[u8]> = payloads.into_iter().collect();
        info!(
            count = payloads.len(),
            routing_key = %self.routing_key,
            "Queuing invalid messages"
        );
        for payload in payloads {
            self.publish(channel, payload).await;
        }
    }
}

//! Batcher module for the AMQP indexer pipeline.
//!
//! Groups deliveries from one channel into bounded bulk requests.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::ack::AckTracker;
use crate::consumer::{BrokerChannel, Delivery, DeliveryStream};
use crate::dead_letter::DeadLetterPublisher;
use crate::errors::PipelineError;
use amqp_indexer_repository::BulkRequest;

/// Configuration for the delivery batcher.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Maximum number of bulk actions in one batch.
    pub bulk_size: usize,
    /// How long to wait for each further delivery once a batch is started.
    pub bulk_timeout: Duration,
    /// Index applied to actions that do not name one.
    pub default_index: Option<String>,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            bulk_size: 100,
            bulk_timeout: Duration::from_millis(10),
            default_index: None,
        }
    }
}

/// Deliveries collected in one accumulation cycle, with their bulk request.
///
/// `deliveries[slot]` is the delivery whose payload occupies `slot` in the
/// request. Every delivery came from `channel`.
pub struct Batch {
    pub channel: Arc<dyn BrokerChannel>,
    pub request: BulkRequest,
    pub deliveries: Vec<Delivery>,
}

impl Batch {
    pub fn new(channel: Arc<dyn BrokerChannel>, default_index: Option<String>) -> Self {
        Self {
            channel,
            request: BulkRequest::with_default_index(default_index),
            deliveries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    pub fn delivery_tags(&self) -> Vec<u64> {
        self.deliveries.iter().map(|d| d.delivery_tag).collect()
    }
}

/// Accumulates deliveries into batches.
///
/// Malformed payloads never enter a batch: they are dead-lettered and
/// acknowledged as soon as they fail to parse.
pub struct DeliveryBatcher {
    config: BatcherConfig,
    dead_letters: Arc<DeadLetterPublisher>,
    acks: Arc<AckTracker>,
}

impl DeliveryBatcher {
    pub fn new(
        config: BatcherConfig,
        dead_letters: Arc<DeadLetterPublisher>,
        acks: Arc<AckTracker>,
    ) -> Self {
        Self {
            config,
            dead_letters,
            acks,
        }
    }

    /// Wait for the next delivery, then fill a batch behind it.
    ///
    /// The wait for the first delivery has no timeout.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(batch))` - A batch, possibly empty if every payload was malformed
    /// * `Ok(None)` - If shutdown was requested while waiting for the first delivery
    /// * `Err(PipelineError)` - If the delivery stream failed or ended
    pub async fn next_batch(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        stream: &mut DeliveryStream,
        cancel: &CancellationToken,
    ) -> Result<Option<Batch>, PipelineError> {
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            next = stream.next() => next,
        };
        let first = Self::into_delivery(first)?;

        let mut batch = Batch::new(channel.clone(), self.config.default_index.clone());
        self.append(&mut batch, first).await;
        self.fill(&mut batch, stream, cancel).await?;

        trace!(
            deliveries = batch.len(),
            actions = batch.request.number_of_actions(),
            "Collected batch"
        );
        Ok(Some(batch))
    }

    /// Add deliveries to `batch` until it reaches the bulk size, no delivery
    /// arrives within the bulk timeout, or shutdown is requested.
    pub async fn fill(
        &self,
        batch: &mut Batch,
        stream: &mut DeliveryStream,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        while batch.request.number_of_actions() < self.config.bulk_size {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = tokio::time::timeout(self.config.bulk_timeout, stream.next()) => next,
            };

            match next {
                Ok(next) => {
                    let delivery = Self::into_delivery(next)?;
                    self.append(batch, delivery).await;
                }
                Err(_) => break,
            }
        }
        Ok(())
    }

    async fn append(&self, batch: &mut Batch, delivery: Delivery) {
        match batch.request.add(&delivery.payload) {
            Ok(_) => batch.deliveries.push(delivery),
            Err(e) => {
                warn!(
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Failed to parse request for delivery, dead-lettering and acking"
                );
                self.dead_letters
                    .publish(batch.channel.as_ref(), &delivery.payload)
                    .await;
                self.acks
                    .ack(batch.channel.as_ref(), delivery.delivery_tag)
                    .await;
            }
        }
    }

    fn into_delivery(
        next: Option<Result<Delivery, PipelineError>>,
    ) -> Result<Delivery, PipelineError> {
        match next {
            Some(delivery) => delivery,
            None => Err(PipelineError::consumer("delivery stream closed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::Topology;
    use crate::testing::{malformed_payload, valid_payload, MockChannel};
    use tokio::time::Instant;

    fn batcher(bulk_size: usize) -> DeliveryBatcher {
        DeliveryBatcher::new(
            BatcherConfig {
                bulk_size,
                bulk_timeout: Duration::from_millis(10),
                default_index: None,
            },
            Arc::new(DeadLetterPublisher::from_topology(&Topology::default())),
            Arc::new(AckTracker::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_delivery_is_isolated() {
        let (mock, tx) = MockChannel::new();
        let mut stream = mock.take_stream();
        let channel: Arc<dyn BrokerChannel> = mock.clone();

        tx.send(Ok(Delivery::new(1, valid_payload("1")))).unwrap();
        tx.send(Ok(Delivery::new(2, malformed_payload()))).unwrap();
        tx.send(Ok(Delivery::new(3, valid_payload("3")))).unwrap();

        let batch = batcher(2)
            .next_batch(&channel, &mut stream, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(batch.delivery_tags(), vec![1, 3]);
        assert_eq!(batch.request.number_of_actions(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_delivery_is_dead_lettered_and_acked_immediately() {
        let (mock, tx) = MockChannel::new();
        let mut stream = mock.take_stream();
        let channel: Arc<dyn BrokerChannel> = mock.clone();

        tx.send(Ok(Delivery::new(1, malformed_payload()))).unwrap();
        tx.send(Ok(Delivery::new(2, valid_payload("2")))).unwrap();

        let batch = batcher(10)
            .next_batch(&channel, &mut stream, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        // The first delivery was bad, the batch still filled behind it.
        assert_eq!(batch.delivery_tags(), vec![2]);
        assert_eq!(mock.acked(), vec![1]);
        assert_eq!(mock.dead_lettered(), vec![malformed_payload()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_on_drained_stream_returns_after_timeout() {
        let (mock, _tx) = MockChannel::new();
        let mut stream = mock.take_stream();
        let channel: Arc<dyn BrokerChannel> = mock.clone();
        let mut batch = Batch::new(channel, None);

        let start = Instant::now();
        batcher(10)
            .fill(&mut batch, &mut stream, &CancellationToken::new())
            .await
            .unwrap();

        assert!(batch.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_is_bounded_by_bulk_size() {
        let (mock, tx) = MockChannel::new();
        let mut stream = mock.take_stream();
        let channel: Arc<dyn BrokerChannel> = mock.clone();

        for tag in 1..=5 {
            tx.send(Ok(Delivery::new(tag, valid_payload(&tag.to_string()))))
                .unwrap();
        }

        let batcher = batcher(3);
        let cancel = CancellationToken::new();
        let first = batcher
            .next_batch(&channel, &mut stream, &cancel)
            .await
            .unwrap()
            .unwrap();
        let second = batcher
            .next_batch(&channel, &mut stream, &cancel)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.delivery_tags(), vec![1, 2, 3]);
        assert_eq!(second.delivery_tags(), vec![4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_returns_none() {
        let (mock, _tx) = MockChannel::new();
        let mut stream = mock.take_stream();
        let channel: Arc<dyn BrokerChannel> = mock.clone();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let batch = batcher(10)
            .next_batch(&channel, &mut stream, &cancel)
            .await
            .unwrap();

        assert!(batch.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_stream_is_an_error() {
        let (mock, tx) = MockChannel::new();
        let mut stream = mock.take_stream();
        let channel: Arc<dyn BrokerChannel> = mock.clone();
        drop(tx);

        let result = batcher(10)
            .next_batch(&channel, &mut stream, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(PipelineError::ConsumerError(_))));
    }
}

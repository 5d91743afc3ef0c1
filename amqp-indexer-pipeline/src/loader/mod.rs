//! Loader module for the AMQP indexer pipeline.
//!
//! Submits batches to the bulk sink and resolves their deliveries: failed
//! payloads go to the dead-letter route, then every handle is acknowledged.

mod retry;

pub use retry::RetryPolicy;

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::ack::AckTracker;
use crate::batcher::Batch;
use crate::dead_letter::DeadLetterPublisher;
use amqp_indexer_repository::{BulkRequest, BulkResult, BulkSink, SinkError};

/// Configuration for the submission engine.
#[derive(Debug, Clone, Default)]
pub struct LoaderConfig {
    /// Submit in line with retries, or hand each batch to a background task.
    pub ordered: bool,
    pub retry: RetryPolicy,
}

/// What a bulk submission came back with.
#[derive(Debug, Clone)]
pub enum BulkOutcome {
    /// The sink answered with per-action results.
    Completed(BulkResult),
    /// The request as a whole did not go through.
    Failed(SinkError),
}

impl BulkOutcome {
    /// Whether submitting the same request again could change the outcome.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Completed(result) => result.has_retriable_failures(),
            Self::Failed(e) => e.is_retriable(),
        }
    }
}

/// Runs bulk submissions under the ordered or unordered discipline.
///
/// Ordered submissions block the caller until the batch is resolved.
/// Unordered submissions run on tracked tasks and are awaited by [`drain`].
///
/// [`drain`]: SubmissionEngine::drain
pub struct SubmissionEngine {
    sink: Arc<dyn BulkSink>,
    config: LoaderConfig,
    dead_letters: Arc<DeadLetterPublisher>,
    acks: Arc<AckTracker>,
    tracker: TaskTracker,
}

impl SubmissionEngine {
    pub fn new(
        sink: Arc<dyn BulkSink>,
        config: LoaderConfig,
        dead_letters: Arc<DeadLetterPublisher>,
        acks: Arc<AckTracker>,
    ) -> Self {
        Self {
            sink,
            config,
            dead_letters,
            acks,
            tracker: TaskTracker::new(),
        }
    }

    /// Submit a batch and resolve its deliveries.
    ///
    /// Empty batches (every payload was malformed) are skipped.
    #[instrument(skip(self, batch), fields(deliveries = batch.len(), ordered = self.config.ordered))]
    pub async fn submit(&self, batch: Batch) {
        if batch.is_empty() {
            debug!("Skipping empty batch");
            return;
        }

        if self.config.ordered {
            let outcome =
                execute_with_retry(self.sink.as_ref(), &batch.request, &self.config.retry).await;
            resolve(batch, outcome, &self.dead_letters, &self.acks).await;
            return;
        }

        let sink = self.sink.clone();
        let dead_letters = self.dead_letters.clone();
        let acks = self.acks.clone();
        self.tracker.spawn(async move {
            let outcome = execute(sink.as_ref(), &batch.request).await;
            resolve(batch, outcome, &dead_letters, &acks).await;
        });
    }

    /// Wait for every in-flight unordered submission to resolve.
    pub async fn drain(&self) {
        let pending = self.tracker.len();
        if pending > 0 {
            info!(pending, "Waiting for in-flight bulk submissions");
        }
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Number of unordered submissions still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}

async fn execute(sink: &dyn BulkSink, request: &BulkRequest) -> BulkOutcome {
    match sink.bulk(request).await {
        Ok(result) => {
            debug!(
                actions = request.number_of_actions(),
                took_ms = result.took_ms,
                failures = result.failed_positions().count(),
                "Executed bulk request"
            );
            BulkOutcome::Completed(result)
        }
        Err(e) => BulkOutcome::Failed(e),
    }
}

/// Execute `request`, retrying while the outcome is retriable and the
/// policy allows another attempt. No wait follows the final attempt.
pub async fn execute_with_retry(
    sink: &dyn BulkSink,
    request: &BulkRequest,
    policy: &RetryPolicy,
) -> BulkOutcome {
    let mut try_num = 1;
    loop {
        let outcome = execute(sink, request).await;
        if !outcome.is_retriable() || !policy.allows_retry_after(try_num) {
            return outcome;
        }

        try_num += 1;
        let wait = policy.wait_before(try_num);
        match &outcome {
            BulkOutcome::Completed(result) => warn!(
                try_num,
                max_tries = policy.max_tries,
                wait_ms = wait.as_millis() as u64,
                failures = result.failed_positions().count(),
                "Retriable failures in bulk execution, retrying"
            ),
            BulkOutcome::Failed(e) => warn!(
                try_num,
                max_tries = policy.max_tries,
                wait_ms = wait.as_millis() as u64,
                error = %e,
                "Bulk execution failed, retrying"
            ),
        }
        tokio::time::sleep(wait).await;
    }
}

/// Dead-letter what failed in `batch`, then acknowledge all of it.
pub async fn resolve(
    batch: Batch,
    outcome: BulkOutcome,
    dead_letters: &DeadLetterPublisher,
    acks: &AckTracker,
) {
    let Batch {
        channel,
        request,
        deliveries,
    } = batch;

    let failed_slots: BTreeSet<usize> = match &outcome {
        BulkOutcome::Completed(result) if !result.has_failures() => BTreeSet::new(),
        BulkOutcome::Completed(result) => {
            error!(
                failures = %result.failure_message(),
                "Bulk execution finished with failures"
            );
            result
                .failed_positions()
                .filter_map(|position| request.payload_for_action(position))
                .collect()
        }
        BulkOutcome::Failed(e) => {
            error!(error = %e, payloads = deliveries.len(), "Bulk execution failed");
            (0..deliveries.len()).collect()
        }
    };

    if !failed_slots.is_empty() {
        let payloads: Vec<&[u8]> = failed_slots
            .iter()
            .filter_map(|slot| deliveries.get(*slot))
            .map(|delivery| delivery.payload.as_slice())
            .collect();
        dead_letters.publish_all(channel.as_ref(), payloads).await;
    }

    let tags = deliveries.iter().map(|d| d.delivery_tag).collect();
    acks.ack_all(channel.as_ref(), tags).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{BrokerChannel, Delivery, Topology};
    use crate::testing::{result_for, valid_payload, MockChannel, MockSink};
    use std::time::Duration;

    const RETRIABLE: &str = "es_rejected_execution_exception";
    const TERMINAL: &str = "mapper_parsing_exception";

    fn batch_of(mock: &Arc<MockChannel>, ids: &[&str]) -> Batch {
        let channel: Arc<dyn BrokerChannel> = mock.clone();
        let mut batch = Batch::new(channel, None);
        for (tag, id) in ids.iter().enumerate() {
            let payload = valid_payload(id);
            batch.request.add(&payload).unwrap();
            batch.deliveries.push(Delivery::new(tag as u64 + 1, payload));
        }
        batch
    }

    fn engine(sink: Arc<MockSink>, ordered: bool, max_tries: u32) -> SubmissionEngine {
        SubmissionEngine::new(
            sink,
            LoaderConfig {
                ordered,
                retry: RetryPolicy {
                    max_tries,
                    min_wait: Duration::from_secs(1),
                    max_wait: Duration::from_secs(17),
                },
            },
            Arc::new(DeadLetterPublisher::from_topology(&Topology::default())),
            Arc::new(AckTracker::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_ordered_retries_until_max_tries() {
        let sink = Arc::new(MockSink::failing_every_action(RETRIABLE));
        let (mock, _tx) = MockChannel::new();

        engine(sink.clone(), true, 4)
            .submit(batch_of(&mock, &["1", "2"]))
            .await;

        let calls = sink.calls();
        assert_eq!(calls.len(), 4);

        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1].at - w[0].at).collect();
        for (gap, expected) in gaps.iter().zip([5, 10, 17]) {
            assert!(*gap >= Duration::from_secs(expected), "gap {:?}", gap);
            assert!(*gap < Duration::from_secs(expected) + Duration::from_millis(50));
        }

        assert_eq!(mock.dead_lettered(), vec![valid_payload("1"), valid_payload("2")]);
        assert_eq!(mock.acked(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ordered_terminal_failure_is_not_retried() {
        let sink = Arc::new(MockSink::failing_every_action(TERMINAL));
        let (mock, _tx) = MockChannel::new();

        engine(sink.clone(), true, 4)
            .submit(batch_of(&mock, &["1"]))
            .await;

        assert_eq!(sink.calls().len(), 1);
        assert_eq!(mock.dead_lettered(), vec![valid_payload("1")]);
        assert_eq!(mock.acked(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ordered_dead_letters_only_failed_payload() {
        let sink = Arc::new(
            MockSink::succeeding().then(Ok(result_for(3, &[(1, TERMINAL)]))),
        );
        let (mock, _tx) = MockChannel::new();

        engine(sink.clone(), true, 4)
            .submit(batch_of(&mock, &["1", "2", "3"]))
            .await;

        assert_eq!(sink.calls().len(), 1);
        assert_eq!(mock.dead_lettered(), vec![valid_payload("2")]);
        assert_eq!(mock.acked(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ordered_recovers_after_retriable_failure() {
        let sink = Arc::new(
            MockSink::succeeding().then(Ok(result_for(2, &[(0, RETRIABLE)]))),
        );
        let (mock, _tx) = MockChannel::new();

        engine(sink.clone(), true, 4)
            .submit(batch_of(&mock, &["1", "2"]))
            .await;

        assert_eq!(sink.calls().len(), 2);
        assert!(mock.dead_lettered().is_empty());
        assert_eq!(mock.acked(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ordered_transport_failure_dead_letters_everything() {
        let sink = Arc::new(MockSink::erroring(SinkError::connection("refused")));
        let (mock, _tx) = MockChannel::new();

        engine(sink.clone(), true, 2)
            .submit(batch_of(&mock, &["1", "2"]))
            .await;

        assert_eq!(sink.calls().len(), 2);
        assert_eq!(mock.dead_lettered(), vec![valid_payload("1"), valid_payload("2")]);
        assert_eq!(mock.acked(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unordered_submission_runs_in_background() {
        let sink = Arc::new(MockSink::succeeding());
        let (mock, _tx) = MockChannel::new();
        let engine = engine(sink.clone(), false, 4);

        engine.submit(batch_of(&mock, &["1", "2"])).await;
        engine.drain().await;

        assert_eq!(engine.in_flight(), 0);
        assert_eq!(sink.calls().len(), 1);
        assert!(mock.dead_lettered().is_empty());
        assert_eq!(mock.acked(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unordered_total_failure_is_not_retried() {
        let sink = Arc::new(MockSink::erroring(SinkError::connection("refused")));
        let (mock, _tx) = MockChannel::new();
        let engine = engine(sink.clone(), false, 4);

        engine.submit(batch_of(&mock, &["1", "2"])).await;
        engine.drain().await;

        assert_eq!(sink.calls().len(), 1);
        assert_eq!(mock.dead_lettered(), vec![valid_payload("1"), valid_payload("2")]);
        assert_eq!(mock.acked(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_empty_batch_is_skipped() {
        let sink = Arc::new(MockSink::succeeding());
        let (mock, _tx) = MockChannel::new();

        engine(sink.clone(), true, 4)
            .submit(batch_of(&mock, &[]))
            .await;

        assert!(sink.calls().is_empty());
        assert_eq!(mock.ack_attempts(), 0);
    }

    #[test]
    fn test_outcome_retriability() {
        assert!(BulkOutcome::Failed(SinkError::connection("down")).is_retriable());
        assert!(!BulkOutcome::Failed(SinkError::rejected(400, "bad")).is_retriable());
        assert!(BulkOutcome::Completed(result_for(1, &[(0, RETRIABLE)])).is_retriable());
        assert!(!BulkOutcome::Completed(result_for(1, &[(0, TERMINAL)])).is_retriable());
        assert!(!BulkOutcome::Completed(result_for(2, &[])).is_retriable());
    }
}

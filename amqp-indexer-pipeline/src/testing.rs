//! In-memory broker and sink doubles shared by the pipeline tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use amqp_indexer_repository::{
    ActionKind, BulkItemFailure, BulkItemResult, BulkRequest, BulkResult, BulkSink, SinkError,
};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::consumer::{BrokerChannel, BrokerConnector, Delivery, DeliveryStream, Topology};
use crate::errors::PipelineError;

pub(crate) type DeliverySender = mpsc::UnboundedSender<Result<Delivery, PipelineError>>;

/// A bulk payload with one index action.
pub(crate) fn valid_payload(id: &str) -> Vec<u8> {
    format!(
        "{{\"index\":{{\"_index\":\"test\",\"_id\":\"{}\"}}}}\n{{\"field\":\"{}\"}}\n",
        id, id
    )
    .into_bytes()
}

pub(crate) fn malformed_payload() -> Vec<u8> {
    b"{ this is not bulk json".to_vec()
}

/// Poll `condition` until it holds, failing the test after `limit`.
pub(crate) async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
}

/// Broker channel recording every operation.
pub(crate) struct MockChannel {
    open: AtomicBool,
    fail_acks: AtomicBool,
    fail_publishes: AtomicBool,
    fail_declare: AtomicBool,
    ack_attempts: AtomicUsize,
    acked: Mutex<Vec<u64>>,
    published: Mutex<Vec<Published>>,
    declared: Mutex<Vec<Topology>>,
    consumed: Mutex<Vec<(String, u16)>>,
    deliveries: Mutex<Option<DeliveryStream>>,
}

impl MockChannel {
    /// Create a channel and the sender feeding its delivery stream.
    pub fn new() -> (Arc<Self>, DeliverySender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            open: AtomicBool::new(true),
            fail_acks: AtomicBool::new(false),
            fail_publishes: AtomicBool::new(false),
            fail_declare: AtomicBool::new(false),
            ack_attempts: AtomicUsize::new(0),
            acked: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            declared: Mutex::new(Vec::new()),
            consumed: Mutex::new(Vec::new()),
            deliveries: Mutex::new(Some(UnboundedReceiverStream::new(rx).boxed())),
        };
        (Arc::new(channel), tx)
    }

    pub fn fail_acks(&self) {
        self.fail_acks.store(true, Ordering::SeqCst);
    }

    pub fn fail_publishes(&self) {
        self.fail_publishes.store(true, Ordering::SeqCst);
    }

    pub fn fail_declare(&self) {
        self.fail_declare.store(true, Ordering::SeqCst);
    }

    pub fn acked(&self) -> Vec<u64> {
        self.acked.lock().unwrap().clone()
    }

    pub fn ack_attempts(&self) -> usize {
        self.ack_attempts.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn dead_lettered(&self) -> Vec<Vec<u8>> {
        self.published().into_iter().map(|p| p.payload).collect()
    }

    pub fn declared(&self) -> Vec<Topology> {
        self.declared.lock().unwrap().clone()
    }

    pub fn consumed(&self) -> Vec<(String, u16)> {
        self.consumed.lock().unwrap().clone()
    }

    /// Take the delivery stream without going through `consume`.
    pub fn take_stream(&self) -> DeliveryStream {
        self.deliveries
            .lock()
            .unwrap()
            .take()
            .expect("delivery stream already taken")
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn declare(&self, topology: &Topology) -> Result<(), PipelineError> {
        if self.fail_declare.load(Ordering::SeqCst) {
            return Err(PipelineError::broker("declare refused"));
        }
        self.declared.lock().unwrap().push(topology.clone());
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch_count: u16,
    ) -> Result<DeliveryStream, PipelineError> {
        self.consumed
            .lock()
            .unwrap()
            .push((queue.to_string(), prefetch_count));
        self.deliveries
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| PipelineError::broker("already consuming"))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), PipelineError> {
        self.ack_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_acks.load(Ordering::SeqCst) {
            return Err(PipelineError::broker("ack refused"));
        }
        let mut acked = self.acked.lock().unwrap();
        assert!(
            !acked.contains(&delivery_tag),
            "delivery tag {} acked twice",
            delivery_tag
        );
        acked.push(delivery_tag);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), PipelineError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(PipelineError::broker("publish refused"));
        }
        self.published.lock().unwrap().push(Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn close(&self, _reason: &str) -> Result<(), PipelineError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Connector handing out scripted channels, then refusing connections.
pub(crate) struct MockConnector {
    channels: Mutex<VecDeque<Arc<MockChannel>>>,
    connects: AtomicUsize,
}

impl MockConnector {
    pub fn new(channels: Vec<Arc<MockChannel>>) -> Self {
        Self {
            channels: Mutex::new(channels.into()),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerConnector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, PipelineError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.channels.lock().unwrap().pop_front() {
            Some(channel) => Ok(channel),
            None => Err(PipelineError::connection("connection refused")),
        }
    }
}

#[derive(Debug, Clone)]
enum Fallback {
    Succeed,
    FailEveryAction(BulkItemFailure),
    Error(SinkError),
}

/// A recorded call to the sink.
#[derive(Debug, Clone)]
pub(crate) struct SinkCall {
    pub at: Instant,
    pub actions: usize,
    pub payloads: usize,
}

/// Bulk sink answering from a script, then from a fallback behaviour.
pub(crate) struct MockSink {
    scripted: Mutex<VecDeque<Result<BulkResult, SinkError>>>,
    fallback: Fallback,
    calls: Mutex<Vec<SinkCall>>,
}

impl MockSink {
    fn with_fallback(fallback: Fallback) -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::with_fallback(Fallback::Succeed)
    }

    pub fn failing_every_action(error_type: &str) -> Self {
        Self::with_fallback(Fallback::FailEveryAction(BulkItemFailure::new(
            error_type,
            "rejected by mock",
        )))
    }

    pub fn erroring(error: SinkError) -> Self {
        Self::with_fallback(Fallback::Error(error))
    }

    /// Queue a response returned before the fallback kicks in.
    pub fn then(self, response: Result<BulkResult, SinkError>) -> Self {
        self.scripted.lock().unwrap().push_back(response);
        self
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }
}

/// A result with every action of `request` succeeding except `failed`.
pub(crate) fn result_for(request_actions: usize, failed: &[(usize, &str)]) -> BulkResult {
    let items = (0..request_actions)
        .map(|position| {
            match failed.iter().find(|(p, _)| *p == position) {
                Some((_, error_type)) => BulkItemResult::failed(
                    ActionKind::Index,
                    400,
                    BulkItemFailure::new(*error_type, "rejected by mock"),
                ),
                None => BulkItemResult::success(ActionKind::Index, 201),
            }
        })
        .collect();
    BulkResult::new(items)
}

#[async_trait]
impl BulkSink for MockSink {
    async fn bulk(&self, request: &BulkRequest) -> Result<BulkResult, SinkError> {
        self.calls.lock().unwrap().push(SinkCall {
            at: Instant::now(),
            actions: request.number_of_actions(),
            payloads: request.number_of_payloads(),
        });

        if let Some(response) = self.scripted.lock().unwrap().pop_front() {
            return response;
        }

        match &self.fallback {
            Fallback::Succeed => Ok(result_for(request.number_of_actions(), &[])),
            Fallback::FailEveryAction(failure) => Ok(BulkResult::new(
                request
                    .actions()
                    .iter()
                    .map(|action| BulkItemResult::failed(action.kind, 400, failure.clone()))
                    .collect(),
            )),
            Fallback::Error(error) => Err(error.clone()),
        }
    }

    async fn health_check(&self) -> Result<bool, SinkError> {
        Ok(true)
    }
}

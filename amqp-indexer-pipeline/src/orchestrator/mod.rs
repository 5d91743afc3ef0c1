//! Orchestrator module for the AMQP indexer pipeline.
//!
//! Runs the connect/consume/reconnect state machine and exposes the
//! [`River`] lifecycle handle used by the binary.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::ack::{AckStats, AckTracker};
use crate::batcher::{BatcherConfig, DeliveryBatcher};
use crate::consumer::{BrokerChannel, BrokerConnector, DeliveryStream, Topology};
use crate::dead_letter::DeadLetterPublisher;
use crate::errors::PipelineError;
use crate::loader::{LoaderConfig, SubmissionEngine};
use amqp_indexer_repository::BulkSink;

/// Where the consumer loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Consuming,
    /// Shutdown requested, waiting for in-flight submissions.
    Draining,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Consuming => "consuming",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Configuration for the consumer loop.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub topology: Topology,
    /// Maximum number of unacknowledged deliveries the broker hands out.
    pub prefetch_count: u16,
    /// Pause between a failed connection attempt and the next one.
    pub reconnect_cooldown: Duration,
    pub batcher: BatcherConfig,
    pub loader: LoaderConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            topology: Topology::default(),
            prefetch_count: 100,
            reconnect_cooldown: Duration::from_secs(5),
            batcher: BatcherConfig::default(),
            loader: LoaderConfig::default(),
        }
    }
}

/// Consumes the primary queue until shutdown, reconnecting on failure.
///
/// Each connection cycle opens a fresh channel, declares the topology,
/// starts consuming and runs batcher, engine and ack tracker in a loop.
/// Any broker error tears the channel down and starts a new cycle after
/// the cooldown.
pub struct ConsumerLoop {
    connector: Arc<dyn BrokerConnector>,
    config: OrchestratorConfig,
    batcher: DeliveryBatcher,
    engine: SubmissionEngine,
    acks: Arc<AckTracker>,
    state: watch::Sender<ConnectionState>,
}

impl ConsumerLoop {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        sink: Arc<dyn BulkSink>,
        config: OrchestratorConfig,
    ) -> Self {
        let dead_letters = Arc::new(DeadLetterPublisher::from_topology(&config.topology));
        let acks = Arc::new(AckTracker::new());
        let batcher =
            DeliveryBatcher::new(config.batcher.clone(), dead_letters.clone(), acks.clone());
        let engine =
            SubmissionEngine::new(sink, config.loader.clone(), dead_letters, acks.clone());
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            connector,
            config,
            batcher,
            engine,
            acks,
            state,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn ack_stats(&self) -> AckStats {
        self.acks.stats()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Consumer state changed");
        }
    }

    /// Run until `cancel` fires, then drain in-flight work and close.
    #[instrument(skip(self, cancel), fields(queue = %self.config.topology.queue))]
    pub async fn run(&self, cancel: CancellationToken) {
        info!(ordered = self.config.loader.ordered, "Starting consumer loop");

        while !cancel.is_cancelled() {
            self.set_state(ConnectionState::Connecting);

            match self.open().await {
                Ok((channel, mut stream)) => {
                    self.set_state(ConnectionState::Consuming);
                    let result = self.consume(&channel, &mut stream, &cancel).await;
                    drop(stream);

                    match result {
                        Ok(()) => {
                            self.set_state(ConnectionState::Draining);
                            self.engine.drain().await;
                            self.teardown(channel.as_ref(), "shutdown").await;
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "Lost broker channel");
                            self.set_state(ConnectionState::Disconnected);
                            self.teardown(channel.as_ref(), "reconnecting").await;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to open broker channel");
                    self.set_state(ConnectionState::Disconnected);
                }
            }

            if !self.cooldown(&cancel).await {
                break;
            }
        }

        self.engine.drain().await;
        self.set_state(ConnectionState::Closed);

        let stats = self.acks.stats();
        info!(
            acked = stats.acked,
            failed = stats.failed,
            discarded = stats.discarded,
            "Consumer loop closed"
        );
    }

    /// Connect, declare the topology and start consuming.
    async fn open(&self) -> Result<(Arc<dyn BrokerChannel>, DeliveryStream), PipelineError> {
        let channel = self.connector.connect().await?;

        let stream = match self.start_consuming(channel.as_ref()).await {
            Ok(stream) => stream,
            Err(e) => {
                self.teardown(channel.as_ref(), "setup failed").await;
                return Err(e);
            }
        };

        Ok((channel, stream))
    }

    async fn start_consuming(
        &self,
        channel: &dyn BrokerChannel,
    ) -> Result<DeliveryStream, PipelineError> {
        let topology = &self.config.topology;
        channel.declare(topology).await?;
        channel
            .consume(&topology.queue, self.config.prefetch_count)
            .await
    }

    /// Batch and submit until shutdown or a broker error.
    async fn consume(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        stream: &mut DeliveryStream,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        while let Some(batch) = self.batcher.next_batch(channel, stream, cancel).await? {
            self.engine.submit(batch).await;
        }
        Ok(())
    }

    async fn teardown(&self, channel: &dyn BrokerChannel, reason: &str) {
        if let Err(e) = channel.close(reason).await {
            debug!(error = %e, "Error closing broker channel");
        }
    }

    /// Sleep for the reconnect cooldown. Returns `false` if shutdown was
    /// requested before it elapsed.
    async fn cooldown(&self, cancel: &CancellationToken) -> bool {
        let cooldown = self.config.reconnect_cooldown;
        if cancel.is_cancelled() {
            return false;
        }

        warn!(cooldown_ms = cooldown.as_millis() as u64, "Reconnecting after cooldown");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(cooldown) => true,
        }
    }
}

/// Lifecycle handle for a consumer loop running on its own task.
///
/// `start` and `close` are idempotent. A closed river cannot be restarted.
pub struct River {
    consumer: Arc<ConsumerLoop>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl River {
    pub fn new(consumer: ConsumerLoop) -> Self {
        Self {
            consumer: Arc::new(consumer),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the consumer loop.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() {
            debug!("River already started");
            return;
        }
        if self.cancel.is_cancelled() {
            warn!("River already closed, not starting");
            return;
        }

        let consumer = self.consumer.clone();
        let cancel = self.cancel.clone();
        *handle = Some(tokio::spawn(async move { consumer.run(cancel).await }));
        info!("Started river");
    }

    /// Request shutdown. In-flight submissions still complete.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            info!("Closing river");
            self.cancel.cancel();
        }
    }

    /// Wait for the consumer loop to finish.
    pub async fn join(&self) {
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Consumer loop task failed");
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.consumer.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.consumer.subscribe()
    }

    pub fn ack_stats(&self) -> AckStats {
        self.consumer.ack_stats()
    }
}

impl Drop for River {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

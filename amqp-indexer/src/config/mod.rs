//! Settings and dependency wiring for the AMQP indexer.

mod dependencies;

pub use dependencies::Dependencies;

use std::env;
use std::str::FromStr;
use std::time::Duration;

use amqp_indexer_pipeline::batcher::BatcherConfig;
use amqp_indexer_pipeline::consumer::{BrokerAddress, BrokerConfig, QueueArguments, Topology};
use amqp_indexer_pipeline::loader::{LoaderConfig, RetryPolicy};
use amqp_indexer_pipeline::orchestrator::OrchestratorConfig;
use amqp_indexer_repository::config::DEFAULT_SINK_URL;
use amqp_indexer_repository::SinkConfig;

use crate::IndexingError;

/// Everything the indexer reads from its environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub broker: BrokerConfig,
    pub sink: SinkConfig,
    pub orchestrator: OrchestratorConfig,
    /// Emit logs as JSON lines instead of human-readable text.
    pub json_logs: bool,
}

impl Settings {
    /// Read settings from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `AMQP_ADDRESSES`: comma-separated `host[:port]` list (default: localhost:5672)
    /// - `AMQP_USER` / `AMQP_PASS` / `AMQP_VHOST`: credentials and vhost (default: guest/guest, /)
    /// - `AMQP_QUEUE`, `AMQP_EXCHANGE`, `AMQP_EXCHANGE_TYPE`, `AMQP_ROUTING_KEY`,
    ///   `AMQP_DEAD_LETTER_QUEUE`: routing (default: elasticsearch, direct exchange)
    /// - `AMQP_EXCHANGE_DURABLE`, `AMQP_QUEUE_DURABLE`, `AMQP_QUEUE_AUTO_DELETE`
    /// - `AMQP_QUEUE_ARGS`: JSON object of extra queue arguments
    /// - `AMQP_PREFETCH_COUNT` (default: 100)
    /// - `BULK_SIZE` (default: 100), `BULK_TIMEOUT_MS` (default: 10)
    /// - `BULK_ORDERED` (default: false)
    /// - `BULK_RETRIES` (default: 9), `BULK_RETRY_MIN_WAIT` / `BULK_RETRY_MAX_WAIT`
    ///   in seconds (default: 1 / 30)
    /// - `RECONNECT_COOLDOWN_SECS` (default: 5)
    /// - `OPENSEARCH_URL` (default: http://localhost:9200), `OPENSEARCH_DEFAULT_INDEX`
    /// - `LOG_FORMAT`: `json` for JSON logs
    pub fn from_env() -> Result<Self, IndexingError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read settings through `lookup`, treating blank values as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, IndexingError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let topology_defaults = Topology::default();
        let broker_defaults = BrokerConfig::default();
        let orchestrator_defaults = OrchestratorConfig::default();

        let addresses = match vars.get("AMQP_ADDRESSES") {
            Some(list) => list
                .split(',')
                .filter(|address| !address.trim().is_empty())
                .map(BrokerAddress::from_str)
                .collect::<Result<Vec<_>, _>>()?,
            None => broker_defaults.addresses.clone(),
        };
        if addresses.is_empty() {
            return Err(IndexingError::config("AMQP_ADDRESSES lists no broker"));
        }

        let broker = BrokerConfig {
            addresses,
            user: vars.string("AMQP_USER", broker_defaults.user),
            password: vars.string("AMQP_PASS", broker_defaults.password),
            vhost: vars.string("AMQP_VHOST", broker_defaults.vhost),
        };

        let queue_arguments = match vars.get("AMQP_QUEUE_ARGS") {
            Some(raw) => {
                let value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
                    IndexingError::config(format!("AMQP_QUEUE_ARGS is not valid JSON: {}", e))
                })?;
                QueueArguments::from_json(&value)?
            }
            None => topology_defaults.queue_arguments.clone(),
        };

        let topology = Topology {
            exchange: vars.string("AMQP_EXCHANGE", topology_defaults.exchange),
            exchange_type: vars.string("AMQP_EXCHANGE_TYPE", topology_defaults.exchange_type),
            exchange_durable: vars.parse(
                "AMQP_EXCHANGE_DURABLE",
                topology_defaults.exchange_durable,
            )?,
            queue: vars.string("AMQP_QUEUE", topology_defaults.queue),
            queue_durable: vars.parse("AMQP_QUEUE_DURABLE", topology_defaults.queue_durable)?,
            queue_auto_delete: vars.parse(
                "AMQP_QUEUE_AUTO_DELETE",
                topology_defaults.queue_auto_delete,
            )?,
            queue_arguments,
            routing_key: vars.string("AMQP_ROUTING_KEY", topology_defaults.routing_key),
            dead_letter_queue: vars.string(
                "AMQP_DEAD_LETTER_QUEUE",
                topology_defaults.dead_letter_queue,
            ),
        };

        let default_index = vars.get("OPENSEARCH_DEFAULT_INDEX");
        let sink = SinkConfig::new(vars.string("OPENSEARCH_URL", DEFAULT_SINK_URL.to_string()));

        let batcher_defaults = orchestrator_defaults.batcher.clone();
        let bulk_size: usize = vars.parse("BULK_SIZE", batcher_defaults.bulk_size)?;
        if bulk_size == 0 {
            return Err(IndexingError::config("BULK_SIZE must be at least 1"));
        }
        let batcher = BatcherConfig {
            bulk_size,
            bulk_timeout: Duration::from_millis(vars.parse(
                "BULK_TIMEOUT_MS",
                batcher_defaults.bulk_timeout.as_millis() as u64,
            )?),
            default_index,
        };

        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy::with_retries(
            vars.parse("BULK_RETRIES", retry_defaults.max_tries - 1)?,
            Duration::from_secs(vars.parse(
                "BULK_RETRY_MIN_WAIT",
                retry_defaults.min_wait.as_secs(),
            )?),
            Duration::from_secs(vars.parse(
                "BULK_RETRY_MAX_WAIT",
                retry_defaults.max_wait.as_secs(),
            )?),
        );
        if retry.max_wait < retry.min_wait {
            return Err(IndexingError::config(
                "BULK_RETRY_MAX_WAIT must not be lower than BULK_RETRY_MIN_WAIT",
            ));
        }

        let orchestrator = OrchestratorConfig {
            topology,
            prefetch_count: vars.parse(
                "AMQP_PREFETCH_COUNT",
                orchestrator_defaults.prefetch_count,
            )?,
            reconnect_cooldown: Duration::from_secs(vars.parse(
                "RECONNECT_COOLDOWN_SECS",
                orchestrator_defaults.reconnect_cooldown.as_secs(),
            )?),
            batcher,
            loader: LoaderConfig {
                ordered: vars.parse("BULK_ORDERED", false)?,
                retry,
            },
        };

        let json_logs = vars
            .get("LOG_FORMAT")
            .is_some_and(|format| format.eq_ignore_ascii_case("json"));

        Ok(Self {
            broker,
            sink,
            orchestrator,
            json_logs,
        })
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn string(&self, key: &str, default: String) -> String {
        self.get(key).unwrap_or(default)
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, IndexingError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.parse::<T>().map_err(|e| {
                IndexingError::config(format!("invalid value for {}: {} ({})", key, raw, e))
            }),
            None => Ok(default),
        }
    }
}

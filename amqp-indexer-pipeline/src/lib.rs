//! # AMQP Indexer Pipeline
//!
//! This crate provides the pipeline components for consuming bulk payloads
//! from an AMQP queue and indexing them through a bulk sink.
//!
//! ## Architecture
//!
//! The pipeline follows a Consumer-Batcher-Loader pattern:
//!
//! 1. **Consumer**: Connects to the broker and streams deliveries
//! 2. **Batcher**: Groups deliveries into bounded bulk requests
//! 3. **Loader**: Submits bulk requests, retrying or dead-lettering failures
//! 4. **Ack / Dead letter**: Resolves every delivery handle exactly once
//! 5. **Orchestrator**: Runs the connect/consume/reconnect state machine

pub mod ack;
pub mod batcher;
pub mod consumer;
pub mod dead_letter;
pub mod errors;
pub mod loader;
pub mod orchestrator;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::PipelineError;

//! Processor system for the MCP relay
//!
//! Every frame that crosses a relay runs through an ordered chain of processors.
//! A processor is an external program that inspects, transforms, or rejects one
//! JSON document and reports its decision with an HTTP-style status code.
//!
//! # Modules
//!
//! - `schema`: processor I/O documents and output contract enforcement
//! - `config`: processor configuration and load-time validation
//! - `executor`: external command processors with per-invocation deadlines
//! - `chain`: sequential chain execution and result aggregation
//! - `envelope`: JSON-RPC error responses for rejected frames

pub mod chain;
pub mod config;
pub mod envelope;
pub mod executor;
pub mod schema;

use async_trait::async_trait;

pub use chain::{ChainResult, ProcessorChain};
pub use config::{validate_processors, ProcessorConfig};
pub use envelope::{ErrorEnvelope, JsonRpcError};
pub use executor::{default_working_dir, CommandProcessor};
pub use schema::{ProcessorError, ProcessorInput, ProcessorOutput};

/// Capability shared by every processor kind.
///
/// `run` returns `Err` only when the processor could not be invoked at all
/// (disabled, unserializable input). Misbehaving processors produce a
/// synthesized 500 [`ProcessorOutput`] instead.
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool;

    async fn run(&self, input: &ProcessorInput) -> Result<ProcessorOutput, ProcessorError>;
}

//! Processor I/O schema definitions and serialization
//!
//! Processors receive one [`ProcessorInput`] document on stdin and answer with one
//! [`ProcessorOutput`] document on stdout. Whatever a processor prints is normalised
//! here so that the rest of the relay can rely on the output contract.

use crate::relay::message::{MessageType, TransportKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Connection-level context handed to every processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionContext {
    /// Name of the downstream MCP server
    pub server_name: String,

    /// Transport the frame arrived on
    pub transport: TransportKind,

    /// Relay session the frame belongs to
    pub session_id: String,
}

/// Execution history visible to a processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorMetadata {
    /// Names of the processors that already ran on this frame
    pub processor_chain: Vec<String>,

    /// The frame payload before any processor touched it
    pub original_payload: Value,
}

/// Input written to a processor's stdin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorInput {
    /// Logical message type ("request", "response", ...)
    #[serde(rename = "type")]
    pub message_type: MessageType,

    /// RFC 3339 timestamp
    pub timestamp: String,

    pub connection: ConnectionContext,

    /// Current working payload
    pub payload: Value,

    pub metadata: ProcessorMetadata,
}

/// Output read from a processor's stdout, after contract normalisation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorOutput {
    /// HTTP-style status: 200 success, 4xx rejection, 5xx failure
    pub status: u16,

    /// Payload that replaces the working payload on success
    pub payload: Value,

    /// Always present once status >= 400
    pub error: Option<String>,

    /// Processor-specific metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// What a processor actually printed; nothing here is trusted yet
#[derive(Debug, Deserialize)]
struct RawProcessorOutput {
    status: i64,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

/// Processor-specific errors
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// Processor is configured but switched off
    #[error("processor '{name}' is disabled")]
    Disabled { name: String },

    /// No implementation exists for the configured kind
    #[error("processor '{name}': unsupported processor type '{kind}'")]
    UnsupportedKind { name: String, kind: String },

    /// Kind-specific configuration is malformed
    #[error("processor '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },

    /// Input could not be serialized for the processor
    #[error("failed to marshal processor input: {0}")]
    Serialize(#[source] serde_json::Error),

    /// The frame itself is not JSON, so no chain result can be produced
    #[error("failed to parse JSON payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),
}

impl ProcessorInput {
    /// Serialize to the JSON document written on stdin
    pub fn to_json(&self) -> Result<Vec<u8>, ProcessorError> {
        serde_json::to_vec(self).map_err(ProcessorError::Serialize)
    }
}

impl ProcessorOutput {
    /// Synthesized 500 that keeps the caller's payload intact
    pub fn internal_error(payload: Value, error: impl Into<String>) -> Self {
        Self {
            status: 500,
            payload,
            error: Some(error.into()),
            metadata: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status < 400
    }

    /// Parse a processor's stdout and enforce the output contract.
    ///
    /// Contract violations never escape as errors: invalid JSON and out-of-range
    /// status codes become a 500 carrying the input payload, a missing payload
    /// defaults to the input payload, and a failure status without an error
    /// message gets one.
    pub fn from_stdout(processor_name: &str, input: &ProcessorInput, stdout: &[u8]) -> Self {
        let raw: RawProcessorOutput = match serde_json::from_slice(stdout) {
            Ok(raw) => raw,
            Err(e) => {
                let mut message =
                    format!("processor '{processor_name}' returned invalid JSON: {e}");
                if !stdout.is_empty() {
                    message.push_str("\nstdout: ");
                    message.push_str(&String::from_utf8_lossy(stdout));
                }
                return Self::internal_error(input.payload.clone(), message);
            }
        };

        let status = match u16::try_from(raw.status) {
            Ok(status) if (100..600).contains(&status) => status,
            _ => {
                return Self::internal_error(
                    input.payload.clone(),
                    format!(
                        "processor '{processor_name}' returned invalid status code: {}",
                        raw.status
                    ),
                );
            }
        };

        let payload = match raw.payload {
            Some(Value::Null) | None => input.payload.clone(),
            Some(payload) => payload,
        };

        let error = match raw.error {
            None if status >= 400 => Some(format!("status {status} requires error message")),
            error => error,
        };

        Self {
            status,
            payload,
            error,
            metadata: raw.metadata,
        }
    }
}

//! Processor chain execution logic
//!
//! This module runs an ordered list of processors over one frame, stopping at the
//! first rejection or failure.

use crate::processor::config::ProcessorConfig;
use crate::processor::envelope::{
    ErrorEnvelope, JsonRpcError, RejectionData, PROCESSING_FAILED_CODE, REJECTED_CODE,
};
use crate::processor::schema::{
    ConnectionContext, ProcessorError, ProcessorInput, ProcessorMetadata,
};
use crate::processor::Processor;
use crate::relay::message::Message;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of running one frame through a chain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainResult {
    /// Final status (200, 4xx, 5xx)
    pub status: u16,
    /// Payload after the last processor that ran
    pub payload: Value,
    /// Set whenever status >= 400
    pub error: Option<String>,
    /// Processors that ran, in order
    pub processor_chain: Vec<String>,
    /// Metadata reported by each processor, keyed by processor name
    pub metadata: Map<String, Value>,
}

impl ChainResult {
    pub fn is_success(&self) -> bool {
        self.status < 400
    }

    /// Format a rejected or failed result as a JSON-RPC error response.
    ///
    /// Returns `None` for successful results, which are never wrapped.
    pub fn error_envelope(&self, id: Value) -> Option<ErrorEnvelope> {
        let (code, message) = match self.status {
            500.. => (PROCESSING_FAILED_CODE, "Request processing failed"),
            400..=499 => (REJECTED_CODE, "Request rejected by processor"),
            _ => return None,
        };

        Some(ErrorEnvelope::new(
            id,
            JsonRpcError {
                code,
                message: message.to_string(),
                data: Some(RejectionData {
                    processor_chain: self.processor_chain.clone(),
                    metadata: self.metadata.clone(),
                    rejection_reason: self.error.clone(),
                }),
            },
        ))
    }
}

/// An ordered sequence of processors applied to every frame of one server
#[derive(Clone)]
pub struct ProcessorChain {
    processors: Vec<Arc<dyn Processor>>,
    server_name: String,
}

impl std::fmt::Debug for ProcessorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorChain")
            .field("server_name", &self.server_name)
            .field(
                "processors",
                &self.processors.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ProcessorChain {
    pub fn new(processors: Vec<Arc<dyn Processor>>, server_name: impl Into<String>) -> Self {
        Self {
            processors,
            server_name: server_name.into(),
        }
    }

    /// A chain that lets every frame through untouched
    pub fn empty(server_name: impl Into<String>) -> Self {
        Self::new(Vec::new(), server_name)
    }

    /// Build a chain from configuration, instantiating every processor up front
    pub fn from_configs(
        configs: &[ProcessorConfig],
        server_name: impl Into<String>,
        working_dir: &Path,
    ) -> Result<Self, ProcessorError> {
        let processors = configs
            .iter()
            .map(|config| config.build(working_dir))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(processors, server_name))
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Whether any processor would run on a frame
    pub fn has_processors(&self) -> bool {
        self.processors.iter().any(|p| p.enabled())
    }

    /// Execute the chain sequentially on one frame.
    ///
    /// The only error is an unparseable frame; every processor outcome is
    /// expressed through the returned [`ChainResult`].
    pub async fn execute(&self, message: &Message) -> Result<ChainResult, ProcessorError> {
        let original: Value =
            serde_json::from_str(&message.raw).map_err(ProcessorError::InvalidPayload)?;

        let mut payload = original.clone();
        let mut processor_chain: Vec<String> = Vec::new();
        let mut metadata = Map::new();

        let connection = ConnectionContext {
            server_name: self.server_name.clone(),
            transport: message.transport,
            session_id: message.session_id.clone(),
        };

        for processor in self.processors.iter().filter(|p| p.enabled()) {
            let name = processor.name();
            debug!(
                "Executing processor '{}' for server '{}' ({:?})",
                name, self.server_name, message.direction
            );

            let input = ProcessorInput {
                message_type: message.message_type,
                timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                connection: connection.clone(),
                payload,
                metadata: ProcessorMetadata {
                    processor_chain: processor_chain.clone(),
                    original_payload: original.clone(),
                },
            };

            let output = match processor.run(&input).await {
                Ok(output) => output,
                Err(e) => {
                    warn!("Processor '{}' could not be executed: {}", name, e);
                    return Ok(ChainResult {
                        status: 500,
                        payload: input.payload,
                        error: Some(format!("processor '{name}' execution failed: {e}")),
                        processor_chain,
                        metadata,
                    });
                }
            };

            processor_chain.push(name.to_string());
            if let Some(processor_metadata) = output.metadata.clone() {
                metadata.insert(name.to_string(), processor_metadata);
            }

            if !output.is_success() {
                info!(
                    status = output.status,
                    session = %message.session_id,
                    "Processor '{}' stopped the chain: {}",
                    name,
                    output.error.as_deref().unwrap_or_default()
                );
                return Ok(ChainResult {
                    status: output.status,
                    payload: output.payload,
                    error: output.error,
                    processor_chain,
                    metadata,
                });
            }

            payload = output.payload;
        }

        Ok(ChainResult {
            status: 200,
            payload,
            error: None,
            processor_chain,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ProcessorOutput;
    use crate::relay::message::{Direction, MessageType, TransportKind};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Processor returning a fixed decision and recording what it saw
    struct StubProcessor {
        name: String,
        enabled: bool,
        status: u16,
        payload: Option<Value>,
        error: Option<String>,
        fail: bool,
        seen: Mutex<Vec<ProcessorInput>>,
    }

    impl StubProcessor {
        fn ok(name: &str) -> Self {
            Self {
                name: name.to_string(),
                enabled: true,
                status: 200,
                payload: None,
                error: None,
                fail: false,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn status(mut self, status: u16, error: &str) -> Self {
            self.status = status;
            self.error = Some(error.to_string());
            self
        }

        fn replacing(mut self, payload: Value) -> Self {
            self.payload = Some(payload);
            self
        }

        fn disabled(mut self) -> Self {
            self.enabled = false;
            self
        }

        fn broken(mut self) -> Self {
            self.fail = true;
            self
        }
    }

    #[async_trait]
    impl Processor for StubProcessor {
        fn name(&self) -> &str {
            &self.name
        }

        fn enabled(&self) -> bool {
            self.enabled
        }

        async fn run(&self, input: &ProcessorInput) -> Result<ProcessorOutput, ProcessorError> {
            self.seen.lock().unwrap().push(input.clone());
            if self.fail {
                return Err(ProcessorError::Disabled {
                    name: self.name.clone(),
                });
            }
            Ok(ProcessorOutput {
                status: self.status,
                payload: self.payload.clone().unwrap_or_else(|| input.payload.clone()),
                error: self.error.clone(),
                metadata: Some(json!({"seen_by": self.name})),
            })
        }
    }

    fn message(raw: &str) -> Message {
        Message::new(
            Direction::ClientToServer,
            MessageType::Request,
            raw,
            TransportKind::Stdio,
            "session_test",
        )
    }

    fn chain(processors: Vec<Arc<StubProcessor>>) -> ProcessorChain {
        ProcessorChain::new(
            processors
                .into_iter()
                .map(|p| p as Arc<dyn Processor>)
                .collect(),
            "test-server",
        )
    }

    const LIST: &str = r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#;

    #[tokio::test]
    async fn test_empty_chain() {
        let result = ProcessorChain::empty("test-server")
            .execute(&message(LIST))
            .await
            .unwrap();

        assert_eq!(result.status, 200);
        assert_eq!(result.payload, serde_json::from_str::<Value>(LIST).unwrap());
        assert!(result.processor_chain.is_empty());
        assert!(result.metadata.is_empty());
    }

    #[tokio::test]
    async fn test_all_success_runs_in_order() {
        let chain = chain(vec![
            Arc::new(StubProcessor::ok("first")),
            Arc::new(StubProcessor::ok("second")),
            Arc::new(StubProcessor::ok("third")),
        ]);

        let result = chain.execute(&message(LIST)).await.unwrap();

        assert_eq!(result.status, 200);
        assert_eq!(result.processor_chain, vec!["first", "second", "third"]);
        assert_eq!(result.metadata["second"], json!({"seen_by": "second"}));
    }

    #[tokio::test]
    async fn test_history_and_original_payload_passed_along() {
        let first = Arc::new(StubProcessor::ok("first").replacing(json!({"rewritten": true})));
        let second = Arc::new(StubProcessor::ok("second"));
        let chain = chain(vec![first, second.clone()]);

        let result = chain.execute(&message(LIST)).await.unwrap();

        assert_eq!(result.payload, json!({"rewritten": true}));
        let seen = second.seen.lock().unwrap();
        assert_eq!(seen[0].payload, json!({"rewritten": true}));
        assert_eq!(seen[0].metadata.processor_chain, vec!["first"]);
        assert_eq!(seen[0].metadata.original_payload["method"], "tools/list");
        assert_eq!(seen[0].connection.server_name, "test-server");
        assert_eq!(seen[0].connection.session_id, "session_test");
    }

    #[tokio::test]
    async fn test_rejection_stops_chain() {
        let last = Arc::new(StubProcessor::ok("last"));
        let chain = chain(vec![
            Arc::new(StubProcessor::ok("logger")),
            Arc::new(
                StubProcessor::ok("validator")
                    .status(403, "Delete operations not allowed")
                    .replacing(json!({})),
            ),
            last.clone(),
        ]);

        let result = chain.execute(&message(LIST)).await.unwrap();

        assert_eq!(result.status, 403);
        assert_eq!(result.payload, json!({}));
        assert_eq!(result.error.as_deref(), Some("Delete operations not allowed"));
        assert_eq!(result.processor_chain, vec!["logger", "validator"]);
        assert!(last.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_processors_are_skipped() {
        let skipped = Arc::new(StubProcessor::ok("skipped").disabled());
        let chain = chain(vec![skipped.clone(), Arc::new(StubProcessor::ok("active"))]);

        let result = chain.execute(&message(LIST)).await.unwrap();

        assert_eq!(result.processor_chain, vec!["active"]);
        assert!(skipped.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fully_disabled_chain_is_passthrough() {
        let chain = chain(vec![Arc::new(StubProcessor::ok("off").disabled())]);
        assert!(!chain.has_processors());

        let result = chain.execute(&message(LIST)).await.unwrap();
        assert_eq!(result.status, 200);
        assert!(result.processor_chain.is_empty());
    }

    #[tokio::test]
    async fn test_executor_failure_becomes_500() {
        let after = Arc::new(StubProcessor::ok("after"));
        let chain = chain(vec![
            Arc::new(StubProcessor::ok("ok")),
            Arc::new(StubProcessor::ok("broken").broken()),
            after.clone(),
        ]);

        let result = chain.execute(&message(LIST)).await.unwrap();

        assert_eq!(result.status, 500);
        assert_eq!(result.processor_chain, vec!["ok"]);
        assert!(result
            .error
            .unwrap()
            .starts_with("processor 'broken' execution failed"));
        assert!(after.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_frame_is_hard_error() {
        let chain = chain(vec![Arc::new(StubProcessor::ok("p"))]);
        let err = chain.execute(&message("{not json")).await.unwrap_err();
        assert!(matches!(err, ProcessorError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let chain = chain(vec![
            Arc::new(StubProcessor::ok("a").replacing(json!({"id": 1, "method": "x"}))),
            Arc::new(StubProcessor::ok("b")),
        ]);

        let first = chain.execute(&message(LIST)).await.unwrap();
        let second = chain.execute(&message(LIST)).await.unwrap();

        assert_eq!(first.status, second.status);
        assert_eq!(first.payload, second.payload);
    }

    #[test]
    fn test_error_envelope_codes() {
        let mut result = ChainResult {
            status: 403,
            payload: json!({}),
            error: Some("Delete operations not allowed".to_string()),
            processor_chain: vec!["logger".to_string(), "validator".to_string()],
            metadata: Map::new(),
        };

        let envelope = result.error_envelope(json!(42)).unwrap();
        let value: Value = serde_json::from_str(&envelope.to_json()).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 42);
        assert_eq!(value["error"]["code"], -32001);
        assert_eq!(value["error"]["message"], "Request rejected by processor");
        assert_eq!(
            value["error"]["data"]["processor_chain"],
            json!(["logger", "validator"])
        );
        assert_eq!(
            value["error"]["data"]["rejection_reason"],
            "Delete operations not allowed"
        );

        result.status = 502;
        let envelope = result.error_envelope(json!("abc")).unwrap();
        assert_eq!(envelope.error.code, -32603);
        assert_eq!(envelope.error.message, "Request processing failed");
        assert_eq!(envelope.id, json!("abc"));
    }

    #[test]
    fn test_success_is_never_wrapped() {
        let result = ChainResult {
            status: 200,
            payload: json!({}),
            error: None,
            processor_chain: vec![],
            metadata: Map::new(),
        };
        assert!(result.error_envelope(json!(1)).is_none());
    }

    #[test]
    fn test_from_configs_rejects_unsupported_kind() {
        let mut config = ProcessorConfig::cli("hook", "true", &[]);
        config.kind = "http".to_string();
        assert!(ProcessorChain::from_configs(&[config], "s", Path::new(".")).is_err());
    }
}

//! JSON-RPC 2.0 error responses sent in place of rejected frames

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Internal error, used for processor failures (status >= 500)
pub const PROCESSING_FAILED_CODE: i32 = -32603;
/// Custom server error, used for processor rejections (400..=499)
pub const REJECTED_CODE: i32 = -32001;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub jsonrpc: String,
    pub id: Value,
    pub error: JsonRpcError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<RejectionData>,
}

/// Diagnostic context attached to every processor error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionData {
    pub processor_chain: Vec<String>,
    pub metadata: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            error,
        }
    }

    /// Envelope for failures that happen outside the chain (e.g. downstream unreachable)
    pub fn internal(id: Value, message: impl Into<String>) -> Self {
        Self::new(
            id,
            JsonRpcError {
                code: PROCESSING_FAILED_CODE,
                message: message.into(),
                data: None,
            },
        )
    }

    pub fn to_json(&self) -> String {
        // Only strings, numbers and JSON values: serialization cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"jsonrpc":"2.0","id":null,"error":{{"code":{PROCESSING_FAILED_CODE},"message":"Request processing failed"}}}}"#
            )
        })
    }
}

/// The `id` of a JSON-RPC frame, or `null` when it has none
pub fn request_id(payload: &Value) -> Value {
    payload.get("id").cloned().unwrap_or(Value::Null)
}

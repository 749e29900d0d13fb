//! Frame model shared by every relay

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which way a frame travels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
    /// Relay lifecycle events that carry no protocol frame
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Notification,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
}

impl MessageType {
    /// Classify a raw JSON-RPC frame.
    ///
    /// Frames that are not JSON objects fall back to the type implied by their
    /// direction, so that processors still see a sensible `type`.
    pub fn classify(raw: &str, direction: Direction) -> Self {
        let fallback = match direction {
            Direction::ClientToServer => MessageType::Request,
            Direction::ServerToClient => MessageType::Response,
            Direction::System => return MessageType::System,
        };

        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(_) => return fallback,
        };
        let Some(object) = value.as_object() else {
            return fallback;
        };

        if object.contains_key("method") {
            if object.contains_key("id") {
                MessageType::Request
            } else {
                MessageType::Notification
            }
        } else if object.contains_key("result") || object.contains_key("error") {
            MessageType::Response
        } else {
            fallback
        }
    }
}

/// One frame observed by a relay
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub direction: Direction,
    pub message_type: MessageType,
    /// Exact bytes of the frame, without the trailing newline
    pub raw: String,
    pub transport: TransportKind,
    pub session_id: String,
    /// Downstream command, for stdio relays
    pub command: Option<String>,
    pub args: Vec<String>,
}

impl Message {
    pub fn new(
        direction: Direction,
        message_type: MessageType,
        raw: impl Into<String>,
        transport: TransportKind,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            direction,
            message_type,
            raw: raw.into(),
            transport,
            session_id: session_id.into(),
            command: None,
            args: Vec::new(),
        }
    }

    /// Build a message whose type is derived from the frame itself
    pub fn classified(
        direction: Direction,
        raw: impl Into<String>,
        transport: TransportKind,
        session_id: impl Into<String>,
    ) -> Self {
        let raw = raw.into();
        let message_type = MessageType::classify(&raw, direction);
        Self::new(direction, message_type, raw, transport, session_id)
    }

    pub fn with_command(mut self, command: impl Into<String>, args: &[String]) -> Self {
        self.command = Some(command.into());
        self.args = args.to_vec();
        self
    }
}

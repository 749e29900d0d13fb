//! Relays between an MCP client and a downstream server
//!
//! - `message`: frame model and classification
//! - `frame`: newline-delimited frame reading and writing
//! - `stdio`: child-process relay over stdin/stdout
//! - `http`: HTTP endpoints forwarding to remote servers

pub mod frame;
pub mod http;
pub mod message;
pub mod stdio;

pub use http::HttpRelay;
pub use message::{Direction, Message, MessageType, TransportKind};
pub use stdio::{RelayState, StdioRelay, StdioRelayOptions};

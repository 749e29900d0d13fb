//! Background daemon that hosts stdio relays, and the client used to drive it

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{attach, is_daemon_running, DaemonClient, StdioSession};
pub use protocol::{DaemonRequest, DaemonResponse, RequestKind};
pub use server::Daemon;

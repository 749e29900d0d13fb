//! Logging for the relay
//!
//! Diagnostic output goes through `tracing` to stderr, never stdout, because stdout
//! carries protocol frames in stdio mode. Per-frame activity is reported through the
//! [`ActivityLogger`] collaborator so that relays do not depend on a concrete sink.

use crate::relay::message::{Direction, TransportKind};
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Target used for activity events, so they can be filtered separately
pub const ACTIVITY_TARGET: &str = "mcp_relay::activity";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Start,
    Stop,
    Request,
    Response,
}

/// One observable event in a relay session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityEvent {
    pub kind: ActivityKind,
    pub session_id: String,
    pub server_id: String,
    pub direction: Direction,
    pub transport: TransportKind,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ActivityEvent {
    /// Relay lifecycle event
    pub fn system(
        kind: ActivityKind,
        session_id: &str,
        server_id: &str,
        transport: TransportKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            session_id: session_id.to_string(),
            server_id: server_id.to_string(),
            direction: Direction::System,
            transport,
            success: true,
            status: None,
            message: Some(message.into()),
        }
    }

    /// Per-frame event; frames toward the server are requests
    pub fn frame(
        session_id: &str,
        server_id: &str,
        direction: Direction,
        transport: TransportKind,
        status: u16,
    ) -> Self {
        let kind = match direction {
            Direction::ServerToClient => ActivityKind::Response,
            _ => ActivityKind::Request,
        };
        Self {
            kind,
            session_id: session_id.to_string(),
            server_id: server_id.to_string(),
            direction,
            transport,
            success: status < 400,
            status: Some(status),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Sink for relay activity
pub trait ActivityLogger: Send + Sync {
    fn log(&self, event: &ActivityEvent);
}

/// Default sink: structured tracing events on [`ACTIVITY_TARGET`]
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingActivityLogger;

impl ActivityLogger for TracingActivityLogger {
    fn log(&self, event: &ActivityEvent) {
        let message = event.message.as_deref().unwrap_or_default();
        if event.success {
            info!(
                target: ACTIVITY_TARGET,
                kind = ?event.kind,
                session = %event.session_id,
                server = %event.server_id,
                direction = ?event.direction,
                transport = ?event.transport,
                status = event.status,
                "{}", message
            );
        } else {
            warn!(
                target: ACTIVITY_TARGET,
                kind = ?event.kind,
                session = %event.session_id,
                server = %event.server_id,
                direction = ?event.direction,
                transport = ?event.transport,
                status = event.status,
                "{}", message
            );
        }
    }
}

/// Install the global subscriber.
///
/// `--debug` wins over the configured level; `RUST_LOG` wins over both. When a log
/// file is given, events are also appended there and the returned guard must be held
/// until exit so buffered lines are flushed.
pub fn init_tracing(
    debug: bool,
    log_level: Option<&str>,
    log_file: Option<&Path>,
) -> std::io::Result<Option<WorkerGuard>> {
    let level = if debug {
        "debug"
    } else {
        log_level.unwrap_or("info")
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mcp_relay={level},warn")));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)?;
            let file_name = path
                .file_name()
                .map(|name| name.to_os_string())
                .unwrap_or_else(|| "mcp-relay.log".into());
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .try_init()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    Ok(guard)
}

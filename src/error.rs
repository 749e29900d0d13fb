use std::io;
use thiserror::Error;

use crate::processor::ProcessorError;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Daemon error: {0}")]
    Daemon(#[from] DaemonError),

    #[error("Processor error: {0}")]
    Processor(#[from] ProcessorError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("configuration file not found at {0}")]
    NotFound(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("relay already started")]
    AlreadyStarted,

    #[error("failed to start downstream '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("downstream process is missing its {0} pipe")]
    MissingPipe(&'static str),

    #[error("failed to bind HTTP relay on {addr}: {reason}")]
    Bind { addr: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DaemonError {
    /// Another daemon instance owns the control port.
    #[error("daemon already running on port {port}")]
    AlreadyRunning { port: u16 },

    #[error("failed to bind daemon port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to daemon on port {port}: {reason}")]
    Connect { port: u16, reason: String },

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    /// The daemon answered with `success: false`
    #[error("daemon rejected request: {0}")]
    Rejected(String),

    #[error("daemon request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl warp::reject::Reject for ProxyError {}

//! Long-lived daemon hosting stdio relays
//!
//! The daemon owns a control port on loopback. Each control connection carries one
//! [`DaemonRequest`] and receives one [`DaemonResponse`]. A `stdio` request starts a
//! relay whose client side is reachable through its own loopback attach port.

use crate::config::GlobalConfig;
use crate::daemon::protocol::{DaemonRequest, DaemonResponse, RequestKind};
use crate::error::DaemonError;
use crate::processor::{default_working_dir, ProcessorChain};
use crate::relay::frame::frame_reader;
use crate::relay::{StdioRelay, StdioRelayOptions};
use futures::future::join_all;
use futures::StreamExt;
use serde_json::json;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay between answering a `stop` request and shutting down
const STOP_DELAY: Duration = Duration::from_millis(100);

/// How long a control connection may take to send its request
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// In-memory pipe between a relay and its attach port
const DUPLEX_BUFFER: usize = 64 * 1024;

pub struct Daemon {
    port: u16,
    config: GlobalConfig,
    listener: Mutex<Option<TcpListener>>,
    relays: RwLock<HashMap<String, Arc<StdioRelay>>>,
    shutdown: CancellationToken,
    started_at: Instant,
}

impl Daemon {
    /// Claim the control port on 127.0.0.1.
    ///
    /// Port 0 picks a free port; [`port`](Self::port) reports the one bound.
    pub async fn bind(port: u16, config: GlobalConfig) -> Result<Arc<Self>, DaemonError> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|source| match source.kind() {
                ErrorKind::AddrInUse => DaemonError::AlreadyRunning { port },
                _ => DaemonError::Bind { port, source },
            })?;
        let port = listener
            .local_addr()
            .map_err(|source| DaemonError::Bind { port, source })?
            .port();

        info!(port, "Daemon listening");

        Ok(Arc::new(Self {
            port,
            config,
            listener: Mutex::new(Some(listener)),
            relays: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    pub async fn server_count(&self) -> usize {
        self.relays.read().await.len()
    }

    /// Accept control connections until [`shutdown`](Self::shutdown) is called.
    pub async fn run(self: &Arc<Self>) -> Result<(), DaemonError> {
        let listener = self
            .listener
            .lock()
            .map_err(|_| DaemonError::Protocol("daemon state poisoned".to_string()))?
            .take()
            .ok_or_else(|| DaemonError::Protocol("daemon is already running".to_string()))?;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Control connection accepted");
                        let daemon = Arc::clone(self);
                        tokio::spawn(async move { daemon.handle_connection(stream).await });
                    }
                    Err(e) => warn!("Failed to accept control connection: {}", e),
                },
            }
        }

        drop(listener);
        self.stop_relays().await;
        info!(port = self.port, "Daemon stopped");
        Ok(())
    }

    /// Stop accepting requests and stop every relay. Safe to call more than once.
    pub async fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(port = self.port, "Daemon shutting down");
            self.shutdown.cancel();
        }
        self.stop_relays().await;
    }

    async fn stop_relays(&self) {
        let relays: Vec<_> = self.relays.write().await.drain().map(|(_, r)| r).collect();
        if relays.is_empty() {
            return;
        }
        debug!(count = relays.len(), "Stopping relays");
        for result in join_all(relays.iter().map(|relay| relay.stop())).await {
            if let Err(e) = result {
                warn!("Failed to stop relay: {}", e);
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let (reader, mut writer) = stream.into_split();
        let mut lines = frame_reader(reader);

        let response = match tokio::time::timeout(REQUEST_READ_TIMEOUT, lines.next()).await {
            Ok(Some(Ok(line))) => match serde_json::from_str::<DaemonRequest>(&line) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => DaemonResponse::failure(format!("failed to decode request: {}", e)),
            },
            Ok(Some(Err(e))) => DaemonResponse::failure(format!("failed to decode request: {}", e)),
            Ok(None) => return,
            Err(_) => DaemonResponse::failure("timed out waiting for request"),
        };

        let mut body = match serde_json::to_string(&response) {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to encode daemon response: {}", e);
                return;
            }
        };
        body.push('\n');
        if let Err(e) = writer.write_all(body.as_bytes()).await {
            debug!("Failed to write daemon response: {}", e);
            return;
        }
        let _ = writer.shutdown().await;
    }

    async fn handle_request(self: &Arc<Self>, request: DaemonRequest) -> DaemonResponse {
        debug!(kind = ?request.kind, id = %request.id, "Daemon request");
        match request.kind {
            RequestKind::Stdio => self.handle_stdio(request).await,
            RequestKind::Status => self.handle_status().await,
            RequestKind::Stop => self.handle_stop(),
        }
    }

    async fn handle_stdio(self: &Arc<Self>, request: DaemonRequest) -> DaemonResponse {
        if self.shutdown.is_cancelled() {
            return DaemonResponse::failure("daemon is shutting down");
        }
        if request.command.is_empty() {
            return DaemonResponse::failure("failed to create stdio proxy: command is required");
        }

        let server_name = request
            .metadata
            .get("server_name")
            .cloned()
            .unwrap_or_else(|| request.command.clone());

        // A name matching a configured server picks up its gateway processors and env
        let (processors, env) = match self.config.find_server(&server_name) {
            Some((gateway, server)) => {
                (self.config.processors_for_gateway(gateway), server.env.clone())
            }
            None => (self.config.processors.clone(), HashMap::new()),
        };

        let chain = match ProcessorChain::from_configs(&processors, &server_name, &default_working_dir()) {
            Ok(chain) => chain,
            Err(e) => return DaemonResponse::failure(format!("failed to create stdio proxy: {}", e)),
        };

        let attach = match TcpListener::bind(("127.0.0.1", 0)).await {
            Ok(listener) => listener,
            Err(e) => return DaemonResponse::failure(format!("failed to create stdio proxy: {}", e)),
        };
        let attach_port = match attach.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => return DaemonResponse::failure(format!("failed to create stdio proxy: {}", e)),
        };

        let relay = Arc::new(StdioRelay::new(
            StdioRelayOptions::new(request.command.clone(), request.args.clone())
                .with_env(env)
                .with_chain(chain),
        ));

        let (relay_side, client_side) = tokio::io::duplex(DUPLEX_BUFFER);
        let (relay_reader, relay_writer) = tokio::io::split(relay_side);
        if let Err(e) = relay.start(relay_reader, relay_writer).await {
            return DaemonResponse::failure(format!("failed to start stdio proxy: {}", e));
        }

        let server_id = relay.server_id().to_string();
        self.relays
            .write()
            .await
            .insert(server_id.clone(), Arc::clone(&relay));

        // Shutdown may have drained the registry while the child was spawning
        if self.shutdown.is_cancelled() {
            self.relays.write().await.remove(&server_id);
            if let Err(e) = relay.stop().await {
                warn!(server_id = %server_id, "Failed to stop relay: {}", e);
            }
            return DaemonResponse::failure("daemon is shutting down");
        }

        tokio::spawn(bridge_attach_port(attach, client_side, Arc::clone(&relay)));

        let daemon = Arc::clone(self);
        let watched = Arc::clone(&relay);
        tokio::spawn(async move {
            watched.wait().await;
            if daemon.relays.write().await.remove(watched.server_id()).is_some() {
                info!(server_id = %watched.server_id(), "Stdio relay exited");
            }
        });

        info!(
            server_id = %server_id,
            command = %request.command,
            attach_port,
            "Started stdio relay"
        );

        DaemonResponse {
            server_id: Some(server_id),
            port: Some(attach_port),
            ..DaemonResponse::ok(json!({
                "command": request.command,
                "args": request.args,
                "session_id": relay.session_id(),
            }))
        }
    }

    async fn handle_status(&self) -> DaemonResponse {
        let relays = self.relays.read().await;
        let mut servers: Vec<_> = relays
            .values()
            .map(|relay| {
                json!({
                    "server_id": relay.server_id(),
                    "session_id": relay.session_id(),
                    "command": relay.command(),
                    "args": relay.args(),
                })
            })
            .collect();
        servers.sort_by(|a, b| a["server_id"].as_str().cmp(&b["server_id"].as_str()));

        DaemonResponse {
            port: Some(self.port),
            ..DaemonResponse::ok(json!({
                "running": self.is_running(),
                "port": self.port,
                "server_count": relays.len(),
                "servers": servers,
                "uptime_seconds": self.started_at.elapsed().as_secs(),
            }))
        }
    }

    fn handle_stop(self: &Arc<Self>) -> DaemonResponse {
        let daemon = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(STOP_DELAY).await;
            daemon.shutdown().await;
        });
        DaemonResponse::ok(json!({"message": "daemon stopping"}))
    }
}

/// Hand the first connection on `attach` to the relay's client side.
async fn bridge_attach_port(attach: TcpListener, mut client_side: DuplexStream, relay: Arc<StdioRelay>) {
    let mut socket = tokio::select! {
        accepted = attach.accept() => match accepted {
            Ok((socket, peer)) => {
                debug!(%peer, server_id = %relay.server_id(), "Client attached");
                socket
            }
            Err(e) => {
                warn!("Failed to accept attach connection: {}", e);
                if let Err(e) = relay.stop().await {
                    warn!(server_id = %relay.server_id(), "Failed to stop relay: {}", e);
                }
                return;
            }
        },
        _ = relay.wait() => return,
    };
    drop(attach);

    if let Err(e) = tokio::io::copy_bidirectional(&mut socket, &mut client_side).await {
        debug!(server_id = %relay.server_id(), "Attach bridge closed: {}", e);
    }
}

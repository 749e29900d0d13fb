//! Stdio relay
//!
//! Spawns one MCP server as a child process and forwards newline-delimited frames
//! between a client and the child's stdin/stdout. Every frame goes through the
//! processor chain; rejected frames are answered with a JSON-RPC error instead of
//! being forwarded.

use crate::error::RelayError;
use crate::logging::{ActivityEvent, ActivityKind, ActivityLogger, TracingActivityLogger};
use crate::processor::envelope::request_id;
use crate::processor::ProcessorChain;
use crate::relay::frame::{frame_reader, FrameReader, FrameWriter};
use crate::relay::message::{Direction, Message, MessageType, TransportKind};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::LinesCodecError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Time a child gets to exit after SIGTERM before it is killed
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Lifecycle of a relay. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// Everything needed to run one downstream server
pub struct StdioRelayOptions {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub chain: ProcessorChain,
    pub logger: Arc<dyn ActivityLogger>,
    pub grace_period: Duration,
}

impl StdioRelayOptions {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        let command = command.into();
        Self {
            chain: ProcessorChain::empty(command.clone()),
            command,
            args,
            env: HashMap::new(),
            logger: Arc::new(TracingActivityLogger),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_chain(mut self, chain: ProcessorChain) -> Self {
        self.chain = chain;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn ActivityLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

/// Per-frame processing shared by both forwarding loops
struct Pipeline {
    chain: ProcessorChain,
    logger: Arc<dyn ActivityLogger>,
    session_id: String,
    server_id: String,
    command: String,
    args: Vec<String>,
    /// Shared with the relay; aborts writes blocked on a peer that stopped reading
    cancel: CancellationToken,
}

pub struct StdioRelay {
    pipeline: Arc<Pipeline>,
    env: HashMap<String, String>,
    grace_period: Duration,
    state: Arc<watch::Sender<RelayState>>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl StdioRelay {
    pub fn new(options: StdioRelayOptions) -> Self {
        let session_id = format!("session_{}", Uuid::new_v4());
        let server_id = format!("stdio_{}_{}", command_label(&options.command), Uuid::new_v4());
        let (state, _) = watch::channel(RelayState::Created);
        let cancel = CancellationToken::new();

        Self {
            pipeline: Arc::new(Pipeline {
                chain: options.chain,
                logger: options.logger,
                session_id,
                server_id,
                command: options.command,
                args: options.args,
                cancel: cancel.clone(),
            }),
            env: options.env,
            grace_period: options.grace_period,
            state: Arc::new(state),
            cancel,
            supervisor: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.pipeline.session_id
    }

    pub fn server_id(&self) -> &str {
        &self.pipeline.server_id
    }

    pub fn command(&self) -> &str {
        &self.pipeline.command
    }

    pub fn args(&self) -> &[String] {
        &self.pipeline.args
    }

    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == RelayState::Running
    }

    /// Spawn the server and start forwarding between it and the given client streams.
    ///
    /// Returns as soon as the child is running; forwarding continues in background
    /// tasks until either side closes or [`stop`](Self::stop) is called.
    pub async fn start<R, W>(&self, client_reader: R, client_writer: W) -> Result<(), RelayError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let claimed = self.state.send_if_modified(|state| {
            if *state == RelayState::Created {
                *state = RelayState::Running;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(RelayError::AlreadyStarted);
        }

        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.state.send_replace(RelayState::Stopped);
                return Err(e);
            }
        };

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (Some(stdin), Some(stdout), Some(stderr)) = pipes else {
            if let Err(e) = child.kill().await {
                warn!("failed to kill server without pipes: {}", e);
            }
            self.state.send_replace(RelayState::Stopped);
            return Err(RelayError::MissingPipe("stdio"));
        };

        let pipeline = self.pipeline.clone();
        info!(
            session = %pipeline.session_id,
            server_id = %pipeline.server_id,
            pid = child.id(),
            "Started stdio relay for '{}'",
            pipeline.command
        );
        pipeline.logger.log(&ActivityEvent::system(
            ActivityKind::Start,
            &pipeline.session_id,
            &pipeline.server_id,
            TransportKind::Stdio,
            format!("started {} {}", pipeline.command, pipeline.args.join(" ")),
        ));

        let client = FrameWriter::new(client_writer);
        let server = FrameWriter::new(stdin);

        let client_to_server = tokio::spawn(forward(
            pipeline.clone(),
            Direction::ClientToServer,
            frame_reader(client_reader),
            server.clone(),
            client.clone(),
            self.cancel.clone(),
        ));
        let server_to_client = tokio::spawn(forward(
            pipeline.clone(),
            Direction::ServerToClient,
            frame_reader(stdout),
            client,
            server.clone(),
            self.cancel.clone(),
        ));
        let stderr_drain = tokio::spawn(drain_stderr(pipeline.server_id.clone(), frame_reader(stderr)));

        let state = self.state.clone();
        let grace_period = self.grace_period;
        let supervisor = tokio::spawn(async move {
            let _ = tokio::join!(client_to_server, server_to_client);
            state.send_if_modified(|s| {
                if *s == RelayState::Running {
                    *s = RelayState::Stopping;
                    true
                } else {
                    false
                }
            });

            // Dropping the last writer closes the child's stdin
            drop(server);
            terminate(&mut child, grace_period).await;
            stderr_drain.abort();

            state.send_replace(RelayState::Stopped);
            pipeline.logger.log(&ActivityEvent::system(
                ActivityKind::Stop,
                &pipeline.session_id,
                &pipeline.server_id,
                TransportKind::Stdio,
                "stopped",
            ));
            info!(session = %pipeline.session_id, "Stdio relay stopped");
        });
        *self.supervisor.lock().await = Some(supervisor);

        Ok(())
    }

    fn spawn(&self) -> Result<Child, RelayError> {
        let mut cmd = Command::new(&self.pipeline.command);
        cmd.args(&self.pipeline.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.spawn().map_err(|source| RelayError::SpawnFailed {
            command: self.pipeline.command.clone(),
            source,
        })
    }

    /// Stop forwarding and terminate the child.
    ///
    /// A relay that was never started, or has already stopped, is left as is.
    pub async fn stop(&self) -> Result<(), RelayError> {
        match self.state() {
            RelayState::Created | RelayState::Stopped => return Ok(()),
            RelayState::Running | RelayState::Stopping => {}
        }

        debug!(session = %self.pipeline.session_id, "Stopping stdio relay");
        self.state.send_if_modified(|s| {
            if *s == RelayState::Running {
                *s = RelayState::Stopping;
                true
            } else {
                false
            }
        });
        self.cancel.cancel();

        if let Some(supervisor) = self.supervisor.lock().await.take() {
            if let Err(e) = supervisor.await {
                warn!("stdio relay supervisor failed: {}", e);
                self.state.send_replace(RelayState::Stopped);
            }
        }
        self.wait().await;
        Ok(())
    }

    /// Resolve once the relay has stopped and its child has been reaped.
    ///
    /// Never resolves for a relay that was not started.
    pub async fn wait(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == RelayState::Stopped).await;
    }
}

impl Drop for StdioRelay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Short, path-free label for ids
fn command_label(command: &str) -> String {
    Path::new(command)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or(command)
        .to_string()
}

/// Forward frames from `frames` to `destination` until EOF, an I/O error, or
/// cancellation. Error envelopes for rejected requests go back to `source`.
async fn forward<R>(
    pipeline: Arc<Pipeline>,
    direction: Direction,
    mut frames: FrameReader<R>,
    destination: FrameWriter,
    source: FrameWriter,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = frames.next() => next,
        };

        let frame = match next {
            None => {
                debug!(session = %pipeline.session_id, ?direction, "Stream closed");
                break;
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                warn!(session = %pipeline.session_id, ?direction, "Dropping oversized frame");
                continue;
            }
            Some(Err(LinesCodecError::Io(e))) => {
                debug!(session = %pipeline.session_id, ?direction, "Read failed: {}", e);
                break;
            }
            Some(Ok(frame)) => frame,
        };

        if frame.trim().is_empty() {
            continue;
        }

        if let Err(e) = pipeline.handle(direction, frame, &destination, &source).await {
            debug!(session = %pipeline.session_id, ?direction, "Write failed: {}", e);
            break;
        }
    }

    cancel.cancel();
}

impl Pipeline {
    async fn handle(
        &self,
        direction: Direction,
        frame: String,
        destination: &FrameWriter,
        source: &FrameWriter,
    ) -> std::io::Result<()> {
        if !self.chain.has_processors() {
            self.write(destination, &frame).await?;
            self.log_frame(direction, 200, None);
            return Ok(());
        }

        let message = Message::classified(direction, frame, TransportKind::Stdio, &self.session_id)
            .with_command(&self.command, &self.args);

        let result = match self.chain.execute(&message).await {
            Ok(result) => result,
            Err(e) => {
                warn!(session = %self.session_id, ?direction, "Forwarding unprocessed frame: {}", e);
                self.write(destination, &message.raw).await?;
                self.log_frame(direction, 200, Some(e.to_string()));
                return Ok(());
            }
        };

        if result.is_success() {
            let frame = serde_json::to_string(&result.payload).unwrap_or(message.raw);
            self.write(destination, &frame).await?;
            self.log_frame(direction, result.status, None);
            return Ok(());
        }

        self.log_frame(direction, result.status, result.error.clone());

        let id = serde_json::from_str::<Value>(&message.raw)
            .map(|frame| request_id(&frame))
            .unwrap_or(Value::Null);
        let Some(envelope) = result.error_envelope(id) else {
            return Ok(());
        };

        match message.message_type {
            MessageType::Request => {
                info!(
                    session = %self.session_id,
                    status = result.status,
                    "Request rejected, answering sender"
                );
                self.write(source, &envelope.to_json()).await
            }
            MessageType::Response => {
                info!(
                    session = %self.session_id,
                    status = result.status,
                    "Response rejected, replacing with error"
                );
                self.write(destination, &envelope.to_json()).await
            }
            MessageType::Notification | MessageType::System => {
                warn!(
                    session = %self.session_id,
                    status = result.status,
                    "Dropping rejected notification: {}",
                    result.error.as_deref().unwrap_or_default()
                );
                Ok(())
            }
        }
    }

    /// Write one frame unless the relay is cancelled first.
    ///
    /// A peer that stops reading fills its pipe, so a pending write must not
    /// outlive the relay.
    async fn write(&self, writer: &FrameWriter, frame: &str) -> std::io::Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "relay stopping",
            )),
            written = writer.write_frame(frame) => written,
        }
    }

    fn log_frame(&self, direction: Direction, status: u16, message: Option<String>) {
        let mut event = ActivityEvent::frame(
            &self.session_id,
            &self.server_id,
            direction,
            TransportKind::Stdio,
            status,
        );
        event.message = message;
        self.logger.log(&event);
    }
}

async fn drain_stderr<R: AsyncRead + Unpin>(server_id: String, mut lines: FrameReader<R>) {
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => debug!(server_id = %server_id, "stderr: {}", line),
            Err(LinesCodecError::MaxLineLengthExceeded) => continue,
            Err(LinesCodecError::Io(_)) => break,
        }
    }
}

/// SIGTERM, wait for the grace period, then SIGKILL. The child is always reaped.
async fn terminate(child: &mut Child, grace_period: Duration) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!("Server already exited with {}", status);
            return;
        }
        Ok(None) => {}
        Err(e) => warn!("failed to poll server status: {}", e),
    }

    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            debug!("failed to send SIGTERM to {}: {}", pid, e);
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => debug!("Server exited with {}", status),
        Ok(Err(e)) => warn!("failed to wait for server: {}", e),
        Err(_) => {
            warn!(
                "Server did not exit within {}s, killing",
                grace_period.as_secs()
            );
            if let Err(e) = child.kill().await {
                warn!("failed to kill server: {}", e);
            }
        }
    }
}

use crate::config::DEFAULT_DAEMON_PORT;
use crate::daemon::protocol::{DaemonRequest, DaemonResponse};
use crate::error::DaemonError;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// Upper bound on one request/response exchange
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// A relay started by the daemon
#[derive(Debug, Clone, PartialEq)]
pub struct StdioSession {
    pub server_id: String,
    /// Loopback port the relay's client side is reachable on
    pub port: u16,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DaemonClient {
    port: u16,
    timeout: Duration,
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new(DEFAULT_DAEMON_PORT)
    }
}

impl DaemonClient {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send one request and read the daemon's answer.
    ///
    /// A `success: false` answer is returned as is; only transport and decoding
    /// problems are errors.
    pub async fn send(&self, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| DaemonError::Timeout(self.timeout))?
    }

    async fn exchange(&self, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
        let mut stream = TcpStream::connect(("127.0.0.1", self.port))
            .await
            .map_err(|e| DaemonError::Connect {
                port: self.port,
                reason: e.to_string(),
            })?;

        let mut line = serde_json::to_string(request)
            .map_err(|e| DaemonError::Protocol(format!("failed to encode request: {}", e)))?;
        line.push('\n');
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| DaemonError::Protocol(format!("failed to send request: {}", e)))?;

        let mut reader = BufReader::new(stream);
        let mut response = String::new();
        let read = reader
            .read_line(&mut response)
            .await
            .map_err(|e| DaemonError::Protocol(format!("failed to read response: {}", e)))?;
        if read == 0 {
            return Err(DaemonError::Protocol(
                "daemon closed the connection without responding".to_string(),
            ));
        }

        serde_json::from_str(&response)
            .map_err(|e| DaemonError::Protocol(format!("failed to decode response: {}", e)))
    }

    /// Ask the daemon to start a stdio relay for `command`.
    pub async fn start_stdio(
        &self,
        command: &str,
        args: &[String],
        metadata: HashMap<String, String>,
    ) -> Result<StdioSession, DaemonError> {
        let request = DaemonRequest::stdio(command, args.to_vec()).with_metadata(metadata);
        let response = accepted(self.send(&request).await?)?;

        let server_id = response
            .server_id
            .ok_or_else(|| DaemonError::Protocol("response is missing server_id".to_string()))?;
        let port = response
            .port
            .ok_or_else(|| DaemonError::Protocol("response is missing port".to_string()))?;
        let session_id = response
            .data
            .as_ref()
            .and_then(|data| data.get("session_id"))
            .and_then(|id| id.as_str())
            .map(str::to_string);

        debug!(server_id = %server_id, port, "Daemon started relay");
        Ok(StdioSession {
            server_id,
            port,
            session_id,
        })
    }

    pub async fn status(&self) -> Result<DaemonResponse, DaemonError> {
        accepted(self.send(&DaemonRequest::status()).await?)
    }

    pub async fn stop(&self) -> Result<DaemonResponse, DaemonError> {
        accepted(self.send(&DaemonRequest::stop()).await?)
    }
}

fn accepted(response: DaemonResponse) -> Result<DaemonResponse, DaemonError> {
    if response.success {
        Ok(response)
    } else {
        Err(DaemonError::Rejected(
            response.error.unwrap_or_else(|| "unknown error".to_string()),
        ))
    }
}

/// Whether something accepts connections on the daemon port
pub async fn is_daemon_running(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Pipe local streams to a relay's attach port until the relay closes its side.
///
/// When `reader` hits EOF the write half of the connection is shut down and the
/// remaining output is still drained into `writer`.
pub async fn attach<R, W>(port: u16, mut reader: R, mut writer: W) -> Result<(), DaemonError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|e| DaemonError::Connect {
            port,
            reason: e.to_string(),
        })?;
    let (mut socket_reader, mut socket_writer) = stream.into_split();

    let upstream = async {
        let copied = tokio::io::copy(&mut reader, &mut socket_writer).await;
        let _ = socket_writer.shutdown().await;
        copied
    };
    let downstream = async {
        let copied = tokio::io::copy(&mut socket_reader, &mut writer).await;
        let _ = writer.flush().await;
        copied
    };
    tokio::pin!(upstream, downstream);

    let mut upstream_done = false;
    loop {
        tokio::select! {
            copied = &mut upstream, if !upstream_done => {
                upstream_done = true;
                if let Err(e) = copied {
                    debug!("Local input closed with error: {}", e);
                }
            }
            copied = &mut downstream => {
                return copied
                    .map(|_| ())
                    .map_err(|e| DaemonError::Protocol(format!("relay connection failed: {}", e)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_failure() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!is_daemon_running(port).await);
        let err = DaemonClient::new(port).status().await.unwrap_err();
        assert!(matches!(err, DaemonError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_silent_daemon_times_out() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let client = DaemonClient::new(port).with_timeout(Duration::from_millis(100));
        let err = client.status().await.unwrap_err();
        assert!(matches!(err, DaemonError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_failure_response_is_rejected() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut line = String::new();
            let (read, mut write) = socket.split();
            BufReader::new(read).read_line(&mut line).await.unwrap();
            write
                .write_all(b"{\"success\":false,\"error\":\"nope\"}\n")
                .await
                .unwrap();
        });

        let err = DaemonClient::new(port).stop().await.unwrap_err();
        assert!(matches!(err, DaemonError::Rejected(msg) if msg == "nope"));
    }

    #[tokio::test]
    async fn test_attach_drains_after_input_eof() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.split();
            let mut lines = BufReader::new(read).lines();
            while let Some(line) = lines.next_line().await.unwrap() {
                write.write_all(format!("{}!\n", line).as_bytes()).await.unwrap();
            }
        });

        let mut output = Vec::new();
        attach(port, &b"one\ntwo\n"[..], &mut output).await.unwrap();
        assert_eq!(String::from_utf8(output).unwrap(), "one!\ntwo!\n");
    }
}

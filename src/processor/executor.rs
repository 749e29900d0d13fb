//! External command processors
//!
//! Each invocation spawns the configured command, writes one [`ProcessorInput`]
//! document to its stdin, and reads one [`ProcessorOutput`] document back from
//! stdout, all under the processor's deadline.

use crate::processor::config::{ProcessorConfig, MAX_TIMEOUT_SECS};
use crate::processor::schema::{ProcessorError, ProcessorInput, ProcessorOutput};
use crate::processor::Processor;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn, Instrument};

/// Directory processors run in when none is configured: the user's home.
pub fn default_working_dir() -> PathBuf {
    dirs::home_dir()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Processor backed by an external program
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    name: String,
    enabled: bool,
    command: String,
    args: Vec<String>,
    timeout: Duration,
    working_dir: PathBuf,
}

impl CommandProcessor {
    pub fn from_config(
        config: &ProcessorConfig,
        working_dir: PathBuf,
    ) -> Result<Self, ProcessorError> {
        let (command, args) = config.command_and_args()?;
        Ok(Self {
            name: config.name.clone(),
            enabled: config.enabled,
            command,
            args,
            timeout: config.timeout_duration(),
            working_dir,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn execution_failed(&self, input: &ProcessorInput, cause: &str, stderr: &[u8]) -> ProcessorOutput {
        let mut message = format!("processor '{}' execution failed: {}", self.name, cause);
        if !stderr.is_empty() {
            message.push_str("\nstderr: ");
            message.push_str(String::from_utf8_lossy(stderr).trim_end());
        }
        ProcessorOutput::internal_error(input.payload.clone(), message)
    }

    fn timed_out(&self, input: &ProcessorInput) -> ProcessorOutput {
        ProcessorOutput::internal_error(
            input.payload.clone(),
            format!(
                "processor '{}' timed out after {} seconds",
                self.name,
                self.timeout.as_secs()
            ),
        )
    }

    async fn execute(&self, input: &ProcessorInput, stdin_bytes: Vec<u8>) -> ProcessorOutput {
        let now = Instant::now();
        let deadline = now
            .checked_add(self.timeout)
            .unwrap_or(now + Duration::from_secs(MAX_TIMEOUT_SECS));

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return self.execution_failed(input, &e.to_string(), b""),
        };

        // stdin is written while stdout/stderr drain so large documents cannot
        // deadlock on a full pipe
        let stdin = child.stdin.take();
        let writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(&stdin_bytes).await {
                    debug!("processor closed stdin early: {}", e);
                }
            }
        });
        let stdout_reader = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr_reader = tokio::spawn(read_pipe(child.stderr.take()));

        let status: ExitStatus = match timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                writer.abort();
                stdout_reader.abort();
                stderr_reader.abort();
                return self.execution_failed(input, &e.to_string(), b"");
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("failed to kill timed out processor: {}", e);
                }
                writer.abort();
                stdout_reader.abort();
                stderr_reader.abort();
                return self.timed_out(input);
            }
        };

        // A grandchild may still hold the pipes open; the deadline bounds that too
        let (stdout, stderr) = match timeout_at(deadline, async {
            let stdout = stdout_reader.await.unwrap_or_default();
            let stderr = stderr_reader.await.unwrap_or_default();
            (stdout, stderr)
        })
        .await
        {
            Ok(pipes) => pipes,
            Err(_) => return self.timed_out(input),
        };

        if !status.success() {
            return self.execution_failed(input, &status.to_string(), &stderr);
        }

        ProcessorOutput::from_stdout(&self.name, input, &stdout)
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buffer = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buffer).await {
            debug!("failed to read processor pipe: {}", e);
        }
    }
    buffer
}

#[async_trait]
impl Processor for CommandProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn run(&self, input: &ProcessorInput) -> Result<ProcessorOutput, ProcessorError> {
        if !self.enabled {
            return Err(ProcessorError::Disabled {
                name: self.name.clone(),
            });
        }

        let stdin_bytes = input.to_json()?;
        let input_size = stdin_bytes.len();
        let start = std::time::Instant::now();

        let span = tracing::info_span!(
            "processor_execution",
            processor = %self.name,
            server = %input.connection.server_name,
            session = %input.connection.session_id,
            message_type = ?input.message_type,
        );

        let output = self.execute(input, stdin_bytes).instrument(span.clone()).await;

        span.in_scope(|| {
            let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
            if output.status >= 500 {
                warn!(
                    duration_ms,
                    input_size_bytes = input_size,
                    status = output.status,
                    error = output.error.as_deref().unwrap_or_default(),
                    "Processor execution failed"
                );
            } else {
                info!(
                    duration_ms,
                    input_size_bytes = input_size,
                    status = output.status,
                    has_metadata = output.metadata.is_some(),
                    "Processor execution finished"
                );
            }
        });

        Ok(output)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::processor::schema::{ConnectionContext, ProcessorMetadata};
    use crate::relay::message::{MessageType, TransportKind};
    use serde_json::{json, Value};
    use std::path::Path;
    use tempfile::TempDir;

    fn input(payload: Value) -> ProcessorInput {
        ProcessorInput {
            message_type: MessageType::Request,
            timestamp: "2025-10-10T12:00:00Z".to_string(),
            connection: ConnectionContext {
                server_name: "test-server".to_string(),
                transport: TransportKind::Stdio,
                session_id: "session_test".to_string(),
            },
            payload: payload.clone(),
            metadata: ProcessorMetadata {
                processor_chain: vec![],
                original_payload: payload,
            },
        }
    }

    /// Write a shell processor into `dir` and return a processor running it
    fn script(dir: &TempDir, name: &str, body: &str) -> ProcessorConfig {
        let path = dir.path().join(format!("{name}.sh"));
        std::fs::write(&path, body).expect("Failed to write processor script");
        ProcessorConfig::cli(name, "sh", &[path.to_str().unwrap()])
    }

    fn build(config: &ProcessorConfig) -> CommandProcessor {
        CommandProcessor::from_config(config, default_working_dir()).unwrap()
    }

    #[tokio::test]
    async fn test_passthrough_processor() {
        let dir = TempDir::new().unwrap();
        let config = script(
            &dir,
            "passthrough",
            "cat > /dev/null\necho '{\"status\":200,\"error\":null,\"metadata\":{\"processor_name\":\"passthrough\"}}'\n",
        );

        let payload = json!({"method": "tools/list"});
        let output = build(&config).run(&input(payload.clone())).await.unwrap();

        assert_eq!(output.status, 200);
        assert_eq!(output.payload, payload);
        assert_eq!(output.metadata.unwrap()["processor_name"], "passthrough");
    }

    #[tokio::test]
    async fn test_processor_receives_input_document() {
        let dir = TempDir::new().unwrap();
        // Echo the whole input back as the payload
        let config = script(
            &dir,
            "mirror",
            "input=$(cat)\nprintf '{\"status\":200,\"payload\":%s}' \"$input\"\n",
        );

        let output = build(&config)
            .run(&input(json!({"method": "tools/call"})))
            .await
            .unwrap();

        assert_eq!(output.payload["type"], "request");
        assert_eq!(output.payload["connection"]["server_name"], "test-server");
        assert_eq!(output.payload["payload"]["method"], "tools/call");
    }

    #[tokio::test]
    async fn test_timeout_kills_processor() {
        let dir = TempDir::new().unwrap();
        let config = script(&dir, "slow", "sleep 10\n").with_timeout(1);
        let payload = json!({"method": "tools/list", "id": 3});

        let start = std::time::Instant::now();
        let output = build(&config).run(&input(payload.clone())).await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(output.status, 500);
        assert_eq!(output.payload, payload);
        assert_eq!(
            output.error.as_deref(),
            Some("processor 'slow' timed out after 1 seconds")
        );
    }

    #[tokio::test]
    async fn test_non_zero_exit_includes_stderr() {
        let dir = TempDir::new().unwrap();
        let config = script(&dir, "crashing", "cat > /dev/null\necho boom >&2\nexit 3\n");
        let payload = json!({"method": "ping"});

        let output = build(&config).run(&input(payload.clone())).await.unwrap();

        assert_eq!(output.status, 500);
        assert_eq!(output.payload, payload);
        let error = output.error.unwrap();
        assert!(error.starts_with("processor 'crashing' execution failed"));
        assert!(error.contains("stderr: boom"));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_synthesized() {
        let config = ProcessorConfig::cli("missing", "/definitely/not/a/binary", &[]);
        let payload = json!({"method": "ping"});

        let output = build(&config).run(&input(payload.clone())).await.unwrap();

        assert_eq!(output.status, 500);
        assert_eq!(output.payload, payload);
        assert!(output
            .error
            .unwrap()
            .starts_with("processor 'missing' execution failed"));
    }

    #[tokio::test]
    async fn test_invalid_status_code() {
        let dir = TempDir::new().unwrap();
        let config = script(
            &dir,
            "bad-status",
            "cat > /dev/null\necho '{\"status\":999,\"payload\":{}}'\n",
        );
        let payload = json!({"method": "ping"});

        let output = build(&config).run(&input(payload.clone())).await.unwrap();

        assert_eq!(output.status, 500);
        assert_eq!(output.payload, payload);
        assert!(output.error.unwrap().contains("invalid status code: 999"));
    }

    #[tokio::test]
    async fn test_validator_rejects_delete() {
        let dir = TempDir::new().unwrap();
        let config = script(&dir, "validator", VALIDATOR);

        let output = build(&config)
            .run(&input(json!({"method": "files/delete"})))
            .await
            .unwrap();

        assert_eq!(output.status, 403);
        assert_eq!(output.payload, json!({}));
        assert_eq!(output.error.as_deref(), Some("Delete operations not allowed"));
    }

    #[tokio::test]
    async fn test_disabled_processor_is_not_spawned() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("ran");
        let config = script(
            &dir,
            "disabled",
            &format!("touch {}\necho '{{\"status\":200}}'\n", marker.display()),
        )
        .disabled();

        let err = build(&config).run(&input(json!({}))).await.unwrap_err();

        assert!(matches!(err, ProcessorError::Disabled { .. }));
        assert!(!Path::new(&marker).exists());
    }

    #[tokio::test]
    async fn test_unsupported_kind_fails_before_spawn() {
        let mut config = ProcessorConfig::cli("hook", "true", &[]);
        config.kind = "webhook".to_string();
        assert!(matches!(
            config.build(&default_working_dir()),
            Err(ProcessorError::UnsupportedKind { .. })
        ));
    }

    const VALIDATOR: &str = r#"input=$(cat)
if printf '%s' "$input" | grep -q '"method":"[^"]*delete'; then
  echo '{"status":403,"payload":{},"error":"Delete operations not allowed"}'
else
  echo '{"status":200,"error":null}'
fi
"#;
}

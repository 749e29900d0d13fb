use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use mcp_relay::commands;
use mcp_relay::config::{self, GlobalConfig};
use mcp_relay::daemon::{self, Daemon, DaemonClient};
use mcp_relay::error::DaemonError;
use mcp_relay::logging::init_tracing;
use mcp_relay::processor::{default_working_dir, ProcessorChain};
use mcp_relay::relay::{HttpRelay, StdioRelay, StdioRelayOptions};

#[derive(Parser, Debug)]
#[command(name = "mcp-relay", version)]
#[command(about = "Relay MCP traffic through a chain of external processors", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (JSON/TOML/YAML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Relay one stdio MCP server
    Stdio {
        /// Server command; defaults to the configured server named by --server-name
        #[arg(long)]
        cmd: Option<String>,

        /// Name used for processor selection and in processor input
        #[arg(long)]
        server_name: Option<String>,

        /// Run the relay inside the background daemon
        #[arg(long)]
        daemon: bool,

        /// Arguments passed to the server command
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Serve every configured HTTP server under /mcp/<gateway>/<server>
    Server,
    /// Manage the background daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
    /// Validate the configuration
    Check {
        /// Run each processor chain once against a ping request
        #[arg(long)]
        processors: bool,
    },
}

#[derive(Debug, Subcommand)]
enum DaemonAction {
    Start,
    Stop,
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = load_config(&args).await?;
    let _log_guard = init_tracing(
        args.debug,
        Some(config.proxy.log_level.as_str()),
        config.proxy.log_file.as_deref(),
    )
    .context("failed to initialise logging")?;

    match args.command {
        Command::Stdio {
            cmd,
            server_name,
            daemon,
            args,
        } => run_stdio(config, cmd, server_name, args, daemon).await,
        Command::Server => run_server(config).await,
        Command::Daemon { action } => run_daemon(config, action).await,
        Command::Check { processors } => {
            commands::run_config_check(&config, processors).await?;
            Ok(())
        }
    }
}

/// `-c` must exist; otherwise the default file is used when present.
///
/// `server` and `check` need a real configuration; the stdio and daemon modes fall
/// back to an empty one.
async fn load_config(args: &Args) -> anyhow::Result<GlobalConfig> {
    if let Some(path) = &args.config {
        return config::load_from_path(path)
            .await
            .with_context(|| format!("failed to load configuration from {}", path.display()));
    }

    let path = config::default_config_path();
    if path.exists() {
        return config::load_default()
            .await
            .with_context(|| format!("failed to load configuration from {}", path.display()));
    }

    match args.command {
        Command::Server | Command::Check { .. } => {
            bail!("no configuration file found at {}", path.display())
        }
        _ => Ok(GlobalConfig::default()),
    }
}

async fn run_stdio(
    config: GlobalConfig,
    cmd: Option<String>,
    server_name: Option<String>,
    mut args: Vec<String>,
    use_daemon: bool,
) -> anyhow::Result<()> {
    let configured = server_name
        .as_deref()
        .and_then(|name| config.find_server(name))
        .filter(|(_, server)| server.is_stdio());

    let command = match (cmd, configured) {
        (Some(cmd), _) => cmd,
        (None, Some((_, server))) => {
            if args.is_empty() {
                args = server.args.clone();
            }
            server.command.clone().unwrap_or_default()
        }
        (None, None) => bail!("--cmd is required unless --server-name names a configured stdio server"),
    };
    let server_name = server_name.unwrap_or_else(|| command.clone());

    if use_daemon {
        let port = config.daemon.port;
        if !daemon::is_daemon_running(port).await {
            bail!("daemon is not running on port {port}; start it with `mcp-relay daemon start`");
        }
        let metadata = HashMap::from([("server_name".to_string(), server_name)]);
        let session = DaemonClient::new(port)
            .start_stdio(&command, &args, metadata)
            .await?;
        info!(server_id = %session.server_id, "Attached to daemon relay");
        daemon::attach(session.port, tokio::io::stdin(), tokio::io::stdout()).await?;
        return Ok(());
    }

    let (processors, env) = match configured {
        Some((gateway, server)) => (config.processors_for_gateway(gateway), server.env.clone()),
        None => (config.processors.clone(), HashMap::new()),
    };
    let chain = ProcessorChain::from_configs(&processors, &server_name, &default_working_dir())?;

    let relay = StdioRelay::new(
        StdioRelayOptions::new(command, args)
            .with_env(env)
            .with_chain(chain),
    );
    relay.start(tokio::io::stdin(), tokio::io::stdout()).await?;

    tokio::select! {
        _ = relay.wait() => {}
        _ = shutdown_signal() => {
            relay.stop().await?;
        }
    }
    Ok(())
}

async fn run_server(config: GlobalConfig) -> anyhow::Result<()> {
    config::validate_for_server(&config)?;
    let relay = HttpRelay::from_config(&config)?;
    info!(
        "Serving {} endpoint(s) on {}:{}",
        relay.endpoints().len(),
        config.proxy.host,
        config.proxy.port
    );
    relay.run(shutdown_signal()).await?;
    Ok(())
}

async fn run_daemon(config: GlobalConfig, action: DaemonAction) -> anyhow::Result<()> {
    let port = config.daemon.port;
    match action {
        DaemonAction::Start => {
            let daemon = match Daemon::bind(port, config).await {
                Ok(daemon) => daemon,
                Err(DaemonError::AlreadyRunning { port }) => {
                    bail!("daemon already running on port {port}")
                }
                Err(e) => return Err(e.into()),
            };

            let signalled = Arc::clone(&daemon);
            tokio::spawn(async move {
                shutdown_signal().await;
                signalled.shutdown().await;
            });

            daemon.run().await?;
            Ok(())
        }
        DaemonAction::Stop => {
            if !daemon::is_daemon_running(port).await {
                warn!("No daemon running on port {}", port);
                return Ok(());
            }
            DaemonClient::new(port).stop().await?;
            println!("daemon stopping");
            Ok(())
        }
        DaemonAction::Status => {
            if !daemon::is_daemon_running(port).await {
                println!("daemon is not running");
                return Ok(());
            }
            let response = DaemonClient::new(port).status().await?;
            let data = response.data.unwrap_or_default();
            println!("{}", serde_json::to_string_pretty(&data)?);
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}

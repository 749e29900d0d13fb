use crate::config::GlobalConfig;
use crate::error::{ConfigError, ProxyError, Result};
use crate::processor::{default_working_dir, ProcessorChain};
use crate::relay::{Direction, Message, TransportKind};
use tracing::{error, info};

/// Frame sent through each chain by `check --processors`
const PROBE_FRAME: &str = r#"{"jsonrpc":"2.0","id":"mcp-relay-check","method":"ping"}"#;

/// Validate the configuration and print what would be served.
///
/// With `run_processors`, every gateway's chain is run once against a `ping`
/// request; a chain that rejects or fails makes the check fail.
pub async fn run_config_check(config: &GlobalConfig, run_processors: bool) -> Result<()> {
    info!("Checking configuration...");
    crate::config::validate(config)?;
    info!("✓ Configuration is valid");

    info!(
        "{} global processor(s), {} gateway(s)",
        config.processors.len(),
        config.gateways.len()
    );
    for (gateway, server_name, server) in config.servers() {
        let target = match (&server.url, &server.command) {
            (Some(url), _) => url.clone(),
            (None, Some(command)) => format!("{} {}", command, server.args.join(" ")),
            (None, None) => String::new(),
        };
        let state = if server.enabled { "" } else { " (disabled)" };
        info!("  /mcp/{}/{} -> {}{}", gateway, server_name, target.trim_end(), state);
    }

    if !run_processors {
        return Ok(());
    }

    let mut all_ok = true;
    let mut chains = vec![("global".to_string(), config.processors.clone())];
    chains.extend(
        config
            .gateways
            .keys()
            .map(|gateway| (gateway.clone(), config.processors_for_gateway(gateway))),
    );

    for (label, processors) in chains {
        if processors.is_empty() {
            continue;
        }
        let chain = ProcessorChain::from_configs(&processors, &label, &default_working_dir())?;
        let message = Message::classified(
            Direction::ClientToServer,
            PROBE_FRAME,
            TransportKind::Stdio,
            "check",
        );
        match chain.execute(&message).await {
            Ok(result) if result.is_success() => {
                info!("  ✓ {} chain passed [{}]", label, result.processor_chain.join(" -> "));
            }
            Ok(result) => {
                error!(
                    "  ✗ {} chain returned {}: {}",
                    label,
                    result.status,
                    result.error.unwrap_or_default()
                );
                all_ok = false;
            }
            Err(e) => {
                error!("  ✗ {} chain failed: {}", label, e);
                all_ok = false;
            }
        }
    }

    if all_ok {
        info!("✓ All checks passed");
        Ok(())
    } else {
        Err(ProxyError::Config(ConfigError::Validation(
            "one or more processor chains failed".to_string(),
        )))
    }
}

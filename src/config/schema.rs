use crate::processor::ProcessorConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Control port the daemon listens on when none is configured
pub const DEFAULT_DAEMON_PORT: u16 = 8338;

/// Root configuration, stored at `~/.mcp-relay/config.json` by default
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Schema version; required
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub daemon: DaemonSettings,
    /// HTTP gateways, each grouping servers under `/mcp/<gateway>/...`
    #[serde(default)]
    pub gateways: BTreeMap<String, GatewayConfig>,
    /// Processors applied to every server
    #[serde(default)]
    pub processors: Vec<ProcessorConfig>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
    #[serde(default = "default_proxy_host")]
    pub host: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    /// debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Downstream request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSettings {
    #[serde(default = "default_daemon_port")]
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
    /// Processors applied after the global ones for this gateway's servers
    #[serde(default)]
    pub processors: Vec<ProcessorConfig>,
}

/// One downstream MCP server: either a command (stdio) or a URL (HTTP)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Sent to the downstream; values support `${VAR}`, `${VAR:-default}` and `$VAR`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_name() -> String {
    "MCP Relay".to_string()
}

fn default_proxy_host() -> String {
    "127.0.0.1".to_string()
}

fn default_proxy_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_daemon_port() -> u16 {
    DEFAULT_DAEMON_PORT
}

fn default_enabled() -> bool {
    true
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            version: "1.0.0".to_string(),
            proxy: ProxySettings::default(),
            daemon: DaemonSettings::default(),
            gateways: BTreeMap::new(),
            processors: Vec::new(),
            metadata: Map::new(),
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: default_proxy_host(),
            port: default_proxy_port(),
            log_level: default_log_level(),
            log_file: None,
            timeout: default_request_timeout(),
        }
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            port: default_daemon_port(),
        }
    }
}

impl ProxySettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(if self.timeout == 0 {
            default_request_timeout()
        } else {
            self.timeout
        })
    }
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
            headers: BTreeMap::new(),
            enabled: default_enabled(),
            description: None,
        }
    }
}

impl McpServerConfig {
    pub fn is_http(&self) -> bool {
        self.url.as_deref().is_some_and(|url| !url.is_empty())
    }

    pub fn is_stdio(&self) -> bool {
        self.command.as_deref().is_some_and(|cmd| !cmd.is_empty())
    }
}

impl GlobalConfig {
    /// Every `(gateway, server)` pair, in name order
    pub fn servers(&self) -> impl Iterator<Item = (&str, &str, &McpServerConfig)> {
        self.gateways.iter().flat_map(|(gateway_name, gateway)| {
            gateway
                .mcp_servers
                .iter()
                .map(move |(name, server)| (gateway_name.as_str(), name.as_str(), server))
        })
    }

    /// Look a server up by name across all gateways
    pub fn find_server(&self, name: &str) -> Option<(&str, &McpServerConfig)> {
        self.servers()
            .find(|(_, server_name, _)| *server_name == name)
            .map(|(gateway, _, server)| (gateway, server))
    }

    /// Global processors followed by the gateway's own
    pub fn processors_for_gateway(&self, gateway: &str) -> Vec<ProcessorConfig> {
        let mut processors = self.processors.clone();
        if let Some(gateway) = self.gateways.get(gateway) {
            processors.extend(gateway.processors.iter().cloned());
        }
        processors
    }
}

use super::schema::{GatewayConfig, GlobalConfig, McpServerConfig};
use crate::error::{ConfigError, Result};
use crate::processor::validate_processors;
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variables with this prefix override file settings
pub const ENV_PREFIX: &str = "MCP_RELAY_";

/// `~/.mcp-relay`
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-relay")
}

/// `~/.mcp-relay/config.json`
pub fn default_config_path() -> PathBuf {
    config_dir().join("config.json")
}

pub async fn load_default() -> Result<GlobalConfig> {
    load_from_path(default_config_path()).await
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<GlobalConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::NotFound(path.display().to_string()).into());
    }

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .json, .toml, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    let config: GlobalConfig = figment
        .merge(Env::prefixed(ENV_PREFIX).split("_"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    Ok(config)
}

/// Schema validation. An empty gateway map is allowed here; see
/// [`validate_for_server`] for what the HTTP relay additionally needs.
pub fn validate(config: &GlobalConfig) -> Result<()> {
    if config.version.is_empty() {
        return Err(ConfigError::MissingField("version".into()).into());
    }

    for (name, gateway) in &config.gateways {
        validate_gateway(name, gateway)?;
        for (server_name, server) in &gateway.mcp_servers {
            validate_server(server_name, server)?;
        }
    }

    validate_processors(&config.processors)
        .map_err(|e| ConfigError::Validation(e.to_string()))?;

    Ok(())
}

/// Operational validation before serving HTTP
pub fn validate_for_server(config: &GlobalConfig) -> Result<()> {
    validate(config)?;
    if config.gateways.is_empty() {
        return Err(ConfigError::Validation(
            "no gateways configured. Add at least one gateway with HTTP MCP servers".into(),
        )
        .into());
    }
    Ok(())
}

fn is_url_safe(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn validate_gateway(name: &str, gateway: &GatewayConfig) -> Result<()> {
    if !is_url_safe(name) {
        return Err(ConfigError::Validation(format!(
            "gateway '{name}': name must be URL-safe (alphanumeric, dash, underscore only)"
        ))
        .into());
    }
    if gateway.mcp_servers.is_empty() {
        return Err(ConfigError::Validation(format!(
            "gateway '{name}': must have at least one MCP server"
        ))
        .into());
    }
    validate_processors(&gateway.processors)
        .map_err(|e| ConfigError::Validation(format!("gateway '{name}': {e}")))?;
    Ok(())
}

fn validate_server(name: &str, server: &McpServerConfig) -> Result<()> {
    let invalid = |reason: String| ConfigError::Validation(format!("server '{name}': {reason}"));

    if !is_url_safe(name) {
        return Err(invalid(
            "name must be URL-safe (alphanumeric, dash, underscore only)".into(),
        )
        .into());
    }

    match (server.is_stdio(), server.is_http()) {
        (false, false) => {
            return Err(invalid(
                "must specify either 'command' (stdio transport) or 'url' (http transport)".into(),
            )
            .into())
        }
        (true, true) => {
            return Err(invalid(
                "cannot specify both 'command' and 'url' - choose either stdio or http transport"
                    .into(),
            )
            .into())
        }
        _ => {}
    }

    if let Some(raw) = server.url.as_deref().filter(|u| !u.is_empty()) {
        let valid = url::Url::parse(raw)
            .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
            .unwrap_or(false);
        if !valid {
            return Err(invalid(
                "invalid URL format - must be a valid http:// or https:// URL".into(),
            )
            .into());
        }
    }

    for (key, value) in &server.headers {
        if key.is_empty() {
            return Err(invalid("header keys cannot be empty".into()).into());
        }
        if value.is_empty() {
            return Err(invalid(format!("header '{key}' has empty value")).into());
        }
    }

    Ok(())
}

/// Expand `${VAR}`, `${VAR:-default}` and `$VAR` references.
///
/// A variable that is unset and has no default is an error.
pub fn substitute_env_vars(input: &str) -> std::result::Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}]+)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let mut result = String::with_capacity(input.len());
    let mut last = 0;
    for cap in re.captures_iter(input) {
        let Some(whole) = cap.get(0) else { continue };
        result.push_str(&input[last..whole.start()]);
        last = whole.end();

        let expr = cap
            .get(1)
            .or_else(|| cap.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        let value = match expr.split_once(":-") {
            Some((name, default)) => std::env::var(name).unwrap_or_else(|_| default.to_string()),
            None => std::env::var(expr).map_err(|_| {
                ConfigError::EnvVar(format!("Environment variable '{expr}' not found"))
            })?,
        };
        result.push_str(&value);
    }
    result.push_str(&input[last..]);

    Ok(result)
}

/// Configured headers of an HTTP server with environment references expanded
pub fn substituted_headers(
    server: &McpServerConfig,
) -> std::result::Result<BTreeMap<String, String>, ConfigError> {
    server
        .headers
        .iter()
        .map(|(key, value)| Ok((key.clone(), substitute_env_vars(value)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;
    use crate::processor::ProcessorConfig;
    use std::io::Write;

    fn http_server(url: &str) -> McpServerConfig {
        McpServerConfig {
            url: Some(url.to_string()),
            ..Default::default()
        }
    }

    fn config_with_server(name: &str, server: McpServerConfig) -> GlobalConfig {
        let mut gateway = GatewayConfig::default();
        gateway.mcp_servers.insert(name.to_string(), server);
        let mut config = GlobalConfig::default();
        config.gateways.insert("main".to_string(), gateway);
        config
    }

    fn validation_message(config: &GlobalConfig) -> String {
        match validate(config) {
            Err(ProxyError::Config(e)) => e.to_string(),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("MCP_RELAY_TEST_TOKEN", "abc123");

        assert_eq!(
            substitute_env_vars("Bearer ${MCP_RELAY_TEST_TOKEN}").unwrap(),
            "Bearer abc123"
        );
        assert_eq!(
            substitute_env_vars("$MCP_RELAY_TEST_TOKEN-suffix").unwrap(),
            "abc123-suffix"
        );
        assert_eq!(
            substitute_env_vars("${MCP_RELAY_TEST_MISSING:-fallback}").unwrap(),
            "fallback"
        );
        assert_eq!(substitute_env_vars("no references").unwrap(), "no references");

        std::env::remove_var("MCP_RELAY_TEST_TOKEN");
    }

    #[test]
    fn test_missing_env_var_is_error() {
        let err = substitute_env_vars("${MCP_RELAY_TEST_UNSET_VAR}").unwrap_err();
        assert!(matches!(err, ConfigError::EnvVar(_)));
    }

    #[test]
    fn test_server_needs_exactly_one_transport() {
        let config = config_with_server("empty", McpServerConfig::default());
        assert!(validation_message(&config).contains("must specify either 'command'"));

        let both = McpServerConfig {
            command: Some("npx".into()),
            url: Some("https://example.com/mcp".into()),
            ..Default::default()
        };
        let config = config_with_server("both", both);
        assert!(validation_message(&config).contains("cannot specify both"));
    }

    #[test]
    fn test_url_and_name_rules() {
        let config = config_with_server("files", http_server("ftp://example.com"));
        assert!(validation_message(&config).contains("invalid URL format"));

        let config = config_with_server("bad name", http_server("https://example.com"));
        assert!(validation_message(&config).contains("URL-safe"));

        let config = config_with_server("ok-name_1", http_server("https://example.com/mcp"));
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_empty_header_value_rejected() {
        let mut server = http_server("https://example.com/mcp");
        server.headers.insert("X-Key".into(), String::new());
        let config = config_with_server("api", server);
        assert!(validation_message(&config).contains("header 'X-Key' has empty value"));
    }

    #[test]
    fn test_version_required() {
        let config = GlobalConfig {
            version: String::new(),
            ..Default::default()
        };
        assert!(validation_message(&config).contains("version"));
    }

    #[test]
    fn test_unsupported_processor_kind_is_load_error() {
        let mut processor = ProcessorConfig::cli("hook", "true", &[]);
        processor.kind = "webhook".to_string();
        let config = GlobalConfig {
            processors: vec![processor],
            ..Default::default()
        };
        assert!(validation_message(&config).contains("unsupported processor type 'webhook'"));
    }

    #[test]
    fn test_server_validation_requires_gateway() {
        assert!(validate_for_server(&GlobalConfig::default()).is_err());
        let config = config_with_server("api", http_server("http://localhost:3000/mcp"));
        assert!(validate_for_server(&config).is_ok());
    }

    #[tokio::test]
    async fn test_load_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{
                "version": "1.0.0",
                "proxy": {{"port": 8181}},
                "gateways": {{"main": {{"mcpServers": {{"api": {{"url": "http://localhost:3000/mcp"}}}}}}}},
                "processors": [{{"name": "p", "type": "cli", "config": {{"command": "cat"}}}}]
            }}"#
        )
        .unwrap();

        let config = load_from_path(file.path()).await.unwrap();
        assert_eq!(config.proxy.port, 8181);
        assert_eq!(config.processors.len(), 1);
        assert!(config.find_server("api").is_some());
    }

    #[tokio::test]
    async fn test_load_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
version = "1.0.0"

[daemon]
port = 9338

[gateways.main.mcpServers.api]
url = "http://localhost:3000/mcp"
"#
        )
        .unwrap();

        let config = load_from_path(file.path()).await.unwrap();
        assert_eq!(config.daemon.port, 9338);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let err = load_from_path("/definitely/not/here.json").await.unwrap_err();
        assert!(matches!(err, ProxyError::Config(ConfigError::NotFound(_))));
    }
}

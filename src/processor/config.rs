//! Processor configuration types and validation

use crate::processor::executor::CommandProcessor;
use crate::processor::schema::ProcessorError;
use crate::processor::Processor;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Kind tag for processors that run an external command
pub const CLI_PROCESSOR: &str = "cli";

/// Longest per-invocation timeout accepted, in seconds
pub const MAX_TIMEOUT_SECS: u64 = 3600;

/// A single processor in a chain.
///
/// ```json
/// {
///   "name": "security-validator",
///   "type": "cli",
///   "enabled": true,
///   "timeout": 20,
///   "config": { "command": "python3", "args": ["~/processors/security.py"] }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProcessorConfig {
    /// Unique name within its chain
    pub name: String,

    /// Processor kind; only "cli" has an implementation
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,

    /// Kind-specific configuration
    #[serde(default)]
    pub config: Map<String, Value>,
}

pub(crate) fn default_enabled() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    15
}

impl ProcessorConfig {
    /// Convenience constructor for an enabled command processor
    pub fn cli(name: impl Into<String>, command: impl Into<String>, args: &[&str]) -> Self {
        let mut config = Map::new();
        config.insert("command".to_string(), Value::String(command.into()));
        config.insert(
            "args".to_string(),
            Value::Array(args.iter().map(|a| Value::String((*a).to_string())).collect()),
        );
        Self {
            name: name.into(),
            kind: CLI_PROCESSOR.to_string(),
            enabled: true,
            timeout: default_timeout_secs(),
            config,
        }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(if self.timeout == 0 {
            default_timeout_secs()
        } else {
            self.timeout
        })
    }

    /// Instantiate the processor behind this configuration.
    ///
    /// This is the only place that looks at the kind tag.
    pub fn build(&self, working_dir: &Path) -> Result<Arc<dyn Processor>, ProcessorError> {
        if self.timeout > MAX_TIMEOUT_SECS {
            return Err(ProcessorError::InvalidConfig {
                name: self.name.clone(),
                reason: format!(
                    "timeout {} exceeds the maximum of {} seconds",
                    self.timeout, MAX_TIMEOUT_SECS
                ),
            });
        }
        match self.kind.as_str() {
            CLI_PROCESSOR => Ok(Arc::new(CommandProcessor::from_config(
                self,
                working_dir.to_path_buf(),
            )?)),
            other => Err(ProcessorError::UnsupportedKind {
                name: self.name.clone(),
                kind: other.to_string(),
            }),
        }
    }

    /// `config.command` and `config.args` for command processors
    pub(crate) fn command_and_args(&self) -> Result<(String, Vec<String>), ProcessorError> {
        let invalid = |reason: &str| ProcessorError::InvalidConfig {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        let command = match self.config.get("command") {
            Some(Value::String(command)) if !command.is_empty() => command.clone(),
            Some(Value::String(_)) => return Err(invalid("config.command cannot be empty")),
            Some(_) => return Err(invalid("config.command must be a string")),
            None => return Err(invalid("config.command is required for cli type")),
        };

        let args = match self.config.get("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(values)) => values
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| invalid("config.args must contain only strings"))
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => return Err(invalid("config.args must be an array")),
        };

        Ok((command, args))
    }
}

/// Validate a processor list the way it will be used at runtime.
///
/// Disabled processors are still validated: switching one on later must not
/// surface an unsupported kind on the first frame.
pub fn validate_processors(processors: &[ProcessorConfig]) -> Result<(), ProcessorError> {
    let mut names = HashSet::new();
    for (index, processor) in processors.iter().enumerate() {
        if processor.name.is_empty() {
            return Err(ProcessorError::InvalidConfig {
                name: format!("processor[{index}]"),
                reason: "name is required".to_string(),
            });
        }
        if !names.insert(processor.name.as_str()) {
            return Err(ProcessorError::InvalidConfig {
                name: processor.name.clone(),
                reason: "duplicate processor name".to_string(),
            });
        }
        if processor.kind.is_empty() {
            return Err(ProcessorError::InvalidConfig {
                name: processor.name.clone(),
                reason: "type is required".to_string(),
            });
        }
        processor.build(Path::new("."))?;
    }
    Ok(())
}

//! Stack Configuration (vmstack.toml)
//!
//! The same schema is used for the project file and the global user file;
//! the loader merges them.

use crate::{ConfigError, ConfigResult, DEFAULT_STACK_SIZE, MAX_STACK_SIZE, MIN_STACK_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Stack configuration from vmstack.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct StackConfig {
    /// Storage sizing and growth
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<StackSection>,

    /// Per-invocation flags
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invocation: Option<InvocationSection>,

    /// Backtrace rendering
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<BacktraceSection>,
}

/// `[stack]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct StackSection {
    /// Initial storage size in bytes (default: 8 KiB)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_size: Option<usize>,

    /// Largest size the storage may grow to (default: 1 MiB)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,

    /// Whether the storage may grow past its initial size
    #[serde(skip_serializing_if = "Option::is_none")]
    pub growth: Option<GrowthPolicy>,
}

/// How stack storage is obtained once the initial region is full
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GrowthPolicy {
    /// Storage never grows; overflowing the initial region is an error.
    None,
    /// Storage grows through the system allocator up to `max_size`.
    #[default]
    System,
}

impl GrowthPolicy {
    /// Parse the textual form used in files and environment variables.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "none" => Some(GrowthPolicy::None),
            "system" => Some(GrowthPolicy::System),
            _ => None,
        }
    }
}

/// `[invocation]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct InvocationSection {
    /// Emit a log line for every frame entered and left
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_execution: Option<bool>,
}

/// `[backtrace]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct BacktraceSection {
    /// Attach backtraces to propagated errors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl StackConfig {
    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate sizes against the storage limits
    pub fn validate(&self) -> ConfigResult<()> {
        let Some(stack) = &self.stack else {
            return Ok(());
        };

        if let Some(initial) = stack.initial_size {
            if initial < MIN_STACK_SIZE {
                return Err(ConfigError::InvalidValue {
                    field: "stack.initial_size".to_string(),
                    reason: format!("{} is below the minimum of {}", initial, MIN_STACK_SIZE),
                });
            }
        }

        if let Some(max) = stack.max_size {
            if max > MAX_STACK_SIZE {
                return Err(ConfigError::InvalidValue {
                    field: "stack.max_size".to_string(),
                    reason: format!("{} exceeds the hard maximum of {}", max, MAX_STACK_SIZE),
                });
            }
        }

        if self.initial_size() > self.max_size() {
            return Err(ConfigError::InvalidValue {
                field: "stack.initial_size".to_string(),
                reason: format!(
                    "{} is larger than max_size {}",
                    self.initial_size(),
                    self.max_size()
                ),
            });
        }

        Ok(())
    }

    /// Effective initial storage size
    pub fn initial_size(&self) -> usize {
        self.stack
            .as_ref()
            .and_then(|s| s.initial_size)
            .unwrap_or(DEFAULT_STACK_SIZE)
    }

    /// Effective maximum storage size
    pub fn max_size(&self) -> usize {
        self.stack
            .as_ref()
            .and_then(|s| s.max_size)
            .unwrap_or(MAX_STACK_SIZE)
    }

    /// Effective growth policy
    pub fn growth(&self) -> GrowthPolicy {
        self.stack
            .as_ref()
            .and_then(|s| s.growth)
            .unwrap_or_default()
    }

    /// Whether execution tracing is on
    pub fn trace_execution(&self) -> bool {
        self.invocation
            .as_ref()
            .and_then(|i| i.trace_execution)
            .unwrap_or(false)
    }

    /// Whether errors get backtraces attached
    pub fn backtrace_enabled(&self) -> bool {
        self.backtrace
            .as_ref()
            .and_then(|b| b.enabled)
            .unwrap_or(true)
    }

    /// Merge another config into this one.
    /// Values set in `other` take precedence, field by field.
    pub fn merge(&mut self, other: &StackConfig) {
        if let Some(other_stack) = &other.stack {
            let stack = self.stack.get_or_insert_with(Default::default);
            if other_stack.initial_size.is_some() {
                stack.initial_size = other_stack.initial_size;
            }
            if other_stack.max_size.is_some() {
                stack.max_size = other_stack.max_size;
            }
            if other_stack.growth.is_some() {
                stack.growth = other_stack.growth;
            }
        }
        if let Some(other_invocation) = &other.invocation {
            let invocation = self.invocation.get_or_insert_with(Default::default);
            if other_invocation.trace_execution.is_some() {
                invocation.trace_execution = other_invocation.trace_execution;
            }
        }
        if let Some(other_backtrace) = &other.backtrace {
            let backtrace = self.backtrace.get_or_insert_with(Default::default);
            if other_backtrace.enabled.is_some() {
                backtrace.enabled = other_backtrace.enabled;
            }
        }
    }
}

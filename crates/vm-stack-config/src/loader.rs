//! Configuration Loader
//!
//! Handles loading and merging configuration from multiple sources with proper precedence.

use crate::config::{GrowthPolicy, StackConfig};
use crate::{ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};

/// Name of the project configuration file
pub const CONFIG_FILE_NAME: &str = "vmstack.toml";

/// Configuration loader
///
/// Loads configuration from multiple sources and merges them with proper precedence:
/// 1. Global config (~/.vmstack/config.toml) - lowest priority
/// 2. Project config (./vmstack.toml) - overrides global
/// 3. Environment variables (VMSTACK_*) - highest priority
pub struct ConfigLoader {
    /// Cached global config path
    global_config_path: Option<PathBuf>,
}

/// Merged configuration result
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Effective configuration after merging every source
    pub config: StackConfig,

    /// Directory where vmstack.toml was found
    pub project_root: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Create a loader that reads the global config from `path` instead of the home directory
    pub fn with_global_path(path: PathBuf) -> Self {
        Self {
            global_config_path: Some(path),
        }
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find vmstack.toml, merges it over the
    /// global config, then applies environment overrides.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<LoadedConfig> {
        let (project_root, project_config) = self.find_project_config(start_dir)?;

        let mut config = self.load_global_config().unwrap_or_default();
        config.merge(&project_config);
        let config = self.apply_env_overrides(config)?;
        config.validate()?;

        Ok(LoadedConfig {
            config,
            project_root,
        })
    }

    /// Load configuration from a specific file
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<LoadedConfig> {
        let project_config = StackConfig::load_from_file(config_path)?;

        let mut config = self.load_global_config().unwrap_or_default();
        config.merge(&project_config);
        let config = self.apply_env_overrides(config)?;
        config.validate()?;

        Ok(LoadedConfig {
            config,
            project_root: config_path.parent().map(|p| p.to_path_buf()),
        })
    }

    /// Find project configuration by walking up the directory tree
    fn find_project_config(
        &self,
        start_dir: &Path,
    ) -> ConfigResult<(Option<PathBuf>, StackConfig)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(CONFIG_FILE_NAME);

            if config_path.exists() {
                let config = StackConfig::load_from_file(&config_path)?;
                return Ok((Some(current), config));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok((None, StackConfig::default())),
            }
        }
    }

    /// Load global configuration from ~/.vmstack/config.toml
    fn load_global_config(&mut self) -> ConfigResult<StackConfig> {
        let path = match &self.global_config_path {
            Some(path) => path.clone(),
            None => {
                let path = Self::global_config_dir()?.join("config.toml");
                self.global_config_path = Some(path.clone());
                path
            }
        };

        // Global config is optional
        if !path.exists() {
            return Ok(StackConfig::default());
        }

        StackConfig::load_from_file(&path)
    }

    /// Apply environment variable overrides
    ///
    /// Environment variables follow the pattern: VMSTACK_<KEY>
    /// Example: VMSTACK_TRACE_EXECUTION=true
    fn apply_env_overrides(&self, mut config: StackConfig) -> ConfigResult<StackConfig> {
        if let Ok(trace) = env::var("VMSTACK_TRACE_EXECUTION") {
            let trace_bool = matches!(trace.to_lowercase().as_str(), "true" | "1" | "yes");
            config
                .invocation
                .get_or_insert_with(Default::default)
                .trace_execution = Some(trace_bool);
        }

        if let Ok(size) = env::var("VMSTACK_INITIAL_SIZE") {
            let size = parse_size("VMSTACK_INITIAL_SIZE", &size)?;
            config.stack.get_or_insert_with(Default::default).initial_size = Some(size);
        }

        if let Ok(size) = env::var("VMSTACK_MAX_SIZE") {
            let size = parse_size("VMSTACK_MAX_SIZE", &size)?;
            config.stack.get_or_insert_with(Default::default).max_size = Some(size);
        }

        if let Ok(growth) = env::var("VMSTACK_GROWTH") {
            let policy = GrowthPolicy::parse(&growth).ok_or_else(|| ConfigError::InvalidValue {
                field: "VMSTACK_GROWTH".to_string(),
                reason: format!("must be 'none' or 'system', got '{}'", growth),
            })?;
            config.stack.get_or_insert_with(Default::default).growth = Some(policy);
        }

        Ok(config)
    }

    /// Get the global configuration directory (~/.vmstack)
    pub fn global_config_dir() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".vmstack"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadedConfig {
    /// Get the project root directory
    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Check if a vmstack.toml was found
    pub fn is_project(&self) -> bool {
        self.project_root.is_some()
    }

    /// Effective initial storage size
    pub fn initial_size(&self) -> usize {
        self.config.initial_size()
    }
}

fn parse_size(field: &str, value: &str) -> ConfigResult<usize> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|e| ConfigError::InvalidValue {
            field: field.to_string(),
            reason: format!("'{}' is not a byte count: {}", value, e),
        })
}

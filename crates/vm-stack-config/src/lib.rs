//! VM Stack Configuration
//!
//! Provides configuration management for VM call stacks:
//! - Project configuration (vmstack.toml)
//! - Global user configuration (~/.vmstack/config.toml)
//! - Stack size limits and growth policy
//! - Invocation flags (execution tracing)
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded and merged in the following order (later overrides earlier):
//! 1. Global config (~/.vmstack/config.toml)
//! 2. Project config (./vmstack.toml)
//! 3. Environment variables (VMSTACK_*)
//!
//! # Example
//!
//! ```no_run
//! use vm_stack_config::ConfigLoader;
//! use std::path::Path;
//!
//! let mut loader = ConfigLoader::new();
//! let config = loader.load_from_directory(Path::new(".")).unwrap();
//! println!("initial stack size: {}", config.initial_size());
//! ```

pub mod config;
pub mod loader;

use std::path::PathBuf;
use thiserror::Error;

/// Reasonable default stack storage size, in bytes.
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024;

/// Smallest stack storage accepted, in bytes.
pub const MIN_STACK_SIZE: usize = 1024;

/// Hard upper bound on stack storage, in bytes. Anything larger is probably a bug.
pub const MAX_STACK_SIZE: usize = 1024 * 1024;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Home directory not found")]
    HomeNotFound,
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

pub use config::{BacktraceSection, GrowthPolicy, InvocationSection, StackConfig, StackSection};
pub use loader::{ConfigLoader, LoadedConfig};

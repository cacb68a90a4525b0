//! Configuration system for the Stagegate pipeline orchestrator.
//!
//! Provides TOML-based configuration with:
//! - `[pipeline]` execution policy (quality gates, retries, step timeout, history)
//! - `[snapshots]` retention and backup location for stage snapshots
//! - `[logging]` console level and rolling JSON log files
//! - Config file layering (user config dir + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigLayer, ConfigSource, LoadedConfig, load_config, load_config_file,
    load_config_with_options, save_config, user_config_dir, user_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;

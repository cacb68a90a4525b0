//! CLI command handlers.

use std::path::PathBuf;

use stagegate_config::LoadedConfig;

pub mod config;
pub mod rehearse;
pub mod validate;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
    /// User config directory, if one could be determined.
    pub config_dir: Option<PathBuf>,
    /// Merged configuration and where it came from.
    pub config: LoadedConfig,
}

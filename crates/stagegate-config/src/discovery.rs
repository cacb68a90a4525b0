//! Locating and layering `stagegate` config files.
//!
//! Two layers are read, the user file first and the project file on top:
//! `<config dir>/config.toml`, then `stagegate.toml` in the project directory.
//! The config dir is `--config-dir`, else `$STAGEGATE_CONFIG_DIR`, else the
//! platform config dir plus `stagegate`. Command-line flags are applied by
//! the binary after loading.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::{ConfigError, Result, StagegateConfig};

const PROJECT_CONFIG_FILE: &str = "stagegate.toml";
const USER_CONFIG_FILE: &str = "config.toml";
const APP_NAME: &str = "stagegate";
const CONFIG_DIR_ENV: &str = "STAGEGATE_CONFIG_DIR";

/// Which layer a config file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLayer {
    User,
    Project,
}

impl ConfigLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigLayer::User => "user",
            ConfigLayer::Project => "project",
        }
    }
}

impl fmt::Display for ConfigLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One candidate file and whether it contributed to the result.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub layer: ConfigLayer,
    pub path: PathBuf,
    pub loaded: bool,
}

/// Merged config plus the trail of files that produced it.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: StagegateConfig,
    /// Candidates in merge order, user layer first.
    pub sources: Vec<ConfigSource>,
    /// One message per file that existed but could not be used.
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }
}

pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(project_dir, None)
}

/// Like [`load_config`], with `config_dir` replacing the user config dir
/// lookup entirely.
pub fn load_config_with_options(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut loaded = LoadedConfig {
        config: StagegateConfig::new(),
        sources: Vec::new(),
        warnings: Vec::new(),
    };

    for (layer, path) in candidates(project_dir, config_dir) {
        let applied = match read_layer(&path) {
            Ok(Some(layer_config)) => {
                loaded.config.merge(layer_config);
                true
            }
            Ok(None) => false,
            Err(e) => {
                loaded
                    .warnings
                    .push(format!("Failed to load {layer} config {}: {e}", path.display()));
                false
            }
        };
        loaded.sources.push(ConfigSource {
            layer,
            path,
            loaded: applied,
        });
    }

    Ok(loaded)
}

/// Files to try, lowest precedence first. The user layer is left out when no
/// config dir can be determined.
fn candidates(project_dir: Option<&Path>, config_dir: Option<&Path>) -> Vec<(ConfigLayer, PathBuf)> {
    let user = match config_dir {
        Some(dir) => Some(dir.join(USER_CONFIG_FILE)),
        None => user_config_path(),
    };
    let project = match project_dir {
        Some(dir) => dir.join(PROJECT_CONFIG_FILE),
        None => PathBuf::from(PROJECT_CONFIG_FILE),
    };

    user.map(|path| (ConfigLayer::User, path))
        .into_iter()
        .chain(std::iter::once((ConfigLayer::Project, project)))
        .collect()
}

/// `Ok(None)` when the file is absent.
fn read_layer(path: &Path) -> Result<Option<StagegateConfig>> {
    if !path.is_file() {
        return Ok(None);
    }
    load_config_file(path).map(Some)
}

pub fn load_config_file(path: &Path) -> Result<StagegateConfig> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    StagegateConfig::from_toml(&contents)
}

/// Write `config` as TOML, creating missing parent directories.
pub fn save_config(config: &StagegateConfig, path: &Path) -> Result<()> {
    let write_error = |at: &Path, source: std::io::Error| ConfigError::WriteFile {
        path: at.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| write_error(parent, e))?;
    }
    std::fs::write(path, config.to_toml()?).map_err(|e| write_error(path, e))
}

pub fn user_config_path() -> Option<PathBuf> {
    user_config_dir().map(|d| d.join(USER_CONFIG_FILE))
}

/// `$STAGEGATE_CONFIG_DIR` when set and non-empty, else the platform dir.
pub fn user_config_dir() -> Option<PathBuf> {
    match std::env::var(CONFIG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => dirs::config_dir().map(|d| d.join(APP_NAME)),
    }
}

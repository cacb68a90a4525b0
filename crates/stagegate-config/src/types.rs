//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [pipeline]     # execution policy
//! [snapshots]    # stage snapshot retention
//! [logging]      # console + file logging
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StagegateConfig {
    /// Pipeline execution policy.
    pub pipeline: Option<PipelineSection>,

    /// Snapshot retention configuration.
    pub snapshots: Option<SnapshotSection>,

    /// Logging configuration.
    pub logging: Option<LoggingSection>,
}

impl StagegateConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: StagegateConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sections are replaced wholesale, not field by field.
    pub fn merge(&mut self, other: StagegateConfig) {
        if other.pipeline.is_some() {
            self.pipeline = other.pipeline;
        }
        if other.snapshots.is_some() {
            self.snapshots = other.snapshots;
        }
        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if let Some(ref snapshots) = self.snapshots
            && snapshots.max_snapshots == 0
        {
            return Err(ConfigError::InvalidValue {
                field: "snapshots.max_snapshots".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(ref pipeline) = self.pipeline {
            if pipeline.max_history_entries == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "pipeline.max_history_entries".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            if pipeline.step_timeout_secs == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "pipeline.step_timeout_secs".to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Pipeline section, or defaults when absent.
    pub fn pipeline(&self) -> PipelineSection {
        self.pipeline.clone().unwrap_or_default()
    }

    /// Snapshot section, or defaults when absent.
    pub fn snapshots(&self) -> SnapshotSection {
        self.snapshots.clone().unwrap_or_default()
    }

    /// Logging section, or defaults when absent.
    pub fn logging(&self) -> LoggingSection {
        self.logging.clone().unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Pipeline execution policy.
///
/// ```toml
/// [pipeline]
/// enable_quality_gates = true
/// stop_on_gate_failure = true
/// enable_snapshots = true
/// max_retries = 3
/// retry_base_delay_ms = 1000
/// retry_max_delay_ms = 30000
/// step_timeout_secs = 300
/// max_history_entries = 100
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// Run stage quality gates.
    pub enable_quality_gates: bool,
    /// Abort the workflow when a blocking gate fails.
    pub stop_on_gate_failure: bool,
    /// Capture a snapshot before each stage starts.
    pub enable_snapshots: bool,
    /// Retries per step after the first attempt.
    pub max_retries: u32,
    /// Base delay for exponential retry backoff, in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Upper bound for a single backoff delay, in milliseconds.
    pub retry_max_delay_ms: u64,
    /// Per-step timeout in seconds.
    pub step_timeout_secs: u64,
    /// Finished workflows kept in the in-memory history.
    pub max_history_entries: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            enable_quality_gates: true,
            stop_on_gate_failure: true,
            enable_snapshots: true,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            step_timeout_secs: 300,
            max_history_entries: 100,
        }
    }
}

impl PipelineSection {
    /// Base retry delay as a `Duration`.
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Maximum retry delay as a `Duration`.
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    /// Step timeout as a `Duration`.
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Snapshot retention configuration.
///
/// ```toml
/// [snapshots]
/// max_snapshots = 10
/// directory = "/var/tmp/stagegate"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSection {
    /// Live snapshots kept before the oldest is evicted.
    pub max_snapshots: usize,
    /// Root directory for backup files. Defaults to a private directory
    /// under the system temp dir.
    pub directory: Option<PathBuf>,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            max_snapshots: 10,
            directory: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Logging configuration section.
///
/// ```toml
/// [logging]
/// level = "info"
/// file = true
/// directory = "~/.config/stagegate/logs"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Console filter directive (`EnvFilter` syntax).
    pub level: String,
    /// Write JSON logs to daily rolling files.
    pub file: bool,
    /// Directory for log files. Defaults to `logs/` under the user config dir.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: true,
            directory: None,
        }
    }
}

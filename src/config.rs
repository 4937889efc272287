//! Configuration for statecore
//!
//! Centralized configuration with sensible defaults. Every setting is a plain
//! key/value pair, so a config file is a flat JSON object:
//!
//! ```json
//! {
//!   "wal_dir": "/var/lib/statecore/wal",
//!   "snapshot_dir": "/var/lib/statecore/snapshots",
//!   "report_dir": "/var/log/statecore",
//!   "cpu_threshold_ms": 50.0,
//!   "violation_policy": { "kind": "rolling_window", "intervals": 4 },
//!   "sync_mode": "full"
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StateError};

/// Main configuration for a statecore instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Directory holding `wal.log`
    pub wal_dir: PathBuf,

    /// Directory holding the canonical snapshot, its temporaries and the
    /// checkpoint. Temporaries must live next to the canonical file so the
    /// rename stays within one directory.
    pub snapshot_dir: PathBuf,

    /// Where recovery reports are written (`recovery-<unix_ms>.json`).
    /// `None` keeps reports in memory only.
    pub report_dir: Option<PathBuf>,

    /// Flush semantics for every durable-flush point
    pub sync_mode: SyncMode,

    // -------------------------------------------------------------------------
    // CPU Accounting Configuration
    // -------------------------------------------------------------------------
    /// CPU time (milliseconds) a single tracked window may consume
    pub cpu_threshold_ms: f64,

    /// How measurements are compared against the threshold
    pub violation_policy: ViolationPolicy,
}

/// Flush semantics used at every durable-flush point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `sync_all`: file data and metadata (size, mtime) reach stable storage
    Full,

    /// `sync_data`: file data and the metadata needed to read it back
    Data,
}

/// Violation detection policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViolationPolicy {
    /// Each tracked window is compared on its own
    SingleMeasurement,

    /// The sum of the last `intervals` windows of a thread is compared
    RollingWindow { intervals: usize },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wal_dir: PathBuf::from("./statecore_data/wal"),
            snapshot_dir: PathBuf::from("./statecore_data/snapshots"),
            report_dir: None,
            sync_mode: SyncMode::Full,
            cpu_threshold_ms: 50.0,
            violation_policy: ViolationPolicy::SingleMeasurement,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load a config from a JSON file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| StateError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(self.cpu_threshold_ms.is_finite() && self.cpu_threshold_ms > 0.0) {
            return Err(StateError::Config(format!(
                "cpu_threshold_ms must be a positive number, got {}",
                self.cpu_threshold_ms
            )));
        }
        if let ViolationPolicy::RollingWindow { intervals: 0 } = self.violation_policy {
            return Err(StateError::Config(
                "rolling_window.intervals must be at least 1".to_string(),
            ));
        }
        if self.wal_dir.as_os_str().is_empty() || self.snapshot_dir.as_os_str().is_empty() {
            return Err(StateError::Config(
                "wal_dir and snapshot_dir must be set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Place the WAL and snapshots under one root:
    ///   {root}/
    ///     ├── wal/wal.log
    ///     └── snapshots/state.snapshot
    pub fn data_dir(mut self, root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        self.config.wal_dir = root.join("wal");
        self.config.snapshot_dir = root.join("snapshots");
        self
    }

    /// Set the WAL directory
    pub fn wal_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.wal_dir = path.into();
        self
    }

    /// Set the snapshot directory
    pub fn snapshot_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.snapshot_dir = path.into();
        self
    }

    /// Set the recovery report sink directory
    pub fn report_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.report_dir = Some(path.into());
        self
    }

    /// Set the flush semantics
    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.config.sync_mode = mode;
        self
    }

    /// Set the CPU violation threshold (in milliseconds)
    pub fn cpu_threshold_ms(mut self, ms: f64) -> Self {
        self.config.cpu_threshold_ms = ms;
        self
    }

    /// Set the violation policy
    pub fn violation_policy(mut self, policy: ViolationPolicy) -> Self {
        self.config.violation_policy = policy;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

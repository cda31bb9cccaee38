//! Driver options.
//!
//! Options are immutable once the driver is built. They can be constructed
//! in code or loaded from a JSON file; unspecified fields take defaults.

use lparkit_shared::errors::{LparkitError, LparkitResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default processing units allotted per vCPU.
pub const DEFAULT_PROC_UNITS_FACTOR: f64 = 0.1;

/// How fibre channel volumes are attached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FcAttachStrategy {
    #[default]
    Vscsi,
    Npiv,
}

/// Where NVRAM blobs are persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NvramStoreKind {
    /// NVRAM is not persisted; NVRAM tasks become no-ops.
    #[default]
    None,
    /// SQLite database under `home_dir/db`.
    Sqlite,
}

/// Top-level driver options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LparkitOptions {
    /// Driver home (logs, NVRAM database). Must be absolute.
    pub home_dir: PathBuf,
    /// Managed system UUID.
    pub host_uuid: String,
    /// Host name reported to volume backends.
    pub host_name: String,
    /// Shared storage pool to use; `None` means the single pool on the host.
    pub ssp_name: Option<String>,
    pub fc_attach_strategy: FcAttachStrategy,
    pub proc_units_factor: f64,
    /// Attach a configuration drive on spawn.
    pub config_drive: bool,
    pub nvram_store: NvramStoreKind,
}

impl Default for LparkitOptions {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            host_uuid: String::new(),
            host_name: String::new(),
            ssp_name: None,
            fc_attach_strategy: FcAttachStrategy::default(),
            proc_units_factor: DEFAULT_PROC_UNITS_FACTOR,
            config_drive: false,
            nvram_store: NvramStoreKind::default(),
        }
    }
}

fn default_home_dir() -> PathBuf {
    if let Ok(home) = std::env::var("LPARKIT_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join(".lparkit")
}

impl LparkitOptions {
    /// Load options from a JSON file.
    pub fn from_file(path: &Path) -> LparkitResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            LparkitError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let options: Self = serde_json::from_str(&raw)?;
        options.validate()?;
        Ok(options)
    }

    /// Check option ranges.
    pub fn validate(&self) -> LparkitResult<()> {
        if !self.home_dir.is_absolute() {
            return Err(LparkitError::Config(format!(
                "home_dir must be absolute path, got: {}",
                self.home_dir.display()
            )));
        }
        if self.host_uuid.trim().is_empty() {
            return Err(LparkitError::Config("host_uuid must be set".into()));
        }
        if !(self.proc_units_factor > 0.05 && self.proc_units_factor <= 1.0) {
            return Err(LparkitError::Config(format!(
                "proc_units_factor must be in (0.05, 1.0], got {}",
                self.proc_units_factor
            )));
        }
        if let Some(name) = &self.ssp_name
            && name.trim().is_empty()
        {
            return Err(LparkitError::Config("ssp_name must not be empty".into()));
        }
        Ok(())
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join("logs")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.home_dir.join("db")
    }
}

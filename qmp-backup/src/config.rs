//! Configuration for a backup run.
//!
//! Two layers:
//! - [`BackupConfig`]: what this invocation does (device, chain, cleanup),
//!   built from CLI flags and validated before any connection is made
//! - [`Settings`]: optional TOML file with deployment defaults

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::executor::teardown::TeardownPlan;
use crate::naming::{self, BackupFiles};
use crate::{BackupError, Result};

/// Device backed up when none is given.
pub const DEFAULT_DEVICE: &str = "drive0";

/// Node name the backup image is attached under.
pub const DEFAULT_NODE_TARGET: &str = "target0-node";

/// Operator cleanup requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupFlags {
    /// Remove bitmap, cancel job and detach the target node
    pub clean_all: bool,

    /// Remove the dirty bitmap only
    pub remove_bitmap: bool,

    /// Detach the target node only
    pub delete_device: bool,

    /// Remove the dirty bitmap through the backup workflow and exit
    pub remove_bitmap_and_exit: bool,
}

/// What an invocation does, decided from the cleanup flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run the backup workflow
    Backup,
    /// Best-effort cleanup, no backup
    Teardown(TeardownPlan),
}

impl CleanupFlags {
    pub fn validate(&self) -> Result<()> {
        if self.remove_bitmap && self.delete_device {
            return Err(BackupError::Config(
                "--rb and --dd cannot be used together".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a backup file base name is needed for this invocation.
    pub fn needs_backup_file(&self) -> bool {
        !self.remove_bitmap && !self.delete_device
    }

    /// Delete-device wins over remove-bitmap, which wins over clean-all.
    pub fn mode(&self) -> RunMode {
        if self.delete_device {
            RunMode::Teardown(TeardownPlan::DEVICE_ONLY)
        } else if self.remove_bitmap {
            RunMode::Teardown(TeardownPlan::BITMAP_ONLY)
        } else if self.clean_all {
            RunMode::Teardown(TeardownPlan::ALL)
        } else {
            RunMode::Backup
        }
    }
}

/// Immutable configuration of one backup invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    /// Device (or node) being backed up
    pub device: String,

    /// Node name for the attached backup image
    pub node_target: String,

    /// QMP monitor socket
    pub socket: PathBuf,

    /// Chain base name, e.g. `/backups/vm`
    pub base_name: Option<PathBuf>,

    /// -1 = full, 0 = first incremental, n = nth incremental
    pub inc_level: i32,

    /// Derived from `base_name` and `inc_level`
    pub files: Option<BackupFiles>,

    pub cleanup: CleanupFlags,
}

impl BackupConfig {
    /// Build and validate a configuration, deriving the chain paths.
    pub fn new(
        device: impl Into<String>,
        socket: impl Into<PathBuf>,
        base_name: Option<PathBuf>,
        inc_level: i32,
        cleanup: CleanupFlags,
    ) -> Result<Self> {
        let files = base_name
            .as_deref()
            .map(|base| naming::resolve(base, inc_level));

        let config = Self {
            device: device.into(),
            node_target: DEFAULT_NODE_TARGET.to_string(),
            socket: socket.into(),
            base_name,
            inc_level,
            files,
            cleanup,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_node_target(mut self, node_target: impl Into<String>) -> Self {
        self.node_target = node_target.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.cleanup.validate()?;

        if self.socket.as_os_str().is_empty() {
            return Err(BackupError::Config("--socket is required".to_string()));
        }
        if self.device.is_empty() {
            return Err(BackupError::Config("--device must not be empty".to_string()));
        }
        if self.node_target.is_empty() {
            return Err(BackupError::Config("node target must not be empty".to_string()));
        }

        let has_base = self
            .base_name
            .as_deref()
            .is_some_and(|base| !base.as_os_str().is_empty());
        if self.cleanup.needs_backup_file() && !has_base {
            return Err(BackupError::Config(
                "--backup-file is required unless --rb or --dd is set".to_string(),
            ));
        }

        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.inc_level < 0
    }

    /// Chain paths, present whenever a backup can run.
    pub fn files(&self) -> Result<&BackupFiles> {
        self.files
            .as_ref()
            .ok_or_else(|| BackupError::Config("no backup file base name configured".to_string()))
    }

    pub fn backup_kind(&self) -> &'static str {
        if self.is_full() {
            "full"
        } else {
            "incremental"
        }
    }
}

/// Deployment settings loaded from a TOML file. Every field has a default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub qmp: QmpSettings,
    pub image: ImageSettings,
    pub backup: BackupSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QmpSettings {
    /// Bound on socket connect plus capability negotiation
    pub connect_timeout_secs: u64,

    /// Node name for the attached backup image
    pub node_target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSettings {
    /// `qemu-img` executable
    pub qemu_img: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Detach the target node once the job has completed
    pub detach_after_completion: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for QmpSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 2,
            node_target: DEFAULT_NODE_TARGET.to_string(),
        }
    }
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            qemu_img: PathBuf::from("qemu-img"),
        }
    }
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            detach_after_completion: true,
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl QmpSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Settings {
    /// Load settings from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }
}

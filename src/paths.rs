//! Application directory structure for qemu-manager.
//!
//! Provides a single `ManagerPaths` struct that resolves all standard
//! directories and ensures they exist on first launch:
//!
//! - Config:  `~/.config/qemu-manager/`  (settings.toml, human-editable)
//! - Base:    `~/.qemu-manager/`         (machine-managed data root)
//! - Disks:   `~/.qemu-manager/disks/`   (created disk images)
//! - VMs:     `~/.qemu-manager/vms/`     (VM state file)
//! - Logs:    `~/.qemu-manager/logs/`    (optional file logging)
//!
//! `XDG_CONFIG_HOME` and `QEMU_MANAGER_HOME` override the config and base
//! locations respectively.

use std::path::PathBuf;

use tracing::debug;

const APP_NAME: &str = "qemu-manager";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct ManagerPaths {
    /// Human-editable config: `~/.config/qemu-manager/`
    pub config: PathBuf,
    /// Machine-managed data root
    pub base: PathBuf,
    /// Created disk images
    pub disks: PathBuf,
    /// VM state file directory
    pub vms: PathBuf,
    /// Application logs
    pub logs: PathBuf,
}

impl ManagerPaths {
    /// Resolve all paths from the environment and home directory.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;

        let config = match std::env::var("XDG_CONFIG_HOME") {
            Ok(xdg) => PathBuf::from(xdg).join(APP_NAME),
            Err(_) => home.join(".config").join(APP_NAME),
        };

        let base = match std::env::var("QEMU_MANAGER_HOME") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => home.join(format!(".{APP_NAME}")),
        };

        Some(Self {
            config,
            disks: base.join("disks"),
            vms: base.join("vms"),
            logs: base.join("logs"),
            base,
        })
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        let dirs = [&self.config, &self.base, &self.disks, &self.vms, &self.logs];

        for dir in &dirs {
            std::fs::create_dir_all(dir)?;
            debug!("ensured directory: {}", dir.display());
        }

        Ok(())
    }

    /// Full path of the VM state file.
    pub fn state_file(&self) -> PathBuf {
        self.vms.join("vms.txt")
    }

    /// Full path of the settings file.
    pub fn settings_file(&self) -> PathBuf {
        self.config.join("settings.toml")
    }
}

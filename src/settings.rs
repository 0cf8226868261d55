//! Application settings persisted as `settings.toml`.
//!
//! Holds the paths of the external QEMU tools and the defaults applied to
//! newly created VMs. There is no global settings singleton: `Settings` is
//! loaded once at startup and passed by reference to whoever needs it.
//!
//! Missing file or missing keys fall back to defaults; on first run the
//! default file is written so users have something to edit.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

// ---------------------------------------------------------------------------
// Settings struct
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Path of the QEMU system emulator binary.
    pub qemu_path: PathBuf,

    /// Path of the `qemu-img` disk tool.
    pub qemu_img_path: PathBuf,

    /// Path of an external VNC viewer; empty means "not configured".
    pub vnc_viewer_path: PathBuf,

    /// Memory given to newly created VMs, in megabytes.
    pub default_memory_mb: u32,

    /// CPU cores given to newly created VMs.
    pub default_cpu_cores: u32,

    /// Architecture string for newly created VMs.
    pub default_architecture: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            qemu_path: default_qemu_path(),
            qemu_img_path: PathBuf::from("qemu-img"),
            vnc_viewer_path: PathBuf::new(),
            default_memory_mb: 1024,
            default_cpu_cores: 1,
            default_architecture: "x86_64".to_string(),
        }
    }
}

/// Common install location of the x86_64 system emulator per platform.
fn default_qemu_path() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        PathBuf::from("/usr/local/bin/qemu-system-x86_64")
    }
    #[cfg(not(target_os = "macos"))]
    {
        PathBuf::from("/usr/bin/qemu-system-x86_64")
    }
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

impl Settings {
    /// Load settings from `path`, writing the default file first if none
    /// exists. An unreadable or unparsable file degrades to defaults with a
    /// warning rather than aborting startup.
    pub fn load_or_init(path: &Path) -> Self {
        if !path.exists() {
            let settings = Self::default();
            if let Err(e) = settings.save(path) {
                warn!("failed to write default settings to {}: {e:#}", path.display());
            }
            return settings;
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("invalid settings file {}: {e}", path.display());
                    Self::default()
                }
            },
            Err(e) => {
                warn!("failed to read settings file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Serialize the settings to TOML at `path`, creating parent directories
    /// as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create settings dir {}", parent.display()))?;
        }
        let contents = toml::to_string_pretty(self).context("serialize settings")?;
        std::fs::write(path, contents)
            .with_context(|| format!("write settings file {}", path.display()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

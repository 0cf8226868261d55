//! Disk image creation via `qemu-img`.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Format and size unit
// ---------------------------------------------------------------------------

/// Disk image formats `qemu-img create -f` accepts here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiskFormat {
    #[default]
    Qcow2,
    Raw,
    Vmdk,
    Vdi,
}

impl DiskFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Vdi => "vdi",
        }
    }

    /// Customary file extension for the format.
    pub fn extension(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "img",
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Vdi => "vdi",
        }
    }

    pub const ALL: [DiskFormat; 4] = [
        DiskFormat::Qcow2,
        DiskFormat::Raw,
        DiskFormat::Vmdk,
        DiskFormat::Vdi,
    ];
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiskFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "qcow2" => Ok(DiskFormat::Qcow2),
            "raw" => Ok(DiskFormat::Raw),
            "vmdk" => Ok(DiskFormat::Vmdk),
            "vdi" => Ok(DiskFormat::Vdi),
            other => bail!("unknown disk format: {other} (expected qcow2, raw, vmdk or vdi)"),
        }
    }
}

/// Size suffix passed to `qemu-img` (`M`, `G`, `T`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiskSizeUnit {
    Mb,
    #[default]
    Gb,
    Tb,
}

impl DiskSizeUnit {
    pub fn suffix(&self) -> &'static str {
        match self {
            DiskSizeUnit::Mb => "M",
            DiskSizeUnit::Gb => "G",
            DiskSizeUnit::Tb => "T",
        }
    }
}

impl FromStr for DiskSizeUnit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "M" | "MB" => Ok(DiskSizeUnit::Mb),
            "G" | "GB" => Ok(DiskSizeUnit::Gb),
            "T" | "TB" => Ok(DiskSizeUnit::Tb),
            other => bail!("unknown size unit: {other} (expected MB, GB or TB)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

/// Arguments of the `qemu-img create` invocation, binary excluded.
pub fn build_disk_create_args(
    format: DiskFormat,
    path: &Path,
    size: u64,
    unit: DiskSizeUnit,
) -> Vec<String> {
    vec![
        "create".to_string(),
        "-f".to_string(),
        format.as_str().to_string(),
        path.display().to_string(),
        format!("{size}{}", unit.suffix()),
    ]
}

/// Create a disk image with `qemu-img`.
///
/// Probes the tool with `--version` first so a missing binary produces a
/// clear error instead of a create failure. On a non-zero exit the error
/// carries the full command line plus the tool's combined output.
pub async fn create_disk(
    qemu_img: &Path,
    format: DiskFormat,
    path: &Path,
    size: u64,
    unit: DiskSizeUnit,
) -> Result<()> {
    if size == 0 {
        bail!("disk size must be greater than zero");
    }

    Command::new(qemu_img)
        .arg("--version")
        .output()
        .await
        .with_context(|| format!("qemu-img not found at {}", qemu_img.display()))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create disk dir {}", parent.display()))?;
    }

    let args = build_disk_create_args(format, path, size, unit);
    debug!(tool = %qemu_img.display(), ?args, "running qemu-img");

    let output = Command::new(qemu_img)
        .args(&args)
        .output()
        .await
        .with_context(|| format!("run {} create", qemu_img.display()))?;

    if !output.status.success() {
        let mut captured = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !captured.is_empty() {
                captured.push('\n');
            }
            captured.push_str(stderr.trim());
        }
        bail!(
            "qemu-img failed ({}): {} {}: {captured}",
            output.status,
            qemu_img.display(),
            args.join(" "),
        );
    }

    info!(path = %path.display(), %format, "disk image created");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn create_args_match_qemu_img_syntax() {
        let args = build_disk_create_args(
            DiskFormat::Qcow2,
            &PathBuf::from("/vms/disks/web.qcow2"),
            20,
            DiskSizeUnit::Gb,
        );
        assert_eq!(args, ["create", "-f", "qcow2", "/vms/disks/web.qcow2", "20G"]);
    }

    #[test]
    fn size_units_map_to_single_letter_suffixes() {
        assert_eq!(DiskSizeUnit::Mb.suffix(), "M");
        assert_eq!(DiskSizeUnit::Gb.suffix(), "G");
        assert_eq!(DiskSizeUnit::Tb.suffix(), "T");
    }

    #[test]
    fn formats_parse_case_insensitively() {
        assert_eq!("QCOW2".parse::<DiskFormat>().unwrap(), DiskFormat::Qcow2);
        assert_eq!("raw".parse::<DiskFormat>().unwrap(), DiskFormat::Raw);
        assert_eq!("Vmdk".parse::<DiskFormat>().unwrap(), DiskFormat::Vmdk);
        assert_eq!("vdi".parse::<DiskFormat>().unwrap(), DiskFormat::Vdi);
        assert!("qcow3".parse::<DiskFormat>().is_err());
    }

    #[test]
    fn units_accept_long_and_short_names() {
        assert_eq!("gb".parse::<DiskSizeUnit>().unwrap(), DiskSizeUnit::Gb);
        assert_eq!("M".parse::<DiskSizeUnit>().unwrap(), DiskSizeUnit::Mb);
        assert_eq!("TB".parse::<DiskSizeUnit>().unwrap(), DiskSizeUnit::Tb);
        assert!("KB".parse::<DiskSizeUnit>().is_err());
    }

    #[tokio::test]
    async fn zero_size_is_rejected_before_any_io() {
        let err = create_disk(
            &PathBuf::from("/nonexistent/qemu-img"),
            DiskFormat::Qcow2,
            &PathBuf::from("/tmp/never.qcow2"),
            0,
            DiskSizeUnit::Gb,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
    }

    #[tokio::test]
    async fn missing_tool_is_reported_by_the_probe() {
        let err = create_disk(
            &PathBuf::from("/definitely/not/qemu-img"),
            DiskFormat::Qcow2,
            &PathBuf::from("/tmp/never.qcow2"),
            1,
            DiskSizeUnit::Gb,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}

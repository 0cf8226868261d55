//! Launching an external VNC viewer against a VM's display port.
//!
//! The viewer binary comes from `vnc_viewer_path` in the settings; an empty
//! path triggers auto-discovery of common viewers on `PATH`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::{debug, info};

/// Viewers probed, in order, when none is configured.
const COMMON_VIEWERS: [&str; 6] = [
    "vncviewer",
    "tigervnc-viewer",
    "gvncviewer",
    "remmina",
    "krdc",
    "vinagre",
];

/// Look for a known VNC viewer on `PATH`.
pub async fn find_viewer() -> Option<PathBuf> {
    for candidate in COMMON_VIEWERS {
        match Command::new("which").arg(candidate).output().await {
            Ok(output) if output.status.success() => {
                debug!(viewer = candidate, "VNC viewer found on PATH");
                return Some(PathBuf::from(candidate));
            }
            _ => {}
        }
    }
    None
}

/// The viewer to launch: the configured one, or an auto-discovered fallback
/// when the configured path is empty.
pub async fn resolve_viewer(configured: &Path) -> Result<PathBuf> {
    if !configured.as_os_str().is_empty() {
        return Ok(configured.to_path_buf());
    }
    match find_viewer().await {
        Some(viewer) => Ok(viewer),
        None => bail!(
            "no VNC viewer configured and none found on PATH (tried {}); \
             set vnc_viewer_path in settings.toml",
            COMMON_VIEWERS.join(", ")
        ),
    }
}

/// Spawn the viewer against `localhost:<vnc_port>` and leave it running.
pub async fn connect(viewer: &Path, vnc_port: u16) -> Result<()> {
    let address = format!("localhost:{vnc_port}");
    Command::new(viewer)
        .arg(&address)
        .spawn()
        .with_context(|| format!("launch VNC viewer {}", viewer.display()))?;
    info!(viewer = %viewer.display(), %address, "VNC viewer launched");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn configured_viewer_wins_over_discovery() {
        let configured = PathBuf::from("/opt/viewers/my-vnc");
        let resolved = resolve_viewer(&configured).await.unwrap();
        assert_eq!(resolved, configured);
    }

    #[tokio::test]
    async fn connect_with_missing_viewer_errors() {
        let err = connect(&PathBuf::from("/definitely/not/a/viewer"), 5901)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("launch VNC viewer"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn connect_passes_the_display_address() {
        use std::os::unix::fs::PermissionsExt;

        // A fake viewer that records its arguments.
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("args.txt");
        let viewer = tmp.path().join("fake-viewer");
        std::fs::write(&viewer, format!("#!/bin/sh\necho \"$@\" > {}\n", log.display())).unwrap();
        std::fs::set_permissions(&viewer, std::fs::Permissions::from_mode(0o755)).unwrap();

        connect(&viewer, 5905).await.unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while !log.exists() {
            assert!(std::time::Instant::now() < deadline, "viewer never ran");
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let args = std::fs::read_to_string(&log).unwrap();
        assert_eq!(args.trim(), "localhost:5905");
    }
}

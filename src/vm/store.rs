//! Flat-file persistence for VM records.
//!
//! The state file is plain UTF-8 text, one `key=value` line per attribute,
//! with each record wrapped in `[VM_START]` / `[VM_END]` markers:
//!
//! ```text
//! # QEMU Manager VM State File
//! [VM_START]
//! name=alpine
//! diskPath=/home/user/.qemu-manager/disks/alpine.qcow2
//! memoryMB=1024
//! ...
//! [VM_END]
//! ```
//!
//! String values are escaped so that backslashes, newlines, carriage returns
//! and `=` survive the line-oriented format. Loading is deliberately lenient:
//! a missing file is an empty collection, a malformed record is skipped with
//! a warning, and unparseable numeric fields fall back to their defaults.
//! `status` is written for the curious reader but ignored on load; a loaded
//! record is always `Stopped`, because processes never survive the process
//! that spawned them.
//!
//! Saving overwrites the file in place. A crash mid-write can truncate it;
//! the format has no recovery mechanism beyond skipping broken blocks.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{info, warn};

use crate::vm::{Architecture, VmRecord, VmStatus};

// ---------------------------------------------------------------------------
// Escaping
// ---------------------------------------------------------------------------

/// Escape a string value for a single `key=value` line.
///
/// Four rules: `\` → `\\`, LF → `\n`, CR → `\r`, `=` → `\=`.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '=' => out.push_str("\\="),
            other => out.push(other),
        }
    }
    out
}

/// Exact inverse of [`escape`].
///
/// A trailing lone backslash or an unknown escape sequence is kept verbatim
/// rather than rejected; the store never fails a whole load over one value.
pub fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('=') => out.push('='),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Reads and writes the VM state file.
#[derive(Debug, Clone)]
pub struct VmStore {
    path: PathBuf,
}

impl VmStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize all records to the state file, overwriting it in place.
    pub fn save(&self, records: &[VmRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create state dir {}", parent.display()))?;
        }

        let mut contents = String::new();
        contents.push_str("# QEMU Manager VM State File\n");
        contents.push_str(&format!("# Generated on: {}\n", Local::now().to_rfc2822()));
        contents.push_str("# Format: Each VM is separated by [VM_START] and [VM_END] markers\n\n");

        for vm in records {
            write_record(&mut contents, vm);
            contents.push('\n');
        }

        std::fs::write(&self.path, contents)
            .with_context(|| format!("write state file {}", self.path.display()))?;

        info!(path = %self.path.display(), count = records.len(), "VM state saved");
        Ok(())
    }

    /// Load all records from the state file.
    ///
    /// A nonexistent file yields an empty list, not an error. Records missing
    /// a non-empty `name` are dropped with a warning and parsing continues.
    pub fn load(&self) -> Result<Vec<VmRecord>> {
        if !self.path.exists() {
            info!("no VM state file at {}; starting empty", self.path.display());
            return Ok(Vec::new());
        }

        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read state file {}", self.path.display()))?;

        let mut records = Vec::new();
        let mut block: Option<Vec<(String, String)>> = None;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match line {
                "[VM_START]" => block = Some(Vec::new()),
                "[VM_END]" => {
                    if let Some(pairs) = block.take() {
                        match parse_record(&pairs) {
                            Some(vm) => records.push(vm),
                            None => warn!("skipping VM record with missing name"),
                        }
                    }
                }
                _ => {
                    if let Some(pairs) = block.as_mut() {
                        // Keys contain no '=', so the first one is the separator.
                        if let Some((key, value)) = line.split_once('=') {
                            pairs.push((key.to_string(), value.to_string()));
                        }
                    }
                    // Text outside a block is ignored, like comments.
                }
            }
        }

        info!(count = records.len(), "loaded VM state from {}", self.path.display());
        Ok(records)
    }

    /// Delete the state file if it exists.
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("delete state file {}", self.path.display()))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Record encoding
// ---------------------------------------------------------------------------

fn write_record(out: &mut String, vm: &VmRecord) {
    let path_str =
        |p: &Option<PathBuf>| p.as_ref().map(|p| p.display().to_string()).unwrap_or_default();

    out.push_str("[VM_START]\n");
    out.push_str(&format!("name={}\n", escape(&vm.name)));
    out.push_str(&format!("diskPath={}\n", escape(&path_str(&vm.disk_path))));
    out.push_str(&format!("memoryMB={}\n", vm.memory_mb));
    out.push_str(&format!("cpuCores={}\n", vm.cpu_cores));
    out.push_str(&format!("architecture={}\n", escape(vm.architecture.as_str())));
    out.push_str(&format!("networkType={}\n", escape(&vm.network_type)));
    out.push_str(&format!("enableKvm={}\n", vm.enable_kvm));
    out.push_str(&format!("cdromPath={}\n", escape(&path_str(&vm.cdrom_path))));
    out.push_str(&format!("bootOrder={}\n", escape(&vm.boot_order)));
    out.push_str(&format!("vncPort={}\n", vm.vnc_port));
    out.push_str(&format!("status={}\n", vm.status.as_str()));
    out.push_str("[VM_END]\n");
}

/// Build a record from one block's key/value pairs, or `None` if the block
/// has no usable name.
fn parse_record(pairs: &[(String, String)]) -> Option<VmRecord> {
    let get = |key: &str| {
        pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| unescape(v))
    };

    let name = get("name")?;
    if name.trim().is_empty() {
        return None;
    }

    let mut vm = VmRecord::new(name);

    if let Some(disk) = get("diskPath").filter(|v| !v.is_empty()) {
        vm.disk_path = Some(PathBuf::from(disk));
    }
    if let Some(cdrom) = get("cdromPath").filter(|v| !v.is_empty()) {
        vm.cdrom_path = Some(PathBuf::from(cdrom));
    }

    vm.memory_mb = parse_or(&get("memoryMB"), 1024, "memoryMB");
    vm.cpu_cores = parse_or(&get("cpuCores"), 1, "cpuCores");
    vm.vnc_port = parse_or(&get("vncPort"), 5901, "vncPort");

    if let Some(arch) = get("architecture") {
        match arch.parse::<Architecture>() {
            Ok(parsed) => vm.architecture = parsed,
            Err(e) => warn!(vm = %vm.name, "{e}; falling back to x86_64"),
        }
    }
    if let Some(net) = get("networkType").filter(|v| !v.is_empty()) {
        vm.network_type = net;
    }
    if let Some(kvm) = get("enableKvm") {
        vm.enable_kvm = kvm == "true";
    }
    if let Some(boot) = get("bootOrder").filter(|v| !v.is_empty()) {
        vm.boot_order = boot;
    }

    // Whatever the file says, a freshly loaded VM has no process.
    vm.status = VmStatus::Stopped;

    Some(vm)
}

fn parse_or<T: std::str::FromStr + Copy>(value: &Option<String>, default: T, field: &str) -> T {
    match value {
        Some(v) => v.parse().unwrap_or_else(|_| {
            warn!("unparseable {field} value {v:?}; using default");
            default
        }),
        None => default,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! VM management module for qemu-manager.
//!
//! Provides the VM record model, the QEMU command builder, the flat-file
//! state store, the process supervisor with its monitoring tasks, the
//! registry that ties them together, and disk image creation via `qemu-img`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tokio::process::Child;
use tokio::sync::RwLock;

pub mod command;
pub mod disk;
pub mod registry;
pub mod store;
pub mod supervisor;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Observed lifecycle state of a VM.
///
/// `Stopping` is entered when a stop is requested and left once the process
/// has actually exited. There is no transition from `Stopping` back to
/// `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    /// No process; the VM can be started.
    Stopped,
    /// A start was requested; the process is not confirmed spawned yet.
    Starting,
    /// The QEMU process is alive.
    Running,
    /// A stop was requested and we are waiting for process exit.
    Stopping,
}

impl VmStatus {
    /// Canonical name as written into the state file (`STOPPED`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Stopped => "STOPPED",
            VmStatus::Starting => "STARTING",
            VmStatus::Running => "RUNNING",
            VmStatus::Stopping => "STOPPING",
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VmStatus::Stopped => "Stopped",
            VmStatus::Starting => "Starting",
            VmStatus::Running => "Running",
            VmStatus::Stopping => "Stopping",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Architecture
// ---------------------------------------------------------------------------

/// Guest CPU architecture; selects the QEMU machine type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Architecture {
    #[default]
    X86_64,
    I386,
    Aarch64,
    Arm,
    Mips,
    Ppc,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::I386 => "i386",
            Architecture::Aarch64 => "aarch64",
            Architecture::Arm => "arm",
            Architecture::Mips => "mips",
            Architecture::Ppc => "ppc",
        }
    }

    /// The `-machine` value QEMU expects for this architecture.
    pub fn machine_type(&self) -> &'static str {
        match self {
            Architecture::Aarch64 => "virt",
            Architecture::Arm => "versatilepb",
            Architecture::Mips => "malta",
            Architecture::Ppc => "prep",
            Architecture::X86_64 | Architecture::I386 => "pc",
        }
    }

    /// All supported architectures, in UI/display order.
    pub const ALL: [Architecture; 6] = [
        Architecture::X86_64,
        Architecture::I386,
        Architecture::Aarch64,
        Architecture::Arm,
        Architecture::Mips,
        Architecture::Ppc,
    ];
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = UnknownArchitecture;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" => Ok(Architecture::X86_64),
            "i386" => Ok(Architecture::I386),
            "aarch64" => Ok(Architecture::Aarch64),
            "arm" => Ok(Architecture::Arm),
            "mips" => Ok(Architecture::Mips),
            "ppc" => Ok(Architecture::Ppc),
            other => Err(UnknownArchitecture(other.to_string())),
        }
    }
}

/// Error for an architecture string outside the supported set.
#[derive(Debug, Clone)]
pub struct UnknownArchitecture(pub String);

impl fmt::Display for UnknownArchitecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown architecture: {}", self.0)
    }
}

impl std::error::Error for UnknownArchitecture {}

// ---------------------------------------------------------------------------
// VM record
// ---------------------------------------------------------------------------

/// Persisted configuration and transient status of one virtual machine.
///
/// The live process handle is NOT part of the record; it lives in
/// [`ManagedVm`] and is never serialized. `status` is written to the state
/// file for readability but ignored on load; a loaded record is always
/// `Stopped`.
#[derive(Debug, Clone, PartialEq)]
pub struct VmRecord {
    /// Display name, unique within the registry.
    pub name: String,

    /// Primary disk image (qcow2). `None` for diskless VMs.
    pub disk_path: Option<PathBuf>,

    /// ISO attached as CD-ROM, if any.
    pub cdrom_path: Option<PathBuf>,

    /// Memory allocation in megabytes.
    pub memory_mb: u32,

    /// Number of virtual CPU cores.
    pub cpu_cores: u32,

    /// Guest architecture; drives machine-type selection.
    pub architecture: Architecture,

    /// QEMU netdev backend: user, tap, bridge, none, ... Free-form.
    pub network_type: String,

    /// Whether to enable KVM hardware acceleration.
    pub enable_kvm: bool,

    /// QEMU boot-device string, e.g. "dc" (first CD-ROM, then disk).
    pub boot_order: String,

    /// VNC display port in [5901, 5999].
    pub vnc_port: u16,

    /// Current lifecycle status. Transient; reset to `Stopped` on load.
    pub status: VmStatus,
}

impl VmRecord {
    /// Create a record with the stock defaults for a new VM.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            disk_path: None,
            cdrom_path: None,
            memory_mb: 1024,
            cpu_cores: 1,
            architecture: Architecture::X86_64,
            network_type: "user".to_string(),
            enable_kvm: true,
            boot_order: "dc".to_string(),
            vnc_port: 5901,
            status: VmStatus::Stopped,
        }
    }

    /// User-friendly description of the network backend, for display only.
    pub fn network_description(&self) -> String {
        match self.network_type.to_lowercase().as_str() {
            "user" => "User (NAT)".to_string(),
            "tap" => "TAP Interface".to_string(),
            "bridge" => "Bridge Network".to_string(),
            "none" => "Disabled".to_string(),
            "netdev" => "Network Device".to_string(),
            _ => {
                let mut chars = self.network_type.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            }
        }
    }
}

impl fmt::Display for VmRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.status)
    }
}

// ---------------------------------------------------------------------------
// Managed VM
// ---------------------------------------------------------------------------

/// A VM under registry management: the record plus the slot for its live
/// process handle.
///
/// Both fields sit behind `RwLock`s shared with the supervisor's background
/// tasks. Status and handle transitions always go through a write lock, so
/// only one transition per VM is in flight at a time. When taking both locks,
/// the handle lock is acquired first.
#[derive(Debug, Clone)]
pub struct ManagedVm {
    /// Configuration and status. Single-writer via the write lock.
    pub record: Arc<RwLock<VmRecord>>,

    /// The QEMU child process while Running/Stopping; `None` otherwise.
    pub child: Arc<RwLock<Option<Child>>>,
}

impl ManagedVm {
    pub fn new(record: VmRecord) -> Self {
        Self {
            record: Arc::new(RwLock::new(record)),
            child: Arc::new(RwLock::new(None)),
        }
    }

    /// Snapshot of the current record.
    pub async fn snapshot(&self) -> VmRecord {
        self.record.read().await.clone()
    }

    /// Current lifecycle status.
    pub async fn status(&self) -> VmStatus {
        self.record.read().await.status
    }

    pub async fn name(&self) -> String {
        self.record.read().await.name.clone()
    }
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use registry::VmRegistry;
pub use store::VmStore;
pub use supervisor::Supervisor;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

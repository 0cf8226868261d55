//! qemu-manager: command-line manager for QEMU virtual machines.
//!
//! Keeps VM definitions in a flat state file, builds QEMU command lines from
//! them, supervises launched processes and creates disk images via qemu-img.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::time::sleep;

use qemu_manager::events::{ConsoleEvent, EventSink};
use qemu_manager::logging;
use qemu_manager::paths::ManagerPaths;
use qemu_manager::settings::Settings;
use qemu_manager::vm::disk::{self, DiskFormat, DiskSizeUnit};
use qemu_manager::vm::{
    Architecture, Supervisor, VmRecord, VmRegistry, VmStatus, VmStore, command,
};
use qemu_manager::vnc;

/// Manage QEMU virtual machines
#[derive(Parser, Debug)]
#[command(name = "qemu-manager", version, about = "Manage QEMU virtual machines")]
struct Args {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// List registered VMs
    List,

    /// Register a new VM
    Create {
        /// VM name, unique within the registry
        name: String,

        /// Disk image to attach as the primary drive
        #[arg(long)]
        disk: Option<PathBuf>,

        /// ISO image to attach as CD-ROM
        #[arg(long)]
        cdrom: Option<PathBuf>,

        /// Memory in megabytes (settings default when omitted)
        #[arg(long)]
        memory: Option<u32>,

        /// Virtual CPU cores (settings default when omitted)
        #[arg(long)]
        cpus: Option<u32>,

        /// Guest architecture (settings default when omitted)
        #[arg(long)]
        arch: Option<Architecture>,

        /// QEMU netdev backend
        #[arg(long, default_value = "user")]
        network: String,

        /// Disable KVM hardware acceleration
        #[arg(long)]
        no_kvm: bool,

        /// QEMU boot-device string
        #[arg(long, default_value = "dc")]
        boot: String,

        /// VNC display port
        #[arg(long, default_value_t = 5901)]
        vnc_port: u16,
    },

    /// Delete a VM, stopping it first if running
    Delete { name: String },

    /// Delete every VM and the state file
    Clear,

    /// Start a VM and stream its console output until it stops
    Start { name: String },

    /// Create a disk image with qemu-img
    CreateDisk {
        /// Image name; the file lands in the disks directory
        name: String,

        #[arg(long, default_value = "qcow2")]
        format: DiskFormat,

        #[arg(long, default_value_t = 20)]
        size: u64,

        /// Size unit: MB, GB or TB
        #[arg(long, default_value = "GB")]
        unit: DiskSizeUnit,
    },

    /// Launch the configured VNC viewer against a VM's display port
    Vnc { name: String },

    /// Print the QEMU command line a VM would launch with
    ShowCommand { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let paths = ManagerPaths::resolve().context("HOME is not set; cannot resolve directories")?;
    paths.ensure().context("create application directories")?;
    let _log_guard = logging::init(Some(paths.logs.clone()));

    let settings = Settings::load_or_init(&paths.settings_file());

    match args.command {
        CliCommand::List => {
            let registry = build_registry(&settings, &paths, EventSink::discard()).await?;
            let records = registry.list().await;
            if records.is_empty() {
                println!("No VMs registered.");
                return Ok(());
            }
            println!(
                "{:<20} {:<10} {:<8} {:>8} {:>5} {:>6}  NETWORK",
                "NAME", "STATUS", "ARCH", "MEM(MB)", "CPUS", "VNC"
            );
            for r in records {
                println!(
                    "{:<20} {:<10} {:<8} {:>8} {:>5} {:>6}  {}",
                    r.name,
                    r.status,
                    r.architecture,
                    r.memory_mb,
                    r.cpu_cores,
                    r.vnc_port,
                    r.network_description(),
                );
            }
        }

        CliCommand::Create {
            name,
            disk,
            cdrom,
            memory,
            cpus,
            arch,
            network,
            no_kvm,
            boot,
            vnc_port,
        } => {
            let (sink, rx) = EventSink::channel();
            let printer = spawn_console_printer(rx);
            let registry = build_registry(&settings, &paths, sink.clone()).await?;

            let mut record = VmRecord::new(name);
            record.disk_path = disk;
            record.cdrom_path = cdrom;
            record.memory_mb = memory.unwrap_or(settings.default_memory_mb);
            record.cpu_cores = cpus.unwrap_or(settings.default_cpu_cores);
            record.architecture = match arch {
                Some(a) => a,
                None => settings
                    .default_architecture
                    .parse()
                    .unwrap_or(Architecture::X86_64),
            };
            record.network_type = network;
            record.enable_kvm = !no_kvm;
            record.boot_order = boot;
            record.vnc_port = vnc_port;

            registry.add(record).await?;
            drain(registry, sink, printer).await;
        }

        CliCommand::Delete { name } => {
            let (sink, rx) = EventSink::channel();
            let printer = spawn_console_printer(rx);
            let registry = build_registry(&settings, &paths, sink.clone()).await?;
            registry.remove(&name).await?;
            drain(registry, sink, printer).await;
        }

        CliCommand::Clear => {
            let (sink, rx) = EventSink::channel();
            let printer = spawn_console_printer(rx);
            let registry = build_registry(&settings, &paths, sink.clone()).await?;
            registry.clear().await?;
            drain(registry, sink, printer).await;
        }

        CliCommand::Vnc { name } => {
            let registry = build_registry(&settings, &paths, EventSink::discard()).await?;
            let Some(vm) = registry.find(&name).await else {
                anyhow::bail!("no VM named '{name}'");
            };
            let port = vm.snapshot().await.vnc_port;
            let viewer = vnc::resolve_viewer(&settings.vnc_viewer_path).await?;
            vnc::connect(&viewer, port).await?;
            println!("Connecting to VM: {name} via VNC on port {port}");
        }

        CliCommand::Start { name } => {
            let (sink, rx) = EventSink::channel();
            let printer = spawn_console_printer(rx);
            let registry = Arc::new(build_registry(&settings, &paths, sink.clone()).await?);

            let vm = registry.start(&name).await?;

            // Ctrl-C requests a graceful stop; the loop below then waits for
            // the process to actually go away.
            let interrupt = {
                let registry = registry.clone();
                let sink = sink.clone();
                let name = name.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        sink.emit(format!("Interrupt received; stopping VM: {name}"));
                        let _ = registry.stop(&name).await;
                    }
                })
            };

            while vm.status().await != VmStatus::Stopped {
                sleep(Duration::from_millis(200)).await;
            }

            interrupt.abort();
            drain(registry, sink, printer).await;
        }

        CliCommand::CreateDisk {
            name,
            format,
            size,
            unit,
        } => {
            let path = paths.disks.join(format!("{name}.{}", format.extension()));
            disk::create_disk(&settings.qemu_img_path, format, &path, size, unit).await?;
            println!("Created disk image: {}", path.display());
        }

        CliCommand::ShowCommand { name } => {
            let registry = build_registry(&settings, &paths, EventSink::discard()).await?;
            let Some(vm) = registry.find(&name).await else {
                anyhow::bail!("no VM named '{name}'");
            };
            let record = vm.snapshot().await;
            let launch_args = command::build_launch_args(&record, &settings.qemu_path);
            println!("{}", launch_args.join(" "));
        }
    }

    Ok(())
}

/// Wire up the registry and load the state file.
async fn build_registry(
    settings: &Settings,
    paths: &ManagerPaths,
    sink: EventSink,
) -> Result<VmRegistry> {
    let supervisor = Supervisor::new(settings.qemu_path.clone(), sink.clone());
    let store = VmStore::new(paths.state_file());
    let registry = VmRegistry::new(supervisor, store, sink);
    registry.load().await.context("load VM state file")?;
    Ok(registry)
}

/// Print console events as they arrive, until every sender is gone.
fn spawn_console_printer(
    mut rx: mpsc::UnboundedReceiver<ConsoleEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            println!("{}", event.format_line());
        }
    })
}

/// Release every sink sender and let the printer flush what is queued.
///
/// Lingering supervisor tasks hold sink clones for up to one poll interval
/// after a VM stops, hence the timeout instead of a bare join.
async fn drain<R>(registry: R, sink: EventSink, printer: tokio::task::JoinHandle<()>) {
    drop(registry);
    drop(sink);
    let _ = tokio::time::timeout(Duration::from_secs(2), printer).await;
}

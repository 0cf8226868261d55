//! QEMU command-line construction.
//!
//! Pure functions mapping a [`VmRecord`] to the argument vector of the QEMU
//! system emulator. No I/O happens here; the same record always produces the
//! same vector, which is what the unit tests lean on.

use std::path::Path;

use crate::vm::{Architecture, VmRecord};

/// Build the full QEMU invocation for a VM, binary path included.
///
/// Element 0 is the emulator binary; the rest are its arguments in a fixed
/// order: machine type (non-x86_64 only), memory, SMP, CPU/KVM selection,
/// drive, CD-ROM, boot order, network pair, VNC display, and the fixed
/// display/USB/monitor tail.
pub fn build_launch_args(vm: &VmRecord, qemu_path: &Path) -> Vec<String> {
    let mut args = Vec::new();

    args.push(qemu_path.display().to_string());

    // x86_64 uses QEMU's default machine; everything else is explicit.
    if vm.architecture != Architecture::X86_64 {
        args.push("-machine".to_string());
        args.push(vm.architecture.machine_type().to_string());
    }

    args.push("-m".to_string());
    args.push(vm.memory_mb.to_string());

    args.push("-smp".to_string());
    args.push(vm.cpu_cores.to_string());

    if vm.enable_kvm {
        args.push("-enable-kvm".to_string());
        args.push("-cpu".to_string());
        args.push("host".to_string());
    } else {
        args.push("-cpu".to_string());
        args.push("qemu64".to_string());
    }

    if let Some(disk) = &vm.disk_path {
        args.push("-drive".to_string());
        args.push(format!("file={},format=qcow2", disk.display()));
    }

    if let Some(cdrom) = &vm.cdrom_path {
        args.push("-cdrom".to_string());
        args.push(cdrom.display().to_string());
    }

    args.push("-boot".to_string());
    args.push(vm.boot_order.clone());

    args.push("-netdev".to_string());
    args.push(format!("{},id=net0", vm.network_type));
    args.push("-device".to_string());
    args.push("e1000,netdev=net0".to_string());

    // VNC takes a display number, not a port.
    args.push("-vnc".to_string());
    args.push(format!(":{}", vm.vnc_port.saturating_sub(5900)));

    args.push("-vga".to_string());
    args.push("std".to_string());
    args.push("-usb".to_string());
    args.push("-device".to_string());
    args.push("usb-tablet".to_string());
    args.push("-monitor".to_string());
    args.push("stdio".to_string());

    args
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

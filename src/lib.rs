//! qemu-manager: a small manager for QEMU virtual machines.
//!
//! The crate keeps a registry of VM definitions in a flat state file,
//! builds QEMU command lines from them, supervises the launched processes
//! (output forwarding, exit detection, graceful stop with a kill fallback)
//! and creates disk images through `qemu-img`.

pub mod events;
pub mod logging;
pub mod paths;
pub mod settings;
pub mod vm;
pub mod vnc;

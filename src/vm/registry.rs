//! The VM registry: the in-memory collection of managed VMs, wired to the
//! supervisor for process control and to the store for persistence.
//!
//! All mutations of the collection go through the registry, which persists
//! after each one. A persistence failure never rolls back the in-memory
//! change; it is logged and reported to the sink, and the next successful
//! save catches up.

use anyhow::{Result, bail};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::events::EventSink;
use crate::vm::{ManagedVm, Supervisor, VmRecord, VmStatus, VmStore};

pub struct VmRegistry {
    vms: RwLock<Vec<ManagedVm>>,
    supervisor: Supervisor,
    store: VmStore,
    sink: EventSink,
}

impl VmRegistry {
    pub fn new(supervisor: Supervisor, store: VmStore, sink: EventSink) -> Self {
        Self {
            vms: RwLock::new(Vec::new()),
            supervisor,
            store,
            sink,
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Replace the collection with the records from the state file.
    ///
    /// Meant for startup, before any VM is running; live handles of VMs
    /// already in the collection would be discarded.
    pub async fn load(&self) -> Result<usize> {
        let records = self.store.load()?;
        let count = records.len();

        let mut vms = self.vms.write().await;
        *vms = records.into_iter().map(ManagedVm::new).collect();

        debug!(count, path = %self.store.path().display(), "registry loaded");
        Ok(count)
    }

    /// Write the current records to the state file. Failures are reported,
    /// not propagated: a broken disk should not take the running VMs with it.
    pub async fn persist(&self) {
        let mut records = Vec::new();
        for vm in self.vms.read().await.iter() {
            records.push(vm.snapshot().await);
        }
        if let Err(e) = self.store.save(&records) {
            warn!("failed to save VM state: {e:#}");
            self.sink.emit(format!("Failed to save VM state: {e}"));
        }
    }

    // -----------------------------------------------------------------------
    // Collection management
    // -----------------------------------------------------------------------

    /// Register a new VM. Names are unique; a duplicate is rejected.
    pub async fn add(&self, record: VmRecord) -> Result<ManagedVm> {
        if record.name.trim().is_empty() {
            bail!("VM name must not be empty");
        }

        let vm = {
            let mut vms = self.vms.write().await;
            for existing in vms.iter() {
                if existing.name().await == record.name {
                    bail!("a VM named '{}' already exists", record.name);
                }
            }
            let vm = ManagedVm::new(record);
            vms.push(vm.clone());
            vm
        };

        let name = vm.name().await;
        info!(vm = %name, "VM created");
        self.sink.emit(format!("Created VM: {name}"));
        self.persist().await;
        Ok(vm)
    }

    /// Remove a VM by name, stopping it first if it is running.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let Some(vm) = self.find(name).await else {
            bail!("no VM named '{name}'");
        };

        if vm.status().await == VmStatus::Running {
            self.supervisor.stop(&vm).await;
        }

        {
            let mut vms = self.vms.write().await;
            let mut i = 0;
            while i < vms.len() {
                if vms[i].record.read().await.name == name {
                    vms.remove(i);
                } else {
                    i += 1;
                }
            }
        }

        info!(vm = %name, "VM deleted");
        self.sink.emit(format!("Deleted VM: {name}"));
        self.persist().await;
        Ok(())
    }

    /// Drop every VM and delete the state file, stopping running VMs first.
    pub async fn clear(&self) -> Result<()> {
        let vms: Vec<ManagedVm> = self.vms.write().await.drain(..).collect();
        for vm in &vms {
            if vm.status().await == VmStatus::Running {
                self.supervisor.stop(vm).await;
            }
        }
        self.store.clear()?;

        info!(count = vms.len(), "all VMs cleared");
        self.sink.emit("All VMs cleared and state file deleted");
        Ok(())
    }

    /// Look up a VM by name.
    pub async fn find(&self, name: &str) -> Option<ManagedVm> {
        for vm in self.vms.read().await.iter() {
            if vm.record.read().await.name == name {
                return Some(vm.clone());
            }
        }
        None
    }

    /// Snapshots of every record, in registration order.
    pub async fn list(&self) -> Vec<VmRecord> {
        let mut records = Vec::new();
        for vm in self.vms.read().await.iter() {
            records.push(vm.snapshot().await);
        }
        records
    }

    pub async fn len(&self) -> usize {
        self.vms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.vms.read().await.is_empty()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start a VM by name. The handle is returned so callers can watch it.
    pub async fn start(&self, name: &str) -> Result<ManagedVm> {
        let Some(vm) = self.find(name).await else {
            bail!("no VM named '{name}'");
        };
        // A stale Running status from a crashed process would block the
        // start, so resync first.
        self.supervisor.reconcile(&vm).await;
        self.supervisor.start(&vm).await?;
        Ok(vm)
    }

    /// Request a graceful stop of a VM by name.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let Some(vm) = self.find(name).await else {
            bail!("no VM named '{name}'");
        };
        self.supervisor.stop(&vm).await;
        Ok(())
    }

    /// Resync every record with its actual process state.
    pub async fn reconcile_all(&self) {
        for vm in self.vms.read().await.iter() {
            self.supervisor.reconcile(vm).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

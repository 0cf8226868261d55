//! VM process lifecycle management.
//!
//! ## Architecture
//!
//! ```text
//! Supervisor::start(vm)
//!     └─► tokio::process::Command  →  qemu child process
//!             ├─► output-monitor tasks  (stdout + stderr → EventSink)
//!             ├─► exit-wait task        (polls try_wait, flips status on exit)
//!             └─► Supervisor::stop(vm)  (SIGTERM, bounded wait, then SIGKILL)
//! ```
//!
//! All background tasks for one VM share its `Arc<RwLock<Option<Child>>>`;
//! status and handle mutations happen under the write locks, so only one
//! transition per VM is ever in flight. The output monitors never touch the
//! handle; they own the piped streams outright and end naturally when the
//! process exits and the pipes close.
//!
//! Task count grows linearly with running VMs (two monitors plus one exit
//! observer each, plus a transient task per stop request). There is no pool
//! or cap; at human-operated VM counts that is the intended trade-off.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::events::EventSink;
use crate::vm::command::build_launch_args;
use crate::vm::{ManagedVm, VmStatus};

/// How long `stop` waits for a graceful exit before force-killing.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

/// Polling interval of the exit-wait observer.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Polling interval while waiting out the stop grace period.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Starts and stops QEMU processes and keeps their records truthful.
#[derive(Debug, Clone)]
pub struct Supervisor {
    qemu_path: PathBuf,
    stop_grace: Duration,
    sink: EventSink,
}

impl Supervisor {
    pub fn new(qemu_path: impl Into<PathBuf>, sink: EventSink) -> Self {
        Self {
            qemu_path: qemu_path.into(),
            stop_grace: STOP_GRACE,
            sink,
        }
    }

    /// Override the graceful-stop bound. Tests use a short grace so the
    /// force-kill path doesn't take ten real seconds.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Launch the QEMU process for a VM.
    ///
    /// A VM that is not `Stopped` is left alone: already-running is reported
    /// to the sink as a notice, an in-flight transition is skipped quietly.
    /// On spawn failure the record reverts to `Stopped` and the error is both
    /// sunk and returned.
    pub async fn start(&self, vm: &ManagedVm) -> Result<()> {
        let (name, args) = {
            let mut record = vm.record.write().await;
            match record.status {
                VmStatus::Running => {
                    self.sink
                        .emit(format!("VM '{}' is already running", record.name));
                    return Ok(());
                }
                VmStatus::Starting | VmStatus::Stopping => {
                    debug!(vm = %record.name, status = %record.status, "start skipped during transition");
                    return Ok(());
                }
                VmStatus::Stopped => {}
            }
            record.status = VmStatus::Starting;
            (record.name.clone(), build_launch_args(&record, &self.qemu_path))
        };

        debug!(vm = %name, ?args, "spawning qemu");

        let spawned = Command::new(&args[0])
            .args(&args[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                vm.record.write().await.status = VmStatus::Stopped;
                self.sink
                    .emit(format!("Failed to start VM {name}: {e}"));
                return Err(e).with_context(|| format!("spawn qemu for VM '{name}'"));
            }
        };

        // The monitors own the pipes; the shared slot owns the child itself.
        if let Some(stdout) = child.stdout.take() {
            spawn_output_monitor(self.sink.clone(), name.clone(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_output_monitor(self.sink.clone(), name.clone(), stderr);
        }

        *vm.child.write().await = Some(child);
        vm.record.write().await.status = VmStatus::Running;

        info!(vm = %name, "VM started");
        self.sink.emit(format!("Started VM: {name}"));

        self.spawn_exit_wait(name, vm.clone());
        Ok(())
    }

    /// Request a graceful stop.
    ///
    /// No-op unless the VM is `Running` with a live handle. Sets `Stopping`
    /// and returns immediately; the actual terminate/wait/kill sequence runs
    /// in a background task.
    pub async fn stop(&self, vm: &ManagedVm) {
        // Check and transition under one write lock (handle lock first) so a
        // concurrent stop or exit-wait completion cannot slip in between and
        // cause a duplicate stop task.
        let name = {
            let child = vm.child.read().await;
            let mut record = vm.record.write().await;
            if record.status != VmStatus::Running || child.is_none() {
                debug!(vm = %record.name, status = %record.status, "stop is a no-op");
                return;
            }
            record.status = VmStatus::Stopping;
            record.name.clone()
        };

        let sink = self.sink.clone();
        let grace = self.stop_grace;
        let vm = vm.clone();

        tokio::spawn(async move {
            graceful_stop(vm, name, grace, sink).await;
        });
    }

    /// Synchronous status poll: if the handle is present but the process has
    /// exited, clear the handle and mark the record `Stopped`.
    pub async fn reconcile(&self, vm: &ManagedVm) {
        let mut guard = vm.child.write().await;
        let Some(child) = guard.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                *guard = None;
                drop(guard);
                let mut record = vm.record.write().await;
                record.status = VmStatus::Stopped;
                debug!(vm = %record.name, ?status, "reconcile observed process exit");
            }
            Ok(None) => {}
            Err(e) => {
                warn!("try_wait failed during reconcile: {e}");
            }
        }
    }

    /// Spawn the long-lived observer that notices the process dying on its
    /// own (crash, guest shutdown, external kill).
    fn spawn_exit_wait(&self, name: String, vm: ManagedVm) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            loop {
                sleep(EXIT_POLL_INTERVAL).await;

                let mut guard = vm.child.write().await;
                let Some(child) = guard.as_mut() else {
                    // The stop task already reaped and cleared the handle.
                    return;
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        *guard = None;
                        drop(guard);
                        vm.record.write().await.status = VmStatus::Stopped;

                        let what = match status.code() {
                            Some(code) => format!("exit code: {code}"),
                            None => format!("{status}"),
                        };
                        info!(vm = %name, %what, "VM process terminated");
                        sink.emit(format!("[{name}] Process terminated with {what}"));
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(vm = %name, "try_wait error in exit observer: {e}");
                    }
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Background task bodies
// ---------------------------------------------------------------------------

/// Forward one piped output stream to the sink, line by line, until the
/// stream closes. An I/O error is reported once and ends the task; the
/// process itself is unaffected.
fn spawn_output_monitor<R>(sink: EventSink, name: String, stream: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => sink.emit(format!("[{name}] {line}")),
                Ok(None) => break,
                Err(e) => {
                    sink.emit(format!("[{name}] Error reading process output: {e}"));
                    break;
                }
            }
        }
        debug!(vm = %name, "output monitor finished");
    });
}

/// SIGTERM, bounded wait, SIGKILL escalation.
///
/// Whatever the path, once the process is gone the handle is cleared, the
/// record goes `Stopped`, and the sink is notified. If even the forced kill
/// fails, the record intentionally stays `Stopping` with its handle in
/// place: the exit observer keeps polling and will complete the transition
/// if the process eventually dies.
async fn graceful_stop(vm: ManagedVm, name: String, grace: Duration, sink: EventSink) {
    let pid = vm.child.read().await.as_ref().and_then(|c| c.id());

    if let Some(pid) = pid {
        // SIGTERM lets QEMU shut the guest down cleanly.
        match Command::new("kill").arg(pid.to_string()).status().await {
            Ok(status) if !status.success() => {
                warn!(vm = %name, pid, "kill(TERM) exited with {status}");
            }
            Err(e) => warn!(vm = %name, pid, "failed to run kill: {e}"),
            Ok(_) => {}
        }
    }

    let deadline = Instant::now() + grace;
    loop {
        {
            let mut guard = vm.child.write().await;
            let Some(child) = guard.as_mut() else {
                // The exit observer won the race and already cleaned up.
                break;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(vm = %name, ?status, "VM exited within grace period");
                    *guard = None;
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(vm = %name, "try_wait error while stopping: {e}");
                }
            }

            if Instant::now() >= deadline {
                warn!(vm = %name, "VM did not exit within {:?}, killing", grace);
                match child.kill().await {
                    Ok(()) => {
                        *guard = None;
                        break;
                    }
                    Err(e) => {
                        // Do not pretend the process is gone.
                        sink.emit(format!(
                            "[{name}] Failed to force-kill VM process: {e}; it may still be running"
                        ));
                        warn!(vm = %name, "force kill failed: {e}");
                        return;
                    }
                }
            }
        }

        sleep(STOP_POLL_INTERVAL).await;
    }

    vm.record.write().await.status = VmStatus::Stopped;
    info!(vm = %name, "VM stopped");
    sink.emit(format!("Stopped VM: {name}"));
}

//! End-to-end lifecycle tests against real child processes.
//!
//! Small shell scripts stand in for the QEMU binary; they accept (and
//! ignore) the generated command line, which lets the supervisor run its
//! full start/monitor/stop machinery without QEMU installed.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};

use qemu_manager::events::{ConsoleEvent, EventSink};
use qemu_manager::vm::{ManagedVm, Supervisor, VmRecord, VmRegistry, VmStatus, VmStore};

/// Write an executable shell script into `dir` and return its path.
fn script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Poll until the VM reaches `want`, failing the test after `within`.
async fn wait_for_status(vm: &ManagedVm, want: VmStatus, within: Duration) {
    let deadline = Instant::now() + within;
    loop {
        let status = vm.status().await;
        if status == want {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "VM stuck at {status}, wanted {want}"
        );
        sleep(Duration::from_millis(50)).await;
    }
}

/// Drain whatever events are currently queued.
fn drain_events(rx: &mut mpsc::UnboundedReceiver<ConsoleEvent>) -> Vec<String> {
    let mut messages = Vec::new();
    while let Ok(event) = rx.try_recv() {
        messages.push(event.message);
    }
    messages
}

#[tokio::test]
async fn process_exit_is_detected_and_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let qemu = script(tmp.path(), "fake-qemu", "exit 7");

    let (sink, mut rx) = EventSink::channel();
    let supervisor = Supervisor::new(qemu, sink);
    let vm = ManagedVm::new(VmRecord::new("short-lived"));

    supervisor.start(&vm).await.unwrap();
    wait_for_status(&vm, VmStatus::Stopped, Duration::from_secs(5)).await;

    assert!(vm.child.read().await.is_none(), "handle must be cleared");
    let messages = drain_events(&mut rx);
    assert!(
        messages
            .iter()
            .any(|m| m.contains("Process terminated with exit code: 7")),
        "missing exit notification in {messages:?}"
    );
}

#[tokio::test]
async fn start_is_a_noop_while_running() {
    let tmp = tempfile::tempdir().unwrap();
    let qemu = script(tmp.path(), "fake-qemu", "sleep 30");

    let (sink, mut rx) = EventSink::channel();
    let supervisor = Supervisor::new(qemu, sink).with_stop_grace(Duration::from_millis(300));
    let vm = ManagedVm::new(VmRecord::new("busy"));

    supervisor.start(&vm).await.unwrap();
    assert_eq!(vm.status().await, VmStatus::Running);
    drain_events(&mut rx);

    // Second start must not spawn anything or disturb the status.
    supervisor.start(&vm).await.unwrap();
    assert_eq!(vm.status().await, VmStatus::Running);
    let messages = drain_events(&mut rx);
    assert!(
        messages.iter().any(|m| m.contains("already running")),
        "expected already-running notice in {messages:?}"
    );

    supervisor.stop(&vm).await;
    wait_for_status(&vm, VmStatus::Stopped, Duration::from_secs(5)).await;
}

#[tokio::test]
async fn stop_on_a_stopped_vm_is_a_noop() {
    let (sink, mut rx) = EventSink::channel();
    let supervisor = Supervisor::new("/nonexistent/qemu", sink);
    let vm = ManagedVm::new(VmRecord::new("idle"));

    supervisor.stop(&vm).await;
    sleep(Duration::from_millis(100)).await;

    assert_eq!(vm.status().await, VmStatus::Stopped);
    assert!(drain_events(&mut rx).is_empty());
}

#[tokio::test]
async fn spawn_failure_reverts_to_stopped() {
    let (sink, mut rx) = EventSink::channel();
    let supervisor = Supervisor::new("/nonexistent/qemu", sink);
    let vm = ManagedVm::new(VmRecord::new("broken"));

    assert!(supervisor.start(&vm).await.is_err());
    assert_eq!(vm.status().await, VmStatus::Stopped);
    assert!(vm.child.read().await.is_none());

    let messages = drain_events(&mut rx);
    assert!(
        messages.iter().any(|m| m.contains("Failed to start VM")),
        "missing failure notification in {messages:?}"
    );
}

#[tokio::test]
async fn graceful_stop_completes_on_sigterm() {
    let tmp = tempfile::tempdir().unwrap();
    let qemu = script(
        tmp.path(),
        "fake-qemu",
        "trap 'exit 0' TERM\nwhile true; do sleep 0.1; done",
    );

    let (sink, mut rx) = EventSink::channel();
    let supervisor = Supervisor::new(qemu, sink);
    let vm = ManagedVm::new(VmRecord::new("polite"));

    supervisor.start(&vm).await.unwrap();
    supervisor.stop(&vm).await;
    wait_for_status(&vm, VmStatus::Stopped, Duration::from_secs(5)).await;

    assert!(vm.child.read().await.is_none());
    let messages = drain_events(&mut rx);
    assert!(
        messages.iter().any(|m| m.contains("Stopped VM: polite")),
        "missing stop notification in {messages:?}"
    );
}

#[tokio::test]
async fn stubborn_process_is_killed_after_the_grace_period() {
    let tmp = tempfile::tempdir().unwrap();
    // Ignores SIGTERM outright; only SIGKILL gets rid of it.
    let qemu = script(tmp.path(), "fake-qemu", "trap '' TERM\nsleep 30");

    let (sink, _rx) = EventSink::channel();
    let supervisor = Supervisor::new(qemu, sink).with_stop_grace(Duration::from_millis(400));
    let vm = ManagedVm::new(VmRecord::new("stubborn"));

    supervisor.start(&vm).await.unwrap();
    supervisor.stop(&vm).await;

    let begin = Instant::now();
    wait_for_status(&vm, VmStatus::Stopped, Duration::from_secs(5)).await;
    assert!(
        begin.elapsed() >= Duration::from_millis(400),
        "stop must wait out the grace period before killing"
    );
    assert!(vm.child.read().await.is_none());
}

#[tokio::test]
async fn console_output_is_forwarded_with_the_vm_name() {
    let tmp = tempfile::tempdir().unwrap();
    let qemu = script(
        tmp.path(),
        "fake-qemu",
        "echo booting\necho 'warning: no cable' >&2",
    );

    let (sink, mut rx) = EventSink::channel();
    let supervisor = Supervisor::new(qemu, sink);
    let vm = ManagedVm::new(VmRecord::new("chatty"));

    supervisor.start(&vm).await.unwrap();
    wait_for_status(&vm, VmStatus::Stopped, Duration::from_secs(5)).await;

    let messages = drain_events(&mut rx);
    assert!(messages.iter().any(|m| m == "[chatty] booting"));
    assert!(messages.iter().any(|m| m == "[chatty] warning: no cable"));
}

#[tokio::test]
async fn removing_a_running_vm_stops_its_process() {
    let tmp = tempfile::tempdir().unwrap();
    let qemu = script(tmp.path(), "fake-qemu", "sleep 30");

    let (sink, _rx) = EventSink::channel();
    let supervisor =
        Supervisor::new(qemu, sink.clone()).with_stop_grace(Duration::from_millis(500));
    let store = VmStore::new(tmp.path().join("vms.txt"));
    let registry = VmRegistry::new(supervisor, store, sink);

    registry.add(VmRecord::new("doomed")).await.unwrap();
    let vm = registry.start("doomed").await.unwrap();
    let pid = vm
        .child
        .read()
        .await
        .as_ref()
        .and_then(|c| c.id())
        .expect("running VM must have a pid");

    registry.remove("doomed").await.unwrap();
    assert!(registry.find("doomed").await.is_none());

    // The stop runs in the background; the process must die shortly after.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let alive = std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !alive {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "process {pid} still alive after removal"
        );
        sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn repeated_stop_requests_yield_one_stop_notification() {
    let tmp = tempfile::tempdir().unwrap();
    let qemu = script(
        tmp.path(),
        "fake-qemu",
        "trap 'exit 0' TERM\nwhile true; do sleep 0.1; done",
    );

    let (sink, mut rx) = EventSink::channel();
    let supervisor = Supervisor::new(qemu, sink);
    let vm = ManagedVm::new(VmRecord::new("once"));

    supervisor.start(&vm).await.unwrap();

    // Only the first request may transition to Stopping and spawn a stop
    // task; the rest must bounce off the atomic status check.
    supervisor.stop(&vm).await;
    supervisor.stop(&vm).await;
    supervisor.stop(&vm).await;
    wait_for_status(&vm, VmStatus::Stopped, Duration::from_secs(5)).await;

    // Let any stragglers finish before counting.
    sleep(Duration::from_millis(600)).await;
    let messages = drain_events(&mut rx);
    let stops = messages
        .iter()
        .filter(|m| m.as_str() == "Stopped VM: once")
        .count();
    assert_eq!(stops, 1, "expected exactly one stop notice in {messages:?}");
}

#[tokio::test]
async fn reconcile_clears_a_dead_process() {
    let tmp = tempfile::tempdir().unwrap();
    let qemu = script(tmp.path(), "fake-qemu", "exit 0");

    let (sink, _rx) = EventSink::channel();
    let supervisor = Supervisor::new(qemu, sink);
    let vm = ManagedVm::new(VmRecord::new("gone"));

    supervisor.start(&vm).await.unwrap();
    // Give the script time to exit, then resync explicitly.
    sleep(Duration::from_millis(300)).await;
    supervisor.reconcile(&vm).await;

    assert_eq!(vm.status().await, VmStatus::Stopped);
    assert!(vm.child.read().await.is_none());
}

//! Supervision of portal OS processes.
//!
//! One state machine per portal id:
//!
//! ```text
//! NOT_DEPLOYED → STOPPED → STARTING → RUNNING
//!                   ↑          │         │
//!                   └─ STOPPING ┴────────┘      (stop)
//!                   FAILED ← abnormal exit from STARTING/RUNNING
//! ```
//!
//! A spawned process is confirmed RUNNING once it has survived the startup
//! grace period; a monitor task then keeps polling for exit. `status` also
//! reconciles with `try_wait`, so a process that died between checks is
//! reported immediately instead of as a stale RUNNING.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use crate::errors::PortalError;
use crate::message::{Message, MessageBus, topics};

use super::{PortalFileSystem, PortalId, RunState};

/// Last observed run state plus process metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStatus {
    pub portal_id: PortalId,
    pub state: RunState,
    /// Port from the generated settings; populated while running.
    pub port: Option<u16>,
}

struct ProcessEntry {
    state: watch::Sender<RunState>,
    child: Option<Child>,
    /// True while an intentional stop is in progress, so the exit is
    /// reported STOPPED rather than FAILED.
    stopping: bool,
}

impl ProcessEntry {
    fn new() -> Self {
        let (state, _) = watch::channel(RunState::Stopped);
        Self {
            state,
            child: None,
            stopping: false,
        }
    }

    fn current(&self) -> RunState {
        *self.state.borrow()
    }

    fn set_state(&self, state: RunState) {
        self.state.send_replace(state);
    }
}

struct ExecutorInner {
    fs: PortalFileSystem,
    bus: Arc<MessageBus>,
    startup_grace: Duration,
    poll_interval: Duration,
    entries: Mutex<HashMap<PortalId, ProcessEntry>>,
}

/// Cheap-to-clone handle; all clones share one process table.
#[derive(Clone)]
pub struct PortalExecutor {
    inner: Arc<ExecutorInner>,
}

impl PortalExecutor {
    pub fn new(
        fs: PortalFileSystem,
        bus: Arc<MessageBus>,
        startup_grace: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                fs,
                bus,
                startup_grace,
                poll_interval,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Non-blocking view of a portal's run state.
    pub async fn status(&self, id: PortalId) -> RunStatus {
        let mut entries = self.inner.entries.lock().await;
        let state = match entries.get_mut(&id) {
            Some(entry) => {
                self.reconcile(id, entry);
                let state = entry.current();
                if entry.child.is_none() && !self.inner.fs.script_file(id).exists() {
                    RunState::NotDeployed
                } else {
                    state
                }
            }
            None if self.inner.fs.script_file(id).exists() => RunState::Stopped,
            None => RunState::NotDeployed,
        };

        let port = if state == RunState::Running {
            self.configured_port(id)
        } else {
            None
        };
        RunStatus {
            portal_id: id,
            state,
            port,
        }
    }

    /// Launch the portal's script and block until the process is confirmed
    /// RUNNING or has FAILED. A no-op if already starting or running.
    pub async fn start(&self, id: PortalId) -> Result<(), PortalError> {
        let mut rx = self.spawn_portal(id).await?;
        loop {
            let state = *rx.borrow_and_update();
            match state {
                RunState::Starting => {
                    rx.changed().await.map_err(|_| PortalError::Process {
                        id,
                        message: "executor shut down while starting".to_string(),
                    })?;
                }
                RunState::Running => return Ok(()),
                other => {
                    return Err(PortalError::Process {
                        id,
                        message: format!("process did not start (state: {other})"),
                    });
                }
            }
        }
    }

    /// Launch without waiting; the RUNNING/FAILED transition happens on the
    /// monitor task and is visible through [`status`](Self::status).
    pub fn start_async(&self, id: PortalId) {
        let executor = self.clone();
        tokio::spawn(async move {
            if let Err(e) = executor.start(id).await {
                warn!(id, error = %e, "async start failed");
            }
        });
    }

    /// Terminate the portal's process and block until it has fully exited.
    /// A no-op if nothing is running.
    pub async fn stop(&self, id: PortalId) -> Result<(), PortalError> {
        let mut entries = self.inner.entries.lock().await;
        let Some(entry) = entries.get_mut(&id) else {
            return Ok(());
        };
        if entry.child.is_none() {
            return Ok(());
        }

        info!(id, "stopping portal process");
        entry.stopping = true;
        entry.set_state(RunState::Stopping);
        self.publish_execution(id, "stop", "terminating");

        let child = entry.child.as_mut().unwrap();
        child.kill().await.map_err(|e| PortalError::Process {
            id,
            message: format!("failed to kill process: {e}"),
        })?;

        entry.child = None;
        entry.stopping = false;
        entry.set_state(RunState::Stopped);
        self.publish_execution(id, "stop", "stopped");
        Ok(())
    }

    /// Terminate without waiting for the exit.
    pub fn stop_async(&self, id: PortalId) {
        let executor = self.clone();
        tokio::spawn(async move {
            if let Err(e) = executor.stop(id).await {
                warn!(id, error = %e, "async stop failed");
            }
        });
    }

    /// Stop then start, preserving portal identity.
    pub async fn restart(&self, id: PortalId) -> Result<(), PortalError> {
        self.stop(id).await?;
        self.start(id).await
    }

    pub fn restart_async(&self, id: PortalId) {
        let executor = self.clone();
        tokio::spawn(async move {
            if let Err(e) = executor.restart(id).await {
                warn!(id, error = %e, "async restart failed");
            }
        });
    }

    // ── Internals ─────────────────────────────────────────────────────

    /// Spawn the launch script if no live process exists, returning a watch
    /// on the entry's state.
    async fn spawn_portal(
        &self,
        id: PortalId,
    ) -> Result<watch::Receiver<RunState>, PortalError> {
        let mut entries = self.inner.entries.lock().await;
        let entry = entries.entry(id).or_insert_with(ProcessEntry::new);
        self.reconcile(id, entry);

        if entry.current().is_active() {
            // Already starting or running; never spawn a duplicate.
            return Ok(entry.state.subscribe());
        }

        let script = self.inner.fs.script_file(id);
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.inner.fs.log_file(id))
            .map_err(|e| PortalError::Process {
                id,
                message: format!("failed to open log file: {e}"),
            })?;
        let log_err = log.try_clone().map_err(|e| PortalError::Process {
            id,
            message: format!("failed to clone log handle: {e}"),
        })?;

        info!(id, script = %script.display(), "starting portal process");
        let spawned = Command::new(&script)
            .current_dir(self.inner.fs.root_dir(id))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                entry.set_state(RunState::Failed);
                self.publish_execution(id, "start", &format!("spawn failed: {e}"));
                return Err(PortalError::Process {
                    id,
                    message: format!("failed to spawn {}: {e}", script.display()),
                });
            }
        };

        let pid = child.id();
        entry.child = Some(child);
        entry.stopping = false;
        entry.set_state(RunState::Starting);
        self.publish_execution(
            id,
            "start",
            &pid.map_or_else(|| "spawned".to_string(), |pid| format!("pid {pid}")),
        );

        let rx = entry.state.subscribe();
        let executor = self.clone();
        tokio::spawn(async move { executor.monitor(id).await });
        Ok(rx)
    }

    /// Background worker driving the STARTING→RUNNING transition and
    /// watching for exit afterwards.
    async fn monitor(self, id: PortalId) {
        tokio::time::sleep(self.inner.startup_grace).await;
        loop {
            {
                let mut entries = self.inner.entries.lock().await;
                let Some(entry) = entries.get_mut(&id) else {
                    return;
                };
                if entry.child.is_none() {
                    // Stopped (or superseded) while we slept.
                    return;
                }
                if self.reconcile(id, entry) {
                    return;
                }
                if entry.current() == RunState::Starting {
                    entry.set_state(RunState::Running);
                    let port = self.configured_port(id);
                    self.publish_execution(
                        id,
                        "start",
                        &port.map_or_else(
                            || "running".to_string(),
                            |port| format!("running on port {port}"),
                        ),
                    );
                }
            }
            tokio::time::sleep(self.inner.poll_interval).await;
        }
    }

    /// Fold an exited child into the recorded state. Returns true if the
    /// process was found to have exited.
    fn reconcile(&self, id: PortalId, entry: &mut ProcessEntry) -> bool {
        let Some(child) = entry.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                entry.child = None;
                let state = if entry.stopping || status.success() {
                    RunState::Stopped
                } else {
                    RunState::Failed
                };
                entry.stopping = false;
                entry.set_state(state);
                self.publish_execution(id, "exit", &status.to_string());
                info!(id, %status, state = %state, "portal process exited");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(id, error = %e, "failed to poll portal process");
                false
            }
        }
    }

    fn configured_port(&self, id: PortalId) -> Option<u16> {
        let settings = std::fs::read_to_string(self.inner.fs.settings_file(id)).ok()?;
        let map: std::collections::BTreeMap<String, String> =
            serde_yaml::from_str(&settings).ok()?;
        map.get("server.port")?.parse().ok()
    }

    fn publish_execution(&self, id: PortalId, action: &str, output: &str) {
        self.inner.bus.publish(
            &topics::portal_events(id),
            Message::PortalExecution {
                portal_id: id,
                action: action.to_string(),
                output: output.to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const GRACE: Duration = Duration::from_millis(60);
    const POLL: Duration = Duration::from_millis(30);

    fn executor(dir: &TempDir) -> PortalExecutor {
        let fs = PortalFileSystem::new(dir.path(), "portal");
        PortalExecutor::new(fs, Arc::new(MessageBus::new()), GRACE, POLL)
    }

    fn install_script(dir: &TempDir, id: PortalId, body: &str) {
        let fs = PortalFileSystem::new(dir.path(), "portal");
        fs::create_dir_all(fs.bin_dir(id)).unwrap();
        fs::create_dir_all(fs.logs_dir(id)).unwrap();
        fs::create_dir_all(fs.conf_dir(id)).unwrap();
        let script = fs.script_file(id);
        fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    #[tokio::test]
    async fn status_of_unknown_portal_is_not_deployed() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir);
        assert_eq!(exec.status(99).await.state, RunState::NotDeployed);
    }

    #[tokio::test]
    async fn status_of_deployed_idle_portal_is_stopped() {
        let dir = TempDir::new().unwrap();
        install_script(&dir, 1, "exit 0");
        let exec = executor(&dir);
        assert_eq!(exec.status(1).await.state, RunState::Stopped);
    }

    #[tokio::test]
    async fn start_runs_until_stop() {
        let dir = TempDir::new().unwrap();
        install_script(&dir, 1, "while true; do sleep 0.05; done");
        let exec = executor(&dir);

        exec.start(1).await.unwrap();
        assert_eq!(exec.status(1).await.state, RunState::Running);

        exec.stop(1).await.unwrap();
        assert_eq!(exec.status(1).await.state, RunState::Stopped);
    }

    #[tokio::test]
    async fn start_failure_is_reported_not_thrown_from_status() {
        let dir = TempDir::new().unwrap();
        install_script(&dir, 2, "exit 3");
        let exec = executor(&dir);

        let err = exec.start(2).await.unwrap_err();
        assert!(matches!(err, PortalError::Process { id: 2, .. }));
        assert_eq!(exec.status(2).await.state, RunState::Failed);
    }

    #[tokio::test]
    async fn externally_died_process_is_detected_by_status() {
        let dir = TempDir::new().unwrap();
        install_script(&dir, 3, "sleep 0.2");
        let exec = executor(&dir);

        exec.start(3).await.unwrap();
        assert_eq!(exec.status(3).await.state, RunState::Running);

        // Let the process die on its own, then query again: no stale RUNNING.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let state = exec.status(3).await.state;
        assert!(
            matches!(state, RunState::Stopped | RunState::Failed),
            "stale state: {state:?}"
        );
    }

    #[tokio::test]
    async fn start_when_running_is_noop() {
        let dir = TempDir::new().unwrap();
        install_script(&dir, 4, "echo started; while true; do sleep 0.05; done");
        let exec = executor(&dir);

        exec.start(4).await.unwrap();
        exec.start(4).await.unwrap();
        exec.stop(4).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        // A duplicate spawn would have written "started" twice.
        let log = fs::read_to_string(dir.path().join("portals/4/logs/portal.log")).unwrap();
        assert_eq!(log.matches("started").count(), 1);
    }

    #[tokio::test]
    async fn stop_when_stopped_is_noop() {
        let dir = TempDir::new().unwrap();
        install_script(&dir, 5, "exit 0");
        let exec = executor(&dir);
        exec.stop(5).await.unwrap();
        exec.stop(5).await.unwrap();
        assert_eq!(exec.status(5).await.state, RunState::Stopped);
    }

    #[tokio::test]
    async fn restart_yields_single_live_process() {
        let dir = TempDir::new().unwrap();
        install_script(&dir, 6, "echo up; while true; do sleep 0.05; done");
        let exec = executor(&dir);

        exec.start(6).await.unwrap();
        exec.restart(6).await.unwrap();
        assert_eq!(exec.status(6).await.state, RunState::Running);
        exec.stop(6).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let log = fs::read_to_string(dir.path().join("portals/6/logs/portal.log")).unwrap();
        assert_eq!(log.matches("up").count(), 2);
        assert_eq!(exec.status(6).await.state, RunState::Stopped);
    }

    #[tokio::test]
    async fn process_output_lands_in_log_file() {
        let dir = TempDir::new().unwrap();
        install_script(&dir, 7, "echo hello from portal");
        let exec = executor(&dir);

        let _ = exec.start(7).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let log = fs::read_to_string(dir.path().join("portals/7/logs/portal.log")).unwrap();
        assert!(log.contains("hello from portal"));
    }

    #[tokio::test]
    async fn running_status_reports_configured_port() {
        let dir = TempDir::new().unwrap();
        install_script(&dir, 8, "while true; do sleep 0.05; done");
        fs::write(
            dir.path().join("portals/8/conf/application.yml"),
            "server.port: '9008'\n",
        )
        .unwrap();
        let exec = executor(&dir);

        exec.start(8).await.unwrap();
        let status = exec.status(8).await;
        assert_eq!(status.state, RunState::Running);
        assert_eq!(status.port, Some(9008));
        exec.stop(8).await.unwrap();
    }

    #[tokio::test]
    async fn execution_events_are_published() {
        let dir = TempDir::new().unwrap();
        install_script(&dir, 9, "exit 0");
        let fs_layout = PortalFileSystem::new(dir.path(), "portal");
        let bus = Arc::new(MessageBus::new());
        let exec = PortalExecutor::new(fs_layout, bus.clone(), GRACE, POLL);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(&topics::portal_events(9), tx);

        let _ = exec.start(9).await;
        let first = rx.recv().await.unwrap();
        match first {
            Message::PortalExecution {
                portal_id, action, ..
            } => {
                assert_eq!(portal_id, 9);
                assert_eq!(action, "start");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

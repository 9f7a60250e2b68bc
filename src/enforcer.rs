//! Process enforcement engine.
//!
//! Periodic scan, differential detection of new PIDs, allow-list
//! evaluation, forced termination of violators. Enforcement is polling
//! based: process-creation notification APIs need rights the agent may
//! not hold, so the 1-second sweep stays the baseline.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::events::AgentEvent;
use crate::platform::Platform;
use crate::policy::PolicyStore;

const SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Kernel and session-zero processes that are never evaluated.
const IGNORED_PROCESSES: [&str; 14] = [
    "System",
    "smss.exe",
    "csrss.exe",
    "wininit.exe",
    "winlogon.exe",
    "services.exe",
    "lsass.exe",
    "svchost.exe",
    "dwm.exe",
    "explorer.exe",
    "RuntimeBroker.exe",
    "WmiPrvSE.exe",
    "dllhost.exe",
    "conhost.exe",
];

pub struct ProcessEnforcer {
    platform: Arc<dyn Platform>,
    store: Arc<PolicyStore>,
    events: mpsc::Sender<AgentEvent>,
    /// PIDs that existed at the end of the previous scan. Set-difference
    /// input only; the OS enumeration stays the source of truth.
    known_pids: HashSet<u32>,
    /// PIDs we emitted an open event for, with their image name. Closes
    /// are only reported for these.
    reported: HashMap<u32, String>,
    self_name: String,
    dry_run: bool,
}

impl ProcessEnforcer {
    pub fn new(
        platform: Arc<dyn Platform>,
        store: Arc<PolicyStore>,
        events: mpsc::Sender<AgentEvent>,
        dry_run: bool,
    ) -> Self {
        let self_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_else(|| "classguard-agent.exe".to_string());

        Self {
            platform,
            store,
            events,
            known_pids: HashSet::new(),
            reported: HashMap::new(),
            self_name,
            dry_run,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.platform.enable_debug_privilege() {
            log::warn!("debug privilege not available: {}", e);
        }

        self.prescan();
        log::info!(
            "process enforcement started ({} existing processes, dry_run={})",
            self.known_pids.len(),
            self.dry_run
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(SCAN_INTERVAL) => {
                    self.scan_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        log::info!("process enforcement stopped");
                        return;
                    }
                }
            }
        }
    }

    /// Populate the known-PID set without emitting open events. Boot must
    /// not treat every already-running process as new, or the agent would
    /// kill the shell that started it.
    fn prescan(&mut self) {
        match self.platform.enumerate_processes() {
            Ok(processes) => {
                self.known_pids = processes.iter().map(|p| p.pid).collect();
            }
            Err(e) => {
                log::error!("initial process scan failed: {}", e);
            }
        }
    }

    async fn scan_cycle(&mut self) {
        let processes = match self.platform.enumerate_processes() {
            Ok(processes) => processes,
            Err(e) => {
                // Skip the cycle; do not clear the known set.
                log::warn!("process enumeration failed, skipping cycle: {}", e);
                return;
            }
        };

        let current: HashSet<u32> = processes.iter().map(|p| p.pid).collect();

        // New PIDs are dispatched before any close events.
        for process in &processes {
            if self.known_pids.contains(&process.pid) {
                continue;
            }
            self.known_pids.insert(process.pid);
            self.handle_new_process(process.pid, &process.name, process.image_path.as_deref())
                .await;
        }

        let closed: Vec<u32> = self
            .known_pids
            .iter()
            .filter(|pid| !current.contains(pid))
            .copied()
            .collect();
        for pid in closed {
            if let Some(name) = self.reported.remove(&pid) {
                self.emit(AgentEvent::ProcessClosed { pid, name }).await;
            }
        }

        self.known_pids = current;
    }

    async fn handle_new_process(&mut self, pid: u32, name: &str, image_path: Option<&str>) {
        // The enumeration may already carry the path; only open the
        // process when it does not.
        let path = match image_path {
            Some(path) if !path.is_empty() => path.to_string(),
            _ => match self.platform.resolve_image_path(pid) {
                Some(path) if !path.is_empty() => path,
                // Likely an inaccessible system process.
                _ => {
                    log::debug!("no image path for PID {} ({}), ignoring", pid, name);
                    return;
                }
            },
        };

        if self.should_ignore(name) {
            log::debug!("ignoring system process: PID={} name={}", pid, name);
            return;
        }

        // Take the decision under the read lease, terminate after release.
        let mut allowed = self.store.is_allowed(&path);
        if allowed && !self.store.validate_checksum(&path) {
            log::warn!("content hash mismatch: PID={} path={}", pid, path);
            allowed = false;
        }

        if allowed {
            log::debug!("process allowed: PID={} path={}", pid, path);
            self.reported.insert(pid, name.to_string());
            self.emit(AgentEvent::ProcessOpened {
                pid,
                name: name.to_string(),
            })
            .await;
            return;
        }

        log::warn!("process not in allow-list: PID={} path={}", pid, path);
        self.emit(AgentEvent::PolicyViolation {
            pid,
            name: name.to_string(),
            path: path.clone(),
        })
        .await;

        if self.dry_run {
            log::info!("dry run: PID {} left running", pid);
            self.emit(AgentEvent::DryRunBlock {
                pid,
                name: name.to_string(),
                path,
            })
            .await;
            return;
        }

        match self.platform.terminate(pid) {
            Ok(()) => {
                log::info!("process terminated: PID={} path={}", pid, path);
                self.emit(AgentEvent::ProcessBlocked {
                    pid,
                    name: name.to_string(),
                    path,
                })
                .await;
            }
            Err(e) => {
                // The PID stays in the known set; the kill is not retried.
                log::warn!("failed to terminate PID {}: {}", pid, e);
                self.emit(AgentEvent::KillFailed {
                    pid,
                    name: name.to_string(),
                    path,
                    error: e.to_string(),
                })
                .await;
            }
        }
    }

    fn should_ignore(&self, name: &str) -> bool {
        IGNORED_PROCESSES
            .iter()
            .any(|ignored| name.eq_ignore_ascii_case(ignored))
            || name.eq_ignore_ascii_case(&self.self_name)
    }

    async fn emit(&self, event: AgentEvent) {
        if self.events.send(event).await.is_err() {
            log::error!("event bus closed, enforcement event dropped");
        }
    }
}

//! Active console user tracking.
//!
//! Polls the physical console session every 30 seconds, normalizes the
//! account name and turns the previous/current pair into session events.
//! A failed query is treated as no change: only a successful empty read
//! means the console is actually unattended.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::events::AgentEvent;
use crate::platform::Platform;

const POLL_INTERVAL: Duration = Duration::from_secs(30);

pub struct SessionTracker {
    platform: Arc<dyn Platform>,
    events: mpsc::Sender<AgentEvent>,
    /// Fans the current user out to the browser reader and the
    /// orchestrator. Nobody reads the tracker's own state.
    user_tx: watch::Sender<String>,
    project_base: PathBuf,
    current: String,
}

impl SessionTracker {
    pub fn new(
        platform: Arc<dyn Platform>,
        events: mpsc::Sender<AgentEvent>,
        user_tx: watch::Sender<String>,
        project_base: PathBuf,
    ) -> Self {
        Self {
            platform,
            events,
            user_tx,
            project_base,
            current: String::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        log::info!("session tracking started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        log::info!("session tracking stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn tick(&mut self) {
        let raw = match self.platform.active_console_user() {
            Ok(user) => user,
            Err(e) => {
                log::debug!("console user query failed, keeping previous state: {}", e);
                return;
            }
        };

        for event in self.observe(&raw) {
            if self.events.send(event).await.is_err() {
                log::error!("event bus closed, session event dropped");
            }
        }
    }

    /// Apply one sample of the console user and return the resulting
    /// session events, in order.
    fn observe(&mut self, raw_user: &str) -> Vec<AgentEvent> {
        let user = normalize_user(raw_user);
        if user == self.current {
            return Vec::new();
        }

        let mut events = Vec::new();
        let switched = !self.current.is_empty() && !user.is_empty();
        if !self.current.is_empty() {
            events.push(AgentEvent::SessionEnd {
                user: self.current.clone(),
                switched,
            });
        }
        if !user.is_empty() {
            log::info!("console user changed: '{}' -> '{}'", self.current, user);
            prepare_user_workspace(&self.project_base, &user);
            events.push(AgentEvent::SessionStart { user: user.clone() });
        } else {
            log::info!("console unattended (was '{}')", self.current);
        }

        self.current = user.clone();
        let _ = self.user_tx.send(user);
        events
    }
}

/// Strip any `DOMAIN\` prefix.
pub fn normalize_user(raw: &str) -> String {
    match raw.find('\\') {
        Some(idx) => raw[idx + 1..].to_string(),
        None => raw.to_string(),
    }
}

/// Per-user working directory, created with owner-only permissions on
/// first login.
pub fn prepare_user_workspace(base: &Path, user: &str) {
    let dir = base.join(user);
    if dir.exists() {
        return;
    }
    if let Err(e) = std::fs::create_dir_all(&dir) {
        log::warn!("failed to prepare workspace {}: {}", dir.display(), e);
        return;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700));
    }
    log::info!("prepared user workspace: {}", dir.display());
}

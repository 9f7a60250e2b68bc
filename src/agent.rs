//! Core orchestrator.
//!
//! Wires the engines together and runs the select loop that consumes bus
//! events, inbound server commands, shell IPC messages and the periodic
//! tickers (heartbeat, journal upload, allow-list refresh). The
//! orchestrator is the only component that writes journal entries and the
//! only one that talks to the server channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};

use crate::channel::{ServerChannel, ServerCommand};
use crate::config::Config;
use crate::enforcer::ProcessEnforcer;
use crate::events::AgentEvent;
use crate::ipc::{IpcServer, ShellMessage};
use crate::journal::{self, JournalHandle, LogType};
use crate::platform::{Platform, WindowsPlatform};
use crate::policy::PolicyStore;
use crate::session::{normalize_user, prepare_user_workspace, SessionTracker};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const UPLOAD_INTERVAL: Duration = Duration::from_secs(3600);
const JOURNAL_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Assemble every subsystem and run until the shutdown signal fires.
pub async fn run(config: Config, shutdown: watch::Receiver<bool>) {
    let platform: Arc<dyn Platform> = Arc::new(WindowsPlatform::new());

    let whitelist_url = if config.whitelist_url.is_empty() {
        None
    } else {
        Some(config.whitelist_url.clone())
    };
    let store = Arc::new(PolicyStore::new(
        PathBuf::from(&config.whitelist_path),
        whitelist_url,
    ));
    store.initialize().await;

    let (journal, journal_task) =
        journal::spawn_writer(PathBuf::from(&config.log_path), &config.hostname);

    let (channel, commands_rx, commands_tx) =
        ServerChannel::new(&config.server_url, &config.device_token, &config.hostname);
    channel.start(commands_tx, shutdown.clone());

    let (events_tx, events_rx) = mpsc::channel(256);
    let (user_tx, user_rx) = watch::channel(String::new());

    let enforcer = ProcessEnforcer::new(
        platform.clone(),
        store.clone(),
        events_tx.clone(),
        config.dry_run,
    );
    tokio::spawn(enforcer.run(shutdown.clone()));

    let tracker = SessionTracker::new(
        platform.clone(),
        events_tx.clone(),
        user_tx,
        PathBuf::from(&config.project_base),
    );
    tokio::spawn(tracker.run(shutdown.clone()));

    let reader = crate::browser::BrowserReader::new(events_tx.clone(), user_rx);
    tokio::spawn(reader.run(shutdown.clone()));
    drop(events_tx);

    let (shell_tx, shell_rx) = mpsc::channel(10);
    if let Some(addr) = config.ipc_endpoint() {
        match IpcServer::bind(&addr, shell_tx).await {
            Ok((server, local)) => {
                log::info!("shell IPC bound on {}", local);
                tokio::spawn(server.run(shutdown.clone()));
            }
            Err(e) => log::warn!("shell IPC unavailable on {}: {}", addr, e),
        }
    }

    journal
        .add("", LogType::System, "agent", "Agent Start")
        .await;

    let agent = Agent::new(config, store, journal, channel);
    agent.core_loop(events_rx, commands_rx, shell_rx, shutdown).await;

    // All journal handles are gone once the agent is dropped; give the
    // writer a bounded window to drain what is queued.
    if tokio::time::timeout(JOURNAL_DRAIN_TIMEOUT, journal_task)
        .await
        .is_err()
    {
        log::warn!("journal writer did not drain before shutdown");
    }
}

struct Agent {
    config: Config,
    store: Arc<PolicyStore>,
    journal: JournalHandle,
    channel: ServerChannel,
    current_user: String,
    /// Lines already handed to the channel, per journal file. In-memory
    /// only: within one run no entry is uploaded twice.
    upload_cursors: HashMap<PathBuf, usize>,
}

impl Agent {
    fn new(
        config: Config,
        store: Arc<PolicyStore>,
        journal: JournalHandle,
        channel: ServerChannel,
    ) -> Self {
        Self {
            config,
            store,
            journal,
            channel,
            current_user: String::new(),
            upload_cursors: HashMap::new(),
        }
    }

    async fn core_loop(
        mut self,
        mut events: mpsc::Receiver<AgentEvent>,
        mut commands: mpsc::Receiver<ServerCommand>,
        mut shell: mpsc::Receiver<ShellMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        let mut upload = interval_at(Instant::now() + UPLOAD_INTERVAL, UPLOAD_INTERVAL);
        let refresh_period = Duration::from_secs(self.config.update_interval * 60);
        let mut refresh = interval_at(Instant::now() + refresh_period, refresh_period);

        log::info!("core agent loop started");
        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle_event(event).await,
                Some(command) = commands.recv() => self.handle_command(command).await,
                Some(message) = shell.recv() => self.handle_shell(message).await,
                _ = heartbeat.tick() => self.channel.send_heartbeat(&self.current_user).await,
                _ = upload.tick() => self.upload_logs().await,
                _ = refresh.tick() => {
                    match self.store.update().await {
                        Ok(()) => log::info!(
                            "allow-list current: version {} ({} items)",
                            self.store.get_version(),
                            self.store.get_item_count()
                        ),
                        // Previous policy stays in effect.
                        Err(e) => log::warn!("allow-list refresh failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                else => break,
            }
        }
        log::info!("core agent loop stopped");
    }

    async fn handle_event(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::SessionStart { user } => {
                self.current_user = user.clone();
                self.journal
                    .add(&user, LogType::System, "agent", "Session Start")
                    .await;
                self.channel.send_heartbeat(&self.current_user).await;
            }
            AgentEvent::SessionEnd { user, switched } => {
                self.journal
                    .add(&user, LogType::System, "agent", "Session End")
                    .await;
                self.current_user.clear();
                // On a direct user switch the single heartbeat is sent by
                // the SessionStart that follows in the same poll.
                if !switched {
                    self.channel.send_heartbeat("").await;
                }
            }
            AgentEvent::ProcessOpened { name, .. } => {
                self.journal
                    .add(&self.current_user, LogType::Process, &name, "Opened")
                    .await;
            }
            AgentEvent::ProcessClosed { name, .. } => {
                self.journal
                    .add(&self.current_user, LogType::Process, &name, "Closed")
                    .await;
            }
            AgentEvent::PolicyViolation { name, path, .. } => {
                self.journal
                    .add(
                        &self.current_user,
                        LogType::Process,
                        &name,
                        &format!("Denied by policy: {}", path),
                    )
                    .await;
            }
            AgentEvent::ProcessBlocked { name, path, .. } => {
                self.journal
                    .add(
                        &self.current_user,
                        LogType::Process,
                        &name,
                        &format!("Blocked: {}", path),
                    )
                    .await;
            }
            AgentEvent::KillFailed { name, path, error, .. } => {
                self.journal
                    .add(
                        &self.current_user,
                        LogType::Process,
                        &name,
                        &format!("Kill failed for {}: {}", path, error),
                    )
                    .await;
            }
            AgentEvent::DryRunBlock { name, path, .. } => {
                self.journal
                    .add(
                        &self.current_user,
                        LogType::Process,
                        &name,
                        &format!("Would block (dry run): {}", path),
                    )
                    .await;
            }
            AgentEvent::BrowserVisit { browser, action } => {
                self.journal
                    .add(&self.current_user, LogType::Browser, &browser, &action)
                    .await;
            }
            AgentEvent::ShellActivity { program, action } => {
                self.journal
                    .add(&self.current_user, LogType::Shell, &program, &action)
                    .await;
            }
        }
    }

    async fn handle_command(&mut self, command: ServerCommand) {
        match command {
            ServerCommand::UploadLogs => {
                log::info!("server requested log upload");
                self.upload_logs().await;
            }
            ServerCommand::GetUser => {
                self.channel.send_heartbeat(&self.current_user).await;
            }
        }
    }

    async fn handle_shell(&mut self, message: ShellMessage) {
        match message.command.as_str() {
            "LOG" => {
                self.handle_event(AgentEvent::ShellActivity {
                    program: message.program,
                    action: message.action,
                })
                .await;
            }
            "LOGIN" => {
                let user = normalize_user(&message.user);
                if !user.is_empty() {
                    prepare_user_workspace(Path::new(&self.config.project_base), &user);
                }
                self.channel.send_heartbeat(&self.current_user).await;
            }
            "LOGOUT" => {
                self.channel.send_heartbeat(&self.current_user).await;
            }
            other => log::debug!("unknown shell command ignored: {}", other),
        }
    }

    /// Upload the day's unsent journal entries. The cursor only advances
    /// when the frame reached a live connection, so entries read during an
    /// outage are retried on the next tick and nothing is ever sent twice
    /// within a run.
    async fn upload_logs(&mut self) {
        let file = journal::current_file(Path::new(&self.config.log_path));
        let cursor = self.upload_cursors.get(&file).copied().unwrap_or(0);

        let (entries, new_cursor) =
            match journal::read_entries(&file, cursor, &self.config.hostname) {
                Ok(result) => result,
                Err(e) => {
                    log::warn!("journal read failed: {}", e);
                    return;
                }
            };

        if entries.is_empty() {
            return;
        }

        if self.channel.send_logs(&entries).await {
            self.upload_cursors.insert(file, new_cursor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;
    use chrono::Utc;
    use tempfile::TempDir;

    fn test_agent(dir: &TempDir) -> (Agent, tokio::task::JoinHandle<()>) {
        let mut config = Config::default();
        config.log_path = dir.path().display().to_string();
        config.hostname = "LAB-01".to_string();
        config.project_base = dir.path().join("projects").display().to_string();

        let store = Arc::new(PolicyStore::with_policy(
            dir.path().join("whitelist.json"),
            Policy {
                version: "t1".to_string(),
                items: vec![],
                hashes: None,
                updated_at: Utc::now(),
            },
        ));
        let (journal, journal_task) =
            journal::spawn_writer(dir.path().to_path_buf(), "LAB-01");
        // Unroutable endpoint: every send is dropped, which is exactly the
        // disconnected behavior under test.
        let (channel, _commands_rx, _commands_tx) =
            ServerChannel::new("127.0.0.1:1", "tok", "LAB-01");

        (Agent::new(config, store, journal, channel), journal_task)
    }

    async fn journal_lines(dir: &TempDir, task: tokio::task::JoinHandle<()>, agent: Agent) -> Vec<crate::journal::LogEntry> {
        drop(agent);
        task.await.unwrap();
        let file = journal::current_file(dir.path());
        let (entries, _) = journal::read_entries(&file, 0, "LAB-01").unwrap();
        entries
    }

    #[tokio::test]
    async fn session_events_stamp_the_journal_user() {
        let dir = TempDir::new().unwrap();
        let (mut agent, task) = test_agent(&dir);

        agent
            .handle_event(AgentEvent::SessionStart {
                user: "alice".to_string(),
            })
            .await;
        agent
            .handle_event(AgentEvent::ProcessOpened {
                pid: 10,
                name: "chrome.exe".to_string(),
            })
            .await;
        agent
            .handle_event(AgentEvent::SessionEnd {
                user: "alice".to_string(),
                switched: false,
            })
            .await;
        agent
            .handle_event(AgentEvent::ProcessClosed {
                pid: 10,
                name: "chrome.exe".to_string(),
            })
            .await;

        let entries = journal_lines(&dir, task, agent).await;
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].action, "Session Start");
        assert_eq!(entries[0].username, "alice");
        assert_eq!(entries[1].username, "alice");
        assert_eq!(entries[1].log_type, LogType::Process);
        assert_eq!(entries[2].action, "Session End");
        // After the session ended the console is unattended.
        assert_eq!(entries[3].username, "system");
    }

    #[tokio::test]
    async fn user_switch_sends_a_single_heartbeat() {
        use tokio::io::{AsyncBufReadExt, BufReader};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.log_path = dir.path().display().to_string();
        config.hostname = "LAB-01".to_string();
        config.project_base = dir.path().join("projects").display().to_string();

        let store = Arc::new(PolicyStore::with_policy(
            dir.path().join("whitelist.json"),
            Policy {
                version: "t1".to_string(),
                items: vec![],
                hashes: None,
                updated_at: Utc::now(),
            },
        ));
        let (journal, _journal_task) =
            journal::spawn_writer(dir.path().to_path_buf(), "LAB-01");
        let (channel, _commands_rx, commands_tx) =
            ServerChannel::new(&addr.to_string(), "tok", "LAB-01");
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        channel.start(commands_tx, shutdown_rx);
        let mut agent = Agent::new(config, store, journal, channel);

        let (server_stream, _) = listener.accept().await.unwrap();
        let (server_read, _server_write) = server_stream.into_split();
        let mut server_lines = BufReader::new(server_read).lines();
        // Auth first; the connection is live from here on.
        server_lines.next_line().await.unwrap().unwrap();

        // alice logs in, then the console switches directly to bob.
        agent
            .handle_event(AgentEvent::SessionStart {
                user: "alice".to_string(),
            })
            .await;
        agent
            .handle_event(AgentEvent::SessionEnd {
                user: "alice".to_string(),
                switched: true,
            })
            .await;
        agent
            .handle_event(AgentEvent::SessionStart {
                user: "bob".to_string(),
            })
            .await;

        // Exactly two heartbeats: alice, then bob. No interim empty one.
        let first = server_lines.next_line().await.unwrap().unwrap();
        let first: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(first["type"], "heartbeat");
        assert_eq!(first["user"], "alice");

        let second = server_lines.next_line().await.unwrap().unwrap();
        let second: serde_json::Value = serde_json::from_str(&second).unwrap();
        assert_eq!(second["type"], "heartbeat");
        assert_eq!(second["user"], "bob");
    }

    #[tokio::test]
    async fn enforcement_events_are_journaled() {
        let dir = TempDir::new().unwrap();
        let (mut agent, task) = test_agent(&dir);

        agent
            .handle_event(AgentEvent::PolicyViolation {
                pid: 20,
                name: "game.exe".to_string(),
                path: "C:\\Users\\alice\\Downloads\\game.exe".to_string(),
            })
            .await;
        agent
            .handle_event(AgentEvent::ProcessBlocked {
                pid: 20,
                name: "game.exe".to_string(),
                path: "C:\\Users\\alice\\Downloads\\game.exe".to_string(),
            })
            .await;

        let entries = journal_lines(&dir, task, agent).await;
        assert_eq!(entries.len(), 2);
        assert!(entries[0].action.starts_with("Denied by policy:"));
        assert!(entries[1].action.starts_with("Blocked:"));
        assert_eq!(entries[1].program, "game.exe");
    }

    #[tokio::test]
    async fn upload_cursor_holds_while_disconnected() {
        let dir = TempDir::new().unwrap();
        let (mut agent, task) = test_agent(&dir);

        agent
            .handle_event(AgentEvent::BrowserVisit {
                browser: "Chrome".to_string(),
                action: "Visited: https://example.org".to_string(),
            })
            .await;

        // Give the writer a moment to land the line.
        tokio::time::sleep(Duration::from_millis(100)).await;

        agent.upload_logs().await;
        // Channel is dark: nothing advanced, the entry will be retried.
        assert!(agent.upload_cursors.is_empty());

        let entries = journal_lines(&dir, task, agent).await;
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn shell_log_messages_become_shell_entries() {
        let dir = TempDir::new().unwrap();
        let (mut agent, task) = test_agent(&dir);

        agent
            .handle_event(AgentEvent::SessionStart {
                user: "bob".to_string(),
            })
            .await;
        agent
            .handle_shell(ShellMessage {
                command: "LOG".to_string(),
                user: String::new(),
                program: "shell".to_string(),
                action: "opened project folder".to_string(),
            })
            .await;

        let entries = journal_lines(&dir, task, agent).await;
        assert_eq!(entries[1].log_type, LogType::Shell);
        assert_eq!(entries[1].username, "bob");
        assert_eq!(entries[1].action, "opened project folder");
    }
}

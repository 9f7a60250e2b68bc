//! Persistent bidirectional server channel.
//!
//! One JSON frame per newline-terminated line over TCP. The receive loop
//! runs until the connection drops, then the channel reconnects after a
//! fixed 10-second pause, forever. Outbound sends are serialized by a
//! mutex; with no live connection they are dropped silently (heartbeats
//! are idempotent, log uploads hold their cursor and retry next tick).

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};

use crate::journal::LogEntry;

const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Commands the server may push down the channel. Unknown types are
/// ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCommand {
    UploadLogs,
    GetUser,
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    frame_type: String,
}

#[derive(Debug)]
pub enum ChannelError {
    Send(String),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Send(e) => write!(f, "channel send error: {}", e),
        }
    }
}

impl std::error::Error for ChannelError {}

#[derive(Clone)]
pub struct ServerChannel {
    addr: String,
    token: String,
    hostname: String,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
}

impl ServerChannel {
    /// Build the channel and the queue its inbound commands arrive on.
    pub fn new(server_url: &str, token: &str, hostname: &str) -> (Self, mpsc::Receiver<ServerCommand>, mpsc::Sender<ServerCommand>) {
        let (commands_tx, commands_rx) = mpsc::channel(10);
        let channel = Self {
            addr: endpoint_addr(server_url),
            token: token.to_string(),
            hostname: hostname.to_string(),
            writer: Arc::new(Mutex::new(None)),
        };
        (channel, commands_rx, commands_tx)
    }

    /// Spawn the connect/receive loop.
    pub fn start(
        &self,
        commands: mpsc::Sender<ServerCommand>,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let channel = self.clone();
        tokio::spawn(async move { channel.run(commands, shutdown).await })
    }

    async fn run(self, commands: mpsc::Sender<ServerCommand>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let stream = tokio::select! {
                result = TcpStream::connect(&self.addr) => result,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            };

            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    log::debug!("server connect failed ({}), retrying in 10s", e);
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                    continue;
                }
            };

            let (read_half, write_half) = stream.into_split();
            *self.writer.lock().await = Some(write_half);

            if let Err(e) = self
                .send_frame(&json!({"type": "auth", "token": self.token}))
                .await
            {
                log::warn!("auth send failed: {}", e);
            } else {
                log::info!("server channel connected: {}", self.addr);
            }

            self.receive_loop(read_half, &commands, &mut shutdown).await;

            // Any send or receive error lands here: drop the connection
            // and go back to the connect step.
            *self.writer.lock().await = None;
            log::info!("server channel disconnected");
        }
    }

    async fn receive_loop(
        &self,
        read_half: tokio::net::tcp::OwnedReadHalf,
        commands: &mpsc::Sender<ServerCommand>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => return,
            };
            if line.is_empty() {
                continue;
            }

            let frame: InboundFrame = match serde_json::from_str(&line) {
                Ok(frame) => frame,
                Err(e) => {
                    // Bad frame: drop it, keep the connection.
                    log::debug!("unparsable server frame dropped: {}", e);
                    continue;
                }
            };

            let command = match frame.frame_type.as_str() {
                "UPLOAD_LOGS" => ServerCommand::UploadLogs,
                "GET_USER" => ServerCommand::GetUser,
                other => {
                    log::debug!("unknown server command ignored: {}", other);
                    continue;
                }
            };

            if commands.send(command).await.is_err() {
                return;
            }
        }
    }

    /// Write one frame. `Ok(false)` means there was no connection and the
    /// frame was dropped.
    pub async fn send_frame(&self, frame: &serde_json::Value) -> Result<bool, ChannelError> {
        let mut guard = self.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) => writer,
            None => return Ok(false),
        };

        let mut line = frame.to_string();
        line.push('\n');

        match writer.write_all(line.as_bytes()).await {
            Ok(()) => Ok(true),
            Err(e) => {
                *guard = None;
                Err(ChannelError::Send(e.to_string()))
            }
        }
    }

    pub async fn send_heartbeat(&self, user: &str) {
        let frame = json!({
            "type": "heartbeat",
            "device": self.hostname,
            "user": user,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        match self.send_frame(&frame).await {
            Ok(true) => log::debug!("heartbeat sent (user: '{}')", user),
            Ok(false) => log::debug!("heartbeat dropped, no connection"),
            Err(e) => log::debug!("heartbeat failed: {}", e),
        }
    }

    /// Upload a journal batch. Returns true only when the frame actually
    /// reached a live connection.
    pub async fn send_logs(&self, entries: &[LogEntry]) -> bool {
        let frame = json!({"type": "logs", "data": entries});
        match self.send_frame(&frame).await {
            Ok(true) => {
                log::info!("uploaded {} journal entries", entries.len());
                true
            }
            Ok(false) => {
                log::debug!("log upload skipped, no connection");
                false
            }
            Err(e) => {
                log::warn!("log upload failed: {}", e);
                false
            }
        }
    }
}

/// Accept `host:port` with an optional scheme and path
/// (`tcp://srv:9000`, `ws://srv:9000/ws`).
fn endpoint_addr(url: &str) -> String {
    let rest = match url.find("://") {
        Some(idx) => &url[idx + 3..],
        None => url,
    };
    match rest.find('/') {
        Some(idx) => rest[..idx].to_string(),
        None => rest.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::LogType;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn endpoint_addr_strips_scheme_and_path() {
        assert_eq!(endpoint_addr("tcp://srv:9000"), "srv:9000");
        assert_eq!(endpoint_addr("ws://srv:9000/ws"), "srv:9000");
        assert_eq!(endpoint_addr("srv:9000"), "srv:9000");
    }

    #[tokio::test]
    async fn sends_are_dropped_without_a_connection() {
        let (channel, _rx, _tx) = ServerChannel::new("127.0.0.1:1", "tok", "LAB-01");
        assert!(!channel.send_logs(&[]).await);
        // Heartbeat must not error either.
        channel.send_heartbeat("alice").await;
    }

    #[tokio::test]
    async fn connects_authenticates_and_receives_commands() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (channel, mut commands_rx, commands_tx) =
            ServerChannel::new(&addr.to_string(), "secret-token", "LAB-01");
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        channel.start(commands_tx, shutdown_rx);

        let (server_stream, _) = listener.accept().await.unwrap();
        let (server_read, mut server_write) = server_stream.into_split();
        let mut server_lines = BufReader::new(server_read).lines();

        // Auth frame arrives first.
        let auth = server_lines.next_line().await.unwrap().unwrap();
        let auth: serde_json::Value = serde_json::from_str(&auth).unwrap();
        assert_eq!(auth["type"], "auth");
        assert_eq!(auth["token"], "secret-token");

        // A garbage line, an unknown command and a real one.
        server_write.write_all(b"not json\n").await.unwrap();
        server_write
            .write_all(b"{\"type\":\"REBOOT\"}\n")
            .await
            .unwrap();
        server_write
            .write_all(b"{\"type\":\"UPLOAD_LOGS\"}\n")
            .await
            .unwrap();

        let command = tokio::time::timeout(Duration::from_secs(2), commands_rx.recv())
            .await
            .expect("command not received")
            .unwrap();
        assert_eq!(command, ServerCommand::UploadLogs);

        // Outbound frames reach the server once connected.
        let entry = LogEntry::new("alice", "LAB-01", LogType::Process, "chrome.exe", "Opened");
        assert!(channel.send_logs(std::slice::from_ref(&entry)).await);
        let logs = server_lines.next_line().await.unwrap().unwrap();
        let logs: serde_json::Value = serde_json::from_str(&logs).unwrap();
        assert_eq!(logs["type"], "logs");
        assert_eq!(logs["data"][0]["program"], "chrome.exe");
    }

    #[tokio::test]
    async fn heartbeat_carries_device_and_user() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (channel, _commands_rx, commands_tx) =
            ServerChannel::new(&addr.to_string(), "tok", "LAB-01");
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        channel.start(commands_tx, shutdown_rx);

        let (server_stream, _) = listener.accept().await.unwrap();
        let (server_read, _server_write) = server_stream.into_split();
        let mut server_lines = BufReader::new(server_read).lines();
        // Skip auth.
        server_lines.next_line().await.unwrap().unwrap();

        channel.send_heartbeat("alice").await;
        let heartbeat = server_lines.next_line().await.unwrap().unwrap();
        let heartbeat: serde_json::Value = serde_json::from_str(&heartbeat).unwrap();
        assert_eq!(heartbeat["type"], "heartbeat");
        assert_eq!(heartbeat["device"], "LAB-01");
        assert_eq!(heartbeat["user"], "alice");
        assert!(heartbeat["timestamp"].is_string());
    }
}

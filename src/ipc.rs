//! Local endpoint for the managed desktop shell.
//!
//! The shell reports user activity to the agent as one JSON object per
//! connection on a loopback socket. Malformed payloads are dropped. The
//! listener never touches session state itself; the console-user poller
//! stays authoritative.

use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

/// Shells send small payloads; anything bigger is not ours.
const MAX_MESSAGE_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ShellMessage {
    /// LOGIN, LOGOUT or LOG.
    #[serde(rename = "cmd")]
    pub command: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub program: String,
    #[serde(default)]
    pub action: String,
}

pub struct IpcServer {
    listener: TcpListener,
    tx: mpsc::Sender<ShellMessage>,
}

impl IpcServer {
    pub async fn bind(
        addr: &str,
        tx: mpsc::Sender<ShellMessage>,
    ) -> std::io::Result<(Self, std::net::SocketAddr)> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        Ok((Self { listener, tx }, local))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        log::info!("shell IPC listening");
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        log::info!("shell IPC stopped");
                        return;
                    }
                    continue;
                }
            };

            let (mut stream, _) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::debug!("IPC accept failed: {}", e);
                    continue;
                }
            };

            let tx = self.tx.clone();
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => {
                            buffer.extend_from_slice(&chunk[..n]);
                            if buffer.len() > MAX_MESSAGE_BYTES {
                                log::debug!("oversized IPC payload dropped");
                                return;
                            }
                        }
                        Err(_) => return,
                    }
                }

                match serde_json::from_slice::<ShellMessage>(&buffer) {
                    Ok(message) => {
                        let _ = tx.send(message).await;
                    }
                    Err(e) => log::debug!("malformed IPC payload dropped: {}", e),
                }
            });
        }
    }
}

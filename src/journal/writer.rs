//! Single-writer queue drain.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use tokio::sync::mpsc;

use super::entry::{LogEntry, LogType};

/// Bounded queue: producers block on a full queue instead of dropping.
const QUEUE_CAPACITY: usize = 100;

/// Producer side of the journal. Cheap to clone; every component that
/// emits activity holds one.
#[derive(Clone)]
pub struct JournalHandle {
    tx: mpsc::Sender<LogEntry>,
    device_name: String,
}

impl JournalHandle {
    pub async fn add(&self, username: &str, log_type: LogType, program: &str, action: &str) {
        let entry = LogEntry::new(username, &self.device_name, log_type, program, action);
        if self.tx.send(entry).await.is_err() {
            log::error!("journal writer gone, entry dropped");
        }
    }
}

/// Start the writer task. It exits once every handle has been dropped and
/// the queue has drained, so shutdown is: drop handles, await the task.
pub fn spawn_writer(
    log_dir: PathBuf,
    device_name: &str,
) -> (JournalHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    let handle = JournalHandle {
        tx,
        device_name: device_name.to_string(),
    };
    let task = tokio::spawn(write_loop(log_dir, rx));
    (handle, task)
}

async fn write_loop(log_dir: PathBuf, mut rx: mpsc::Receiver<LogEntry>) {
    while let Some(entry) = rx.recv().await {
        if let Err(e) = write_entry(&log_dir, &entry) {
            log::error!("journal write failed: {}", e);
        }
    }
    log::debug!("journal writer drained");
}

/// The day boundary is recomputed on every write, so the file rolls over
/// midnight without rotation logic.
fn write_entry(log_dir: &Path, entry: &LogEntry) -> std::io::Result<()> {
    let filename = log_dir.join(format!("{}.jsonl", Local::now().format("%Y-%m-%d")));
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(filename)?;

    let line = serde_json::to_string(entry)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn entries_are_appended_in_submission_order() {
        let dir = TempDir::new().unwrap();
        let (handle, task) = spawn_writer(dir.path().to_path_buf(), "LAB-01");

        handle.add("alice", LogType::Process, "chrome.exe", "Opened").await;
        handle.add("alice", LogType::Process, "chrome.exe", "Closed").await;
        handle.add("", LogType::System, "agent", "Session End").await;
        drop(handle);
        task.await.unwrap();

        let file = super::super::current_file(dir.path());
        let content = std::fs::read_to_string(file).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);

        let first: LogEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.action, "Opened");
        assert_eq!(first.device_name, "LAB-01");
        let last: LogEntry = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(last.username, "system");
    }

    #[tokio::test]
    async fn writer_drains_queue_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let (handle, task) = spawn_writer(dir.path().to_path_buf(), "LAB-01");

        for i in 0..50 {
            handle
                .add("bob", LogType::Shell, "shell", &format!("cmd {}", i))
                .await;
        }
        drop(handle);
        tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .expect("writer did not drain in time")
            .unwrap();

        let content = std::fs::read_to_string(super::super::current_file(dir.path())).unwrap();
        assert_eq!(content.lines().count(), 50);
    }
}

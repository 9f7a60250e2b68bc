//! Append-only structured activity journal.
//!
//! One JSON object per line into a daily `YYYY-MM-DD.jsonl` file. A single
//! writer task drains a bounded queue; producers block when the queue is
//! full, so entries are never silently dropped.

mod entry;
mod reader;
mod writer;

pub use entry::{LogEntry, LogType};
pub use reader::{current_file, read_entries};
pub use writer::{spawn_writer, JournalHandle};

#[derive(Debug)]
pub enum JournalError {
    Io(std::io::Error),
}

impl std::fmt::Display for JournalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JournalError::Io(e) => write!(f, "journal I/O error: {}", e),
        }
    }
}

impl std::error::Error for JournalError {}

impl From<std::io::Error> for JournalError {
    fn from(e: std::io::Error) -> Self {
        JournalError::Io(e)
    }
}

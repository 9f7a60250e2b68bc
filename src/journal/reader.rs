//! Replay side: parse the day's journal back for upload.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::Local;

use super::entry::LogEntry;
use super::JournalError;

/// Path of today's journal file.
pub fn current_file(log_dir: &Path) -> PathBuf {
    log_dir.join(format!("{}.jsonl", Local::now().format("%Y-%m-%d")))
}

/// Read entries from `path`, skipping the first `skip` lines (the upload
/// cursor). Unparsable lines are dropped; the batch continues. Returns the
/// parsed entries together with the new cursor position, which counts
/// every line seen, good or bad, so the cursor stays stable.
pub fn read_entries(
    path: &Path,
    skip: usize,
    default_device: &str,
) -> Result<(Vec<LogEntry>, usize), JournalError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), skip)),
        Err(e) => return Err(JournalError::Io(e)),
    };

    let reader = BufReader::new(file);
    let mut entries = Vec::new();
    let mut total = 0usize;

    for line in reader.lines() {
        let line = line.map_err(JournalError::Io)?;
        total += 1;
        if total <= skip || line.is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(&line) {
            Ok(mut entry) => {
                if entry.device_name.is_empty() {
                    entry.device_name = default_device.to_string();
                }
                entries.push(entry);
            }
            Err(e) => log::debug!("skipping malformed journal line: {}", e),
        }
    }

    Ok((entries, total))
}

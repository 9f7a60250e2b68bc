//! Reading the on-disk history databases.
//!
//! The live files are locked by the running browser, so each read copies
//! the database to a sibling temp path, queries the copy read-only and
//! deletes it. Chromium stores visit times in microseconds since
//! 1601-01-01 UTC; Firefox in microseconds since the Unix epoch.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};

/// Microseconds between 1601-01-01 and 1970-01-01.
const WINDOWS_EPOCH_OFFSET_MICROS: i64 = 11_644_473_600_000_000;

/// Visits newer than the watermark are fetched newest-first, capped per
/// cycle.
const QUERY_LIMIT: u32 = 50;

#[derive(Debug, Clone)]
pub struct Visit {
    pub url: String,
    pub title: String,
    pub visited_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum HistoryError {
    Io(std::io::Error),
    Sql(rusqlite::Error),
}

impl std::fmt::Display for HistoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryError::Io(e) => write!(f, "history I/O error: {}", e),
            HistoryError::Sql(e) => write!(f, "history query error: {}", e),
        }
    }
}

impl std::error::Error for HistoryError {}

impl From<std::io::Error> for HistoryError {
    fn from(e: std::io::Error) -> Self {
        HistoryError::Io(e)
    }
}

impl From<rusqlite::Error> for HistoryError {
    fn from(e: rusqlite::Error) -> Self {
        HistoryError::Sql(e)
    }
}

pub fn read_chromium_history(
    path: &Path,
    since: DateTime<Utc>,
) -> Result<Vec<Visit>, HistoryError> {
    let since_micros = since.timestamp_micros() + WINDOWS_EPOCH_OFFSET_MICROS;
    query_copy(
        path,
        "SELECT url, title, last_visit_time
         FROM urls
         WHERE last_visit_time > ?1
         ORDER BY last_visit_time DESC
         LIMIT ?2",
        since_micros,
        chromium_time,
    )
}

pub fn read_firefox_history(
    path: &Path,
    since: DateTime<Utc>,
) -> Result<Vec<Visit>, HistoryError> {
    query_copy(
        path,
        "SELECT url, title, last_visit_date
         FROM moz_places
         WHERE last_visit_date > ?1
         ORDER BY last_visit_date DESC
         LIMIT ?2",
        since.timestamp_micros(),
        unix_time,
    )
}

fn query_copy(
    path: &Path,
    sql: &str,
    since_micros: i64,
    to_utc: fn(i64) -> Option<DateTime<Utc>>,
) -> Result<Vec<Visit>, HistoryError> {
    let temp_path = temp_copy_path(path);
    fs::copy(path, &temp_path)?;

    let result = query_visits(&temp_path, sql, since_micros, to_utc);
    if let Err(e) = fs::remove_file(&temp_path) {
        log::debug!("failed to remove history copy {}: {}", temp_path.display(), e);
    }
    result
}

fn query_visits(
    path: &Path,
    sql: &str,
    since_micros: i64,
    to_utc: fn(i64) -> Option<DateTime<Utc>>,
) -> Result<Vec<Visit>, HistoryError> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let mut statement = conn.prepare(sql)?;

    let rows = statement.query_map(rusqlite::params![since_micros, QUERY_LIMIT], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;

    let mut visits = Vec::new();
    for row in rows {
        let (url, title, micros) = match row {
            Ok(row) => row,
            Err(e) => {
                log::debug!("skipping unreadable history row: {}", e);
                continue;
            }
        };
        if let Some(visited_at) = to_utc(micros) {
            visits.push(Visit {
                url,
                title: title.unwrap_or_default(),
                visited_at,
            });
        }
    }
    Ok(visits)
}

fn chromium_time(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros - WINDOWS_EPOCH_OFFSET_MICROS)
}

fn unix_time(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}

fn temp_copy_path(path: &Path) -> PathBuf {
    let mut temp = path.as_os_str().to_os_string();
    temp.push(".tmp");
    PathBuf::from(temp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn chromium_micros(at: DateTime<Utc>) -> i64 {
        at.timestamp_micros() + WINDOWS_EPOCH_OFFSET_MICROS
    }

    fn make_chromium_db(path: &Path, visits: &[(&str, &str, DateTime<Utc>)]) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE urls (
                id INTEGER PRIMARY KEY,
                url TEXT,
                title TEXT,
                last_visit_time INTEGER
            );",
        )
        .unwrap();
        for (url, title, at) in visits {
            conn.execute(
                "INSERT INTO urls (url, title, last_visit_time) VALUES (?1, ?2, ?3)",
                rusqlite::params![url, title, chromium_micros(*at)],
            )
            .unwrap();
        }
    }

    fn make_firefox_db(path: &Path, visits: &[(&str, &str, DateTime<Utc>)]) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE moz_places (
                id INTEGER PRIMARY KEY,
                url TEXT,
                title TEXT,
                last_visit_date INTEGER
            );",
        )
        .unwrap();
        for (url, title, at) in visits {
            conn.execute(
                "INSERT INTO moz_places (url, title, last_visit_date) VALUES (?1, ?2, ?3)",
                rusqlite::params![url, title, at.timestamp_micros()],
            )
            .unwrap();
        }
    }

    #[test]
    fn chromium_reads_visits_newer_than_watermark() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("History");
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();

        make_chromium_db(
            &db,
            &[
                ("https://example.org/a", "A", t0 - chrono::Duration::seconds(10)),
                ("https://example.org/b", "B", t0),
                ("https://example.org/c", "C", t0 + chrono::Duration::seconds(5)),
            ],
        );

        let watermark = t0 - chrono::Duration::minutes(5);
        let visits = read_chromium_history(&db, watermark).unwrap();
        assert_eq!(visits.len(), 3);
        // Newest first.
        assert_eq!(visits[0].url, "https://example.org/c");
        assert_eq!(visits[0].visited_at, t0 + chrono::Duration::seconds(5));

        // Strictly newer: the max timestamp itself is excluded next time.
        let visits = read_chromium_history(&db, t0 + chrono::Duration::seconds(5)).unwrap();
        assert!(visits.is_empty());

        // The temp copy was cleaned up.
        assert!(!dir.path().join("History.tmp").exists());
    }

    #[test]
    fn firefox_reads_unix_micros() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("places.sqlite");
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 12, 30, 0).unwrap();

        make_firefox_db(&db, &[("https://wikipedia.org/wiki/Rust", "Rust", t0)]);

        let visits =
            read_firefox_history(&db, t0 - chrono::Duration::minutes(5)).unwrap();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].visited_at, t0);
        assert_eq!(visits[0].title, "Rust");
    }

    #[test]
    fn missing_title_becomes_empty() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("History");
        let conn = Connection::open(&db).unwrap();
        conn.execute_batch(
            "CREATE TABLE urls (id INTEGER PRIMARY KEY, url TEXT, title TEXT, last_visit_time INTEGER);",
        )
        .unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        conn.execute(
            "INSERT INTO urls (url, title, last_visit_time) VALUES (?1, NULL, ?2)",
            rusqlite::params!["https://example.org", chromium_micros(t0)],
        )
        .unwrap();
        drop(conn);

        let visits =
            read_chromium_history(&db, t0 - chrono::Duration::minutes(1)).unwrap();
        assert_eq!(visits[0].title, "");
    }

    #[test]
    fn epoch_conversion_round_trips() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        assert_eq!(chromium_time(chromium_micros(t0)), Some(t0));
        assert_eq!(unix_time(t0.timestamp_micros()), Some(t0));
    }
}

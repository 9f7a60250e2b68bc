//! Browser history capture.
//!
//! Chrome and Edge share the Chromium history schema; Firefox keeps its
//! own. Each supported browser is read incrementally against a per-browser
//! watermark so a visit is never reported twice and a visit landing after
//! the copy is picked up on the next tick.

mod history;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

use crate::events::AgentEvent;
use history::{read_chromium_history, read_firefox_history, Visit};

const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// First-use watermark: cap replay at five minutes of history.
const INITIAL_LOOKBACK_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Schema {
    Chromium,
    Firefox,
}

const BROWSERS: [(&str, Schema); 3] = [
    ("Chrome", Schema::Chromium),
    ("Edge", Schema::Chromium),
    ("Firefox", Schema::Firefox),
];

pub struct BrowserReader {
    events: mpsc::Sender<AgentEvent>,
    user_rx: watch::Receiver<String>,
    /// Largest visit timestamp already reported, per browser name.
    watermarks: HashMap<String, DateTime<Utc>>,
}

impl BrowserReader {
    pub fn new(events: mpsc::Sender<AgentEvent>, user_rx: watch::Receiver<String>) -> Self {
        Self {
            events,
            user_rx,
            watermarks: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        log::info!("browser history capture started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        log::info!("browser history capture stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn tick(&mut self) {
        let user = self.user_rx.borrow().clone();
        if user.is_empty() {
            return;
        }

        for (browser, schema) in BROWSERS {
            let path = match history_path(browser, schema, &user) {
                Some(path) if path.exists() => path,
                _ => continue,
            };

            let watermark = *self
                .watermarks
                .entry(browser.to_string())
                .or_insert_with(|| {
                    Utc::now() - chrono::Duration::minutes(INITIAL_LOOKBACK_MINUTES)
                });

            let visits = match schema {
                Schema::Chromium => read_chromium_history(&path, watermark),
                Schema::Firefox => read_firefox_history(&path, watermark),
            };
            let visits = match visits {
                Ok(visits) => visits,
                Err(e) => {
                    log::debug!("{} history read failed: {}", browser, e);
                    continue;
                }
            };

            let (actions, new_watermark) = filter_and_advance(&visits, watermark);
            if new_watermark > watermark {
                self.watermarks.insert(browser.to_string(), new_watermark);
            }

            let count = actions.len();
            for action in actions {
                let event = AgentEvent::BrowserVisit {
                    browser: browser.to_string(),
                    action,
                };
                if self.events.send(event).await.is_err() {
                    log::error!("event bus closed, browser event dropped");
                    return;
                }
            }
            if count > 0 {
                log::info!("logged {} new {} visits", count, browser);
            }
        }
    }
}

/// Turn a cycle's rows into journal actions and the advanced watermark.
/// The watermark moves to the maximum visit time over all rows seen
/// (filtered rows included), never to the wall clock.
fn filter_and_advance(
    visits: &[Visit],
    watermark: DateTime<Utc>,
) -> (Vec<String>, DateTime<Utc>) {
    let mut actions = Vec::new();
    let mut max_seen = watermark;

    for visit in visits {
        if visit.visited_at > max_seen {
            max_seen = visit.visited_at;
        }
        if !is_important_url(&visit.url) {
            continue;
        }
        if !visit.title.is_empty() && visit.title.len() < 100 {
            actions.push(format!("Visited: {} ({})", visit.url, visit.title));
        } else {
            actions.push(format!("Visited: {}", visit.url));
        }
    }

    (actions, max_seen)
}

/// Heuristic filter: suppress browser-internal pages, extensions and long
/// redirect/tracking URLs while keeping meaningful navigation.
//
// TODO: the trailing <200-character acceptance effectively admits almost
// every ordinary URL; tighten once the server side can express a deny
// pattern list.
fn is_important_url(url: &str) -> bool {
    if url.starts_with("chrome://")
        || url.starts_with("edge://")
        || url.starts_with("about:")
        || url.starts_with("chrome-extension://")
        || url.starts_with("moz-extension://")
    {
        return false;
    }

    url.contains("google.com/search")
        || url.contains("bing.com/search")
        || url.contains("youtube.com/watch")
        || url.contains("github.com")
        || url.contains("stackoverflow.com")
        || url.contains("facebook.com")
        || url.contains("twitter.com")
        || url.contains("instagram.com")
        || url.contains("reddit.com")
        || url.contains("wikipedia.org")
        || url.len() < 200
}

/// On-disk location of a browser's history database for `user`.
fn history_path(browser: &str, schema: Schema, user: &str) -> Option<PathBuf> {
    match (browser, schema) {
        ("Chrome", _) => Some(PathBuf::from(format!(
            "C:\\Users\\{}\\AppData\\Local\\Google\\Chrome\\User Data\\Default\\History",
            user
        ))),
        ("Edge", _) => Some(PathBuf::from(format!(
            "C:\\Users\\{}\\AppData\\Local\\Microsoft\\Edge\\User Data\\Default\\History",
            user
        ))),
        (_, Schema::Firefox) => firefox_places_path(user),
        _ => None,
    }
}

/// Firefox keeps history under a profile directory with a generated name;
/// the active default profile ends in `.default-release`.
fn firefox_places_path(user: &str) -> Option<PathBuf> {
    let profiles = PathBuf::from(format!(
        "C:\\Users\\{}\\AppData\\Roaming\\Mozilla\\Firefox\\Profiles",
        user
    ));
    let entries = std::fs::read_dir(&profiles).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir()
            && path
                .file_name()
                .map_or(false, |n| n.to_string_lossy().ends_with(".default-release"))
        {
            return Some(path.join("places.sqlite"));
        }
    }
    None
}

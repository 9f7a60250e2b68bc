//! The allow-list store: cache-backed, server-refreshable, served to
//! concurrent readers.
//!
//! The in-memory policy lives behind a single reader/writer lock and is
//! replaced atomically on update; `is_allowed` callers see either the old
//! or the new policy, never a hybrid. Until `initialize` has run the store
//! fails open: the agent must not terminate the session that launched it
//! before the policy has even arrived.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use super::types::{default_policy, is_system_path, normalize_path, rule_matches, Policy};
use super::PolicyError;

pub struct PolicyStore {
    cache_path: PathBuf,
    server_url: Option<String>,
    http: reqwest::Client,
    policy: RwLock<Option<Policy>>,
    initialized: AtomicBool,
}

impl PolicyStore {
    pub fn new(cache_path: PathBuf, server_url: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        Self {
            cache_path,
            server_url,
            http,
            policy: RwLock::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    /// Bring up the store: cache first, then the server, then the built-in
    /// default. Never fails; a machine with no cache and no server still
    /// enforces the default policy. Whatever policy we end up with is
    /// written back to the cache.
    pub async fn initialize(&self) {
        let policy = match self.load_cache() {
            Ok(policy) => policy,
            Err(e) => {
                log::warn!("allow-list cache unavailable: {}", e);
                match self.download().await {
                    Ok(policy) => policy,
                    Err(e) => {
                        log::warn!("allow-list server unavailable: {}", e);
                        log::warn!("falling back to the built-in default allow-list");
                        default_policy()
                    }
                }
            }
        };

        if let Err(e) = self.save_cache(&policy) {
            log::error!("failed to persist allow-list cache: {}", e);
        }

        log::info!(
            "allow-list initialized: version {}, {} items",
            policy.version,
            policy.items.len()
        );

        *self.policy.write() = Some(policy);
        self.initialized.store(true, Ordering::SeqCst);
    }

    /// Three-pass decision: exact rule, wildcard rule, implicit system
    /// path. Fails open during warmup.
    pub fn is_allowed(&self, path: &str) -> bool {
        if !self.initialized.load(Ordering::SeqCst) {
            log::warn!("allow-list not initialized yet, permitting: {}", path);
            return true;
        }

        let guard = self.policy.read();
        let policy = match guard.as_ref() {
            Some(policy) => policy,
            None => return true,
        };

        let normalized = normalize_path(path);

        if policy
            .items
            .iter()
            .any(|item| !item.ends_with('*') && normalize_path(item) == normalized)
        {
            log::debug!("allowed (exact): {}", path);
            return true;
        }

        if policy
            .items
            .iter()
            .any(|item| item.ends_with('*') && rule_matches(item, &normalized))
        {
            log::debug!("allowed (pattern): {}", path);
            return true;
        }

        if is_system_path(&normalized) {
            log::debug!("allowed (system path): {}", path);
            return true;
        }

        false
    }

    /// Fetch the policy from the server and swap it in if the version
    /// changed. The previous policy stays in effect on any failure.
    pub async fn update(&self) -> Result<(), PolicyError> {
        let fresh = self.download().await?;

        let mut guard = self.policy.write();
        if let Some(current) = guard.as_ref() {
            if current.version == fresh.version {
                log::debug!("allow-list already current (version {})", current.version);
                return Ok(());
            }
            log::info!(
                "allow-list updated: {} -> {} ({} items)",
                current.version,
                fresh.version,
                fresh.items.len()
            );
        }

        if let Err(e) = self.save_cache(&fresh) {
            log::error!("failed to persist allow-list cache: {}", e);
        }
        *guard = Some(fresh);
        Ok(())
    }

    pub fn get_version(&self) -> String {
        self.policy
            .read()
            .as_ref()
            .map(|p| p.version.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn get_item_count(&self) -> usize {
        self.policy.read().as_ref().map_or(0, |p| p.items.len())
    }

    /// Defensive copy of the rule list.
    pub fn snapshot_items(&self) -> Vec<String> {
        self.policy
            .read()
            .as_ref()
            .map(|p| p.items.clone())
            .unwrap_or_default()
    }

    /// Administrative addition. Rejects duplicates with a distinguished
    /// error and persists the cache.
    pub fn add_item(&self, path: &str) -> Result<(), PolicyError> {
        let mut guard = self.policy.write();
        let policy = guard
            .as_mut()
            .ok_or_else(|| PolicyError::Load("allow-list not initialized".to_string()))?;

        let normalized = normalize_path(path);
        if policy
            .items
            .iter()
            .any(|item| normalize_path(item) == normalized)
        {
            return Err(PolicyError::AlreadyExists(path.to_string()));
        }

        policy.items.push(path.to_string());
        policy.updated_at = Utc::now();
        // The cache write happens under the exclusive lock, like update().
        let snapshot = policy.clone();
        self.save_cache(&snapshot)?;
        log::info!("allow-list item added: {}", path);
        Ok(())
    }

    /// Administrative removal. Rejects unknown items with a distinguished
    /// error and persists the cache.
    pub fn remove_item(&self, path: &str) -> Result<(), PolicyError> {
        let mut guard = self.policy.write();
        let policy = guard
            .as_mut()
            .ok_or_else(|| PolicyError::Load("allow-list not initialized".to_string()))?;

        let normalized = normalize_path(path);
        let before = policy.items.len();
        policy
            .items
            .retain(|item| normalize_path(item) != normalized);
        if policy.items.len() == before {
            return Err(PolicyError::NotFound(path.to_string()));
        }

        policy.updated_at = Utc::now();
        let snapshot = policy.clone();
        self.save_cache(&snapshot)?;
        log::info!("allow-list item removed: {}", path);
        Ok(())
    }

    /// Opt-in content check: true unless the policy carries a hash for
    /// this path and the file's SHA-256 disagrees with it. Read errors
    /// fail open.
    pub fn validate_checksum(&self, path: &str) -> bool {
        let expected = {
            let guard = self.policy.read();
            guard
                .as_ref()
                .and_then(|p| p.hashes.as_ref())
                .and_then(|hashes| hashes.get(&normalize_path(path)))
                .cloned()
        };

        let expected = match expected {
            Some(hash) => hash,
            None => return true,
        };

        let actual = match hash_file(Path::new(path)) {
            Ok(hash) => hash,
            Err(e) => {
                log::warn!("checksum read failed for {}: {}", path, e);
                return true;
            }
        };

        let matches = expected.eq_ignore_ascii_case(&actual);
        if !matches {
            log::warn!(
                "checksum mismatch for {} (expected {}, got {})",
                path,
                expected,
                actual
            );
        }
        matches
    }

    fn load_cache(&self) -> Result<Policy, PolicyError> {
        let data = fs::read(&self.cache_path)
            .map_err(|e| PolicyError::Load(format!("{}: {}", self.cache_path.display(), e)))?;
        serde_json::from_slice(&data).map_err(|e| PolicyError::Parse(e.to_string()))
    }

    fn save_cache(&self, policy: &Policy) -> Result<(), PolicyError> {
        if let Some(parent) = self.cache_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| PolicyError::Load(format!("{}: {}", parent.display(), e)))?;
        }
        let data =
            serde_json::to_vec_pretty(policy).map_err(|e| PolicyError::Parse(e.to_string()))?;
        fs::write(&self.cache_path, data)
            .map_err(|e| PolicyError::Load(format!("{}: {}", self.cache_path.display(), e)))
    }

    async fn download(&self) -> Result<Policy, PolicyError> {
        let url = self
            .server_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| PolicyError::Network("no allow-list server configured".to_string()))?;

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| PolicyError::Network(e.to_string()))?
            .error_for_status()
            .map_err(|e| PolicyError::Network(e.to_string()))?;

        response
            .json::<Policy>()
            .await
            .map_err(|e| PolicyError::Parse(e.to_string()))
    }

    #[cfg(test)]
    pub(crate) fn with_policy(cache_path: PathBuf, policy: Policy) -> Self {
        let store = Self::new(cache_path, None);
        *store.policy.write() = Some(policy);
        store.initialized.store(true, Ordering::SeqCst);
        store
    }
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

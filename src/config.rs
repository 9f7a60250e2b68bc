//! Agent configuration.
//!
//! JSON file under ProgramData. A missing file is replaced by written-out
//! defaults; missing fields in an existing file are filled in so old
//! configs keep working after upgrades.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "C:\\ProgramData\\ClassGuard\\config\\agent.json";

const DEFAULT_LOG_DIR: &str = "C:\\ProgramData\\ClassGuard\\logs";
const DEFAULT_WHITELIST_PATH: &str = "C:\\ProgramData\\ClassGuard\\whitelist.json";
const DEFAULT_PROJECT_BASE: &str = "D:\\UserProjects";
const DEFAULT_IPC_ADDR: &str = "127.0.0.1:47620";
const DEFAULT_UPDATE_INTERVAL_MINUTES: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log_path: String,
    #[serde(default)]
    pub whitelist_path: String,
    #[serde(default)]
    pub whitelist_url: String,
    #[serde(default)]
    pub server_url: String,
    #[serde(default)]
    pub device_token: String,
    #[serde(default)]
    pub hostname: String,
    /// Allow-list refresh period in minutes.
    #[serde(default)]
    pub update_interval: u64,
    #[serde(default)]
    pub log_level: String,
    #[serde(default)]
    pub project_base: String,
    /// Local shell activity endpoint. `None` means the built-in default;
    /// an explicit empty string disables the listener.
    #[serde(default)]
    pub ipc_addr: Option<String>,
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown-device".to_string());

        Self {
            log_path: DEFAULT_LOG_DIR.to_string(),
            whitelist_path: DEFAULT_WHITELIST_PATH.to_string(),
            whitelist_url: String::new(),
            server_url: String::new(),
            device_token: "unknown-device".to_string(),
            hostname: host,
            update_interval: DEFAULT_UPDATE_INTERVAL_MINUTES,
            log_level: "info".to_string(),
            project_base: DEFAULT_PROJECT_BASE.to_string(),
            ipc_addr: None,
            debug_mode: false,
            dry_run: false,
        }
    }
}

impl Config {
    /// Load the configuration from `path`, creating it with defaults when
    /// absent. Only filesystem-level faults are fatal.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            let config = Config::default();
            config.save(path)?;
            return Ok(config);
        }

        let data = fs::read(path)
            .map_err(|e| ConfigError::Io(format!("reading {}: {}", path.display(), e)))?;
        let mut config: Config = serde_json::from_slice(&data)
            .map_err(|e| ConfigError::Parse(format!("parsing {}: {}", path.display(), e)))?;

        config.fill_defaults();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ConfigError::Io(format!("creating {}: {}", parent.display(), e)))?;
        }
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        fs::write(path, data)
            .map_err(|e| ConfigError::Io(format!("writing {}: {}", path.display(), e)))
    }

    fn fill_defaults(&mut self) {
        let defaults = Config::default();
        if self.log_path.is_empty() {
            self.log_path = defaults.log_path;
        }
        if self.whitelist_path.is_empty() {
            self.whitelist_path = defaults.whitelist_path;
        }
        if self.device_token.is_empty() {
            self.device_token = defaults.device_token;
        }
        if self.hostname.is_empty() {
            self.hostname = defaults.hostname;
        }
        if self.update_interval == 0 {
            self.update_interval = defaults.update_interval;
        }
        if self.log_level.is_empty() {
            self.log_level = defaults.log_level;
        }
        if self.project_base.is_empty() {
            self.project_base = defaults.project_base;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.log_level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::Invalid(format!("unknown log level: {}", other)));
            }
        }
        Ok(())
    }

    /// Create the directories the agent writes into. Called once at
    /// startup; a failure here is the only fatal filesystem condition.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        let mut dirs = vec![PathBuf::from(&self.log_path)];
        if let Some(parent) = Path::new(&self.whitelist_path).parent() {
            dirs.push(parent.to_path_buf());
        }
        for dir in dirs {
            fs::create_dir_all(&dir)
                .map_err(|e| ConfigError::Io(format!("creating {}: {}", dir.display(), e)))?;
        }
        Ok(())
    }

    /// The shell IPC endpoint, or `None` when explicitly disabled.
    pub fn ipc_endpoint(&self) -> Option<String> {
        match &self.ipc_addr {
            None => Some(DEFAULT_IPC_ADDR.to_string()),
            Some(addr) if addr.is_empty() => None,
            Some(addr) => Some(addr.clone()),
        }
    }

    /// Effective log level, with `--debug` / `debug_mode` forcing debug.
    pub fn effective_log_level(&self, debug_flag: bool) -> &str {
        if debug_flag || self.debug_mode {
            "debug"
        } else {
            self.log_level.as_str()
        }
    }
}

/// Pull the config path out of raw process arguments.
pub fn config_path_from_args(args: &[String]) -> PathBuf {
    for (i, arg) in args.iter().enumerate() {
        if (arg == "--config" || arg == "-c") && i + 1 < args.len() {
            return PathBuf::from(&args[i + 1]);
        }
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "config parse error: {}", e),
            ConfigError::Invalid(e) => write!(f, "invalid config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config").join("agent.json");

        let config = Config::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.update_interval, 30);
        assert_eq!(config.log_level, "info");
        assert!(!config.dry_run);
    }

    #[test]
    fn missing_fields_are_filled() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.json");
        fs::write(&path, br#"{"server_url": "tcp://srv:9000", "log_level": "warn"}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server_url, "tcp://srv:9000");
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.update_interval, 30);
        assert!(!config.whitelist_path.is_empty());
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.json");
        fs::write(&path, br#"{"log_level": "verbose"}"#).unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn ipc_endpoint_disable() {
        let mut config = Config::default();
        assert_eq!(config.ipc_endpoint().as_deref(), Some("127.0.0.1:47620"));
        config.ipc_addr = Some(String::new());
        assert_eq!(config.ipc_endpoint(), None);
        config.ipc_addr = Some("127.0.0.1:9000".to_string());
        assert_eq!(config.ipc_endpoint().as_deref(), Some("127.0.0.1:9000"));
    }

    #[test]
    fn config_flags() {
        let args: Vec<String> = ["agent.exe", "--config", "D:\\cfg.json", "--dry-run"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(config_path_from_args(&args), PathBuf::from("D:\\cfg.json"));
        assert!(has_flag(&args, "--dry-run"));
        assert!(!has_flag(&args, "--debug"));
    }
}

//! Configuration management module

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub stream: StreamSettings,

    #[serde(skip)]
    config_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// How long a writer waits on a locked database before failing, in
    /// milliseconds (the activity sink and the admin API write concurrently)
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Base interval between health probes, in seconds
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,

    /// Ceiling for the probe backoff, in seconds
    #[serde(default = "default_health_backoff_max")]
    pub health_backoff_max_secs: u64,

    /// HTTP timeout for upstream qBittorrent requests, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Fallback sync interval in minutes for instances without their own
    #[serde(default = "default_sync_interval")]
    pub default_interval_mins: u64,

    /// Scan content paths for hardlink scopes (needs local FS access to the
    /// instances' save paths)
    #[serde(default)]
    pub hardlink_scan: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Heartbeat cadence on open SSE connections, in seconds
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/armada.db")
}

fn default_busy_timeout() -> u64 {
    5000
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_backoff_max() -> u64 {
    300
}

fn default_request_timeout() -> u64 {
    30
}

fn default_sync_interval() -> u64 {
    2
}

fn default_heartbeat() -> u64 {
    30
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            health_interval_secs: default_health_interval(),
            health_backoff_max_secs: default_health_backoff_max(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            default_interval_mins: default_sync_interval(),
            hardlink_scan: false,
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            database: DatabaseSettings::default(),
            pool: PoolSettings::default(),
            sync: SyncSettings::default(),
            stream: StreamSettings::default(),
            config_file: None,
        }
    }
}

impl Settings {
    /// Load settings from environment and config file
    pub fn load() -> Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        // Try to find config file
        let mut config_paths = vec![
            PathBuf::from("config.toml"),
            PathBuf::from("./data/config.toml"),
        ];
        if let Some(path) = dirs_config_path() {
            config_paths.push(path);
        }

        let mut settings = Settings::default();

        for path in config_paths.iter() {
            if path.exists() {
                settings = Self::load_from_file(path)?;
                settings.config_file = Some(path.clone());
                break;
            }
        }

        // Override with environment variables
        settings.apply_env_overrides();

        // Ensure data directory exists
        if let Some(parent) = settings.database.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create data directory")?;
        }

        Ok(settings)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("ARMADA_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("ARMADA_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(path) = std::env::var("ARMADA_DATA_DIR") {
            self.database.path = PathBuf::from(path).join("armada.db");
        }
        if let Ok(path) = std::env::var("ARMADA_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Ok(secs) = std::env::var("ARMADA_HEALTH_INTERVAL") {
            if let Ok(secs) = secs.parse() {
                self.pool.health_interval_secs = secs;
            }
        }
    }

    /// Get the path to the config file (if loaded from file)
    pub fn config_path(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }
}

/// Get platform-specific config directory
fn dirs_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
            .map(|p| p.join("armada/config.toml"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/armada/config.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA")
            .ok()
            .map(|p| PathBuf::from(p).join("armada/config.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        None
    }
}

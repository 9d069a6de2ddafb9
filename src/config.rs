//! Configuration management for smewtd
//!
//! Handles loading configuration from ~/.config/smewtd/config.toml. The
//! configuration is read once at startup and never mutated afterwards; the
//! registry, router and download manager all borrow from the same `Config`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration file name
const CONFIG_FILE: &str = "config.toml";

/// Application name for config and data directories
const APP_NAME: &str = "smewtd";

/// Default address the peer API listens on
pub const DEFAULT_PEER_LISTEN: &str = "0.0.0.0:6777";

const DEFAULT_PEER_TIMEOUT_SECS: u64 = 5;
const DEFAULT_BROADCAST_DEADLINE_SECS: u64 = 8;
const DEFAULT_TRANSFER_IDLE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// One `[[friends]]` entry
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct FriendConfig {
    /// Unique name used to address the friend
    pub name: String,
    /// Endpoint of the friend's peer API (`host:port` or a full URL)
    pub address: String,
    /// Bearer token sent on calls to this friend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl std::fmt::Debug for FriendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FriendConfig")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("credential", &self.credential.as_ref().map(|_| "********"))
            .finish()
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Identifier of the local storage domain; selects the index database
    #[serde(default = "default_storage_domain")]
    pub storage_domain: String,

    /// Folder where completed downloads land. Must already exist.
    pub incoming_folder: PathBuf,

    /// Folder indexed at startup and served to friends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_folder: Option<PathBuf>,

    /// Where the socket, PID file and databases live
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Listen address of the peer API
    #[serde(default = "default_peer_listen")]
    pub peer_listen: String,

    /// Token friends must present when calling the peer API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_token: Option<String>,

    /// Ceiling for a single remote query
    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,

    /// Overall deadline for a broadcast query
    #[serde(default = "default_broadcast_deadline_secs")]
    pub broadcast_deadline_secs: u64,

    /// How long a transfer may go without receiving bytes
    #[serde(default = "default_transfer_idle_timeout_secs")]
    pub transfer_idle_timeout_secs: u64,

    /// How long quit waits for in-flight transfers
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Trusted peers, in the order they are consulted
    #[serde(default)]
    pub friends: Vec<FriendConfig>,
}

fn default_storage_domain() -> String {
    "local".to_string()
}

fn default_peer_listen() -> String {
    DEFAULT_PEER_LISTEN.to_string()
}

fn default_peer_timeout_secs() -> u64 {
    DEFAULT_PEER_TIMEOUT_SECS
}

fn default_broadcast_deadline_secs() -> u64 {
    DEFAULT_BROADCAST_DEADLINE_SECS
}

fn default_transfer_idle_timeout_secs() -> u64 {
    DEFAULT_TRANSFER_IDLE_TIMEOUT_SECS
}

fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}

impl Config {
    /// Create a configuration with defaults for everything but the incoming folder
    pub fn new(incoming_folder: impl Into<PathBuf>) -> Self {
        Self {
            storage_domain: default_storage_domain(),
            incoming_folder: incoming_folder.into(),
            shared_folder: None,
            data_dir: None,
            peer_listen: default_peer_listen(),
            peer_token: None,
            peer_timeout_secs: DEFAULT_PEER_TIMEOUT_SECS,
            broadcast_deadline_secs: DEFAULT_BROADCAST_DEADLINE_SECS,
            transfer_idle_timeout_secs: DEFAULT_TRANSFER_IDLE_TIMEOUT_SECS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            friends: Vec::new(),
        }
    }

    /// Get the config file path
    ///
    /// Returns ~/.config/smewtd/config.toml on Linux
    pub fn config_path() -> ConfigResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Load configuration from the default location
    pub fn load() -> ConfigResult<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load and validate configuration from a specific file
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(contents: &str) -> ConfigResult<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file, creating its directory if needed
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Check the invariants the rest of the daemon relies on
    pub fn validate(&self) -> ConfigResult<()> {
        if self.storage_domain.trim().is_empty() {
            return Err(ConfigError::Invalid("storage_domain is empty".into()));
        }

        for (name, secs) in [
            ("peer_timeout_secs", self.peer_timeout_secs),
            ("broadcast_deadline_secs", self.broadcast_deadline_secs),
            ("transfer_idle_timeout_secs", self.transfer_idle_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        let mut seen = HashSet::new();
        for friend in &self.friends {
            if friend.name.trim().is_empty() {
                return Err(ConfigError::Invalid("friend with empty name".into()));
            }
            if friend.address.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "friend '{}' has no address",
                    friend.name
                )));
            }
            if !seen.insert(friend.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate friend name '{}'",
                    friend.name
                )));
            }
        }

        Ok(())
    }

    /// Fail unless the incoming folder exists and is a directory.
    ///
    /// Checked when the daemon starts rather than at parse time so the
    /// config can be inspected on machines where the folder is absent.
    pub fn check_incoming_folder(&self) -> ConfigResult<()> {
        if !self.incoming_folder.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "incoming folder {} does not exist or is not a directory",
                self.incoming_folder.display()
            )));
        }
        Ok(())
    }

    /// Directory holding runtime state
    pub fn effective_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    /// Path of the local media index database for this storage domain
    pub fn index_db_path(&self) -> PathBuf {
        let domain: String = self
            .storage_domain
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.effective_data_dir().join(format!("index-{}.db", domain))
    }

    /// Path of the transfer state database
    pub fn state_db_path(&self) -> PathBuf {
        self.effective_data_dir().join("state.db")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.effective_data_dir().join("smewtd.sock")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.effective_data_dir().join("smewtd.pid")
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    pub fn broadcast_deadline(&self) -> Duration {
        Duration::from_secs(self.broadcast_deadline_secs)
    }

    pub fn transfer_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_idle_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Default runtime directory (~/.local/share/smewtd on Linux)
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Format the configuration for display
pub fn format_config(config: &Config) -> String {
    let mut lines = Vec::new();

    lines.push("Current configuration:".to_string());
    lines.push(String::new());
    lines.push(format!("  storage_domain = \"{}\"", config.storage_domain));
    lines.push(format!(
        "  incoming_folder = \"{}\"",
        config.incoming_folder.display()
    ));

    match config.shared_folder {
        Some(ref folder) => lines.push(format!("  shared_folder = \"{}\"", folder.display())),
        None => lines.push("  shared_folder = (not set)".to_string()),
    }

    lines.push(format!(
        "  data_dir = \"{}\"",
        config.effective_data_dir().display()
    ));
    lines.push(format!("  peer_listen = \"{}\"", config.peer_listen));

    if config.peer_token.is_some() {
        lines.push("  peer_token = \"********\" (set)".to_string());
    } else {
        lines.push("  peer_token = (not set, peer API is open)".to_string());
    }

    lines.push(format!("  peer_timeout_secs = {}", config.peer_timeout_secs));
    lines.push(format!(
        "  broadcast_deadline_secs = {}",
        config.broadcast_deadline_secs
    ));
    lines.push(format!(
        "  transfer_idle_timeout_secs = {}",
        config.transfer_idle_timeout_secs
    ));
    lines.push(format!("  shutdown_grace_secs = {}", config.shutdown_grace_secs));

    if config.friends.is_empty() {
        lines.push("  friends = (none)".to_string());
    } else {
        lines.push(String::new());
        lines.push("Friends:".to_string());
        for friend in &config.friends {
            let auth = if friend.credential.is_some() {
                " (credential set)"
            } else {
                ""
            };
            lines.push(format!("  {} @ {}{}", friend.name, friend.address, auth));
        }
    }

    lines.join("\n")
}

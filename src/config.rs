//! Configuration for civic-intake

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("civic-intake")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite database and attachments
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// SQLite database file name inside `storage_dir`
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Maximum pooled SQLite connections
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// How long a connection waits on a locked database before giving up
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Host to bind the HTTP API to
    #[serde(default = "default_http_host")]
    pub http_host: String,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// HS256 secret for session tokens. Unset means a random per-process secret.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Session token lifetime in seconds
    #[serde(default = "default_token_expiry")]
    pub token_expiry_secs: u64,

    /// Prefix for the display label of anonymous principals
    #[serde(default = "default_anonymous_prefix")]
    pub anonymous_username_prefix: String,

    /// Number of device-identifier characters appended to the prefix
    #[serde(default = "default_anonymous_label_len")]
    pub anonymous_username_len: usize,

    /// Messages a single sender may submit per UTC day
    #[serde(default = "default_messages_per_day")]
    pub max_messages_per_day: i64,

    /// Replies a single message may accumulate
    #[serde(default = "default_replies_per_message")]
    pub max_replies_per_message: i32,

    /// Largest accepted attachment, in bytes
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: usize,

    /// Fewest options a poll may have
    #[serde(default = "default_min_poll_options")]
    pub min_poll_options: usize,

    /// Most options a poll may have
    #[serde(default = "default_max_poll_options")]
    pub max_poll_options: usize,
}

fn default_database_file() -> String {
    "civic.db".to_string()
}

fn default_pool_size() -> u32 {
    8
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8000
}

fn default_token_expiry() -> u64 {
    60 * 60 * 24 * 30
}

fn default_anonymous_prefix() -> String {
    "anon_".to_string()
}

fn default_anonymous_label_len() -> usize {
    8
}

fn default_messages_per_day() -> i64 {
    10
}

fn default_replies_per_message() -> i32 {
    10
}

fn default_max_attachment_bytes() -> usize {
    20 * 1024 * 1024
}

fn default_min_poll_options() -> usize {
    2
}

fn default_max_poll_options() -> usize {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            database_file: default_database_file(),
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
            http_host: default_http_host(),
            http_port: default_http_port(),
            jwt_secret: None,
            token_expiry_secs: default_token_expiry(),
            anonymous_username_prefix: default_anonymous_prefix(),
            anonymous_username_len: default_anonymous_label_len(),
            max_messages_per_day: default_messages_per_day(),
            max_replies_per_message: default_replies_per_message(),
            max_attachment_bytes: default_max_attachment_bytes(),
            min_poll_options: default_min_poll_options(),
            max_poll_options: default_max_poll_options(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get SQLite database path
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join(&self.database_file)
    }

    /// Get attachments directory
    pub fn attachments_dir(&self) -> PathBuf {
        self.storage_dir.join("attachments")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}

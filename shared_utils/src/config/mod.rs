//! Configuration management for NeonIPC.
//!
//! This module provides functionality for loading, parsing, and validating the
//! broker configuration. Settings come from a TOML file and may be overridden
//! by `NEONIPC_*` environment variables.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Missing required configuration value
    #[error("Missing required configuration value: {0}")]
    MissingValue(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

/// Access policy applied to a channel's OS object.
///
/// Levels are totally ordered; a higher level never grants more access than a
/// lower one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Low,
    Medium,
    /// Owner-only access
    #[default]
    High,
}

impl SecurityLevel {
    /// Permission bits for an object provisioned at this level.
    pub fn mode(self) -> u32 {
        match self {
            SecurityLevel::High => 0o600,
            SecurityLevel::Medium | SecurityLevel::Low => 0o666,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Some(SecurityLevel::Low),
            "medium" => Some(SecurityLevel::Medium),
            "high" => Some(SecurityLevel::High),
            _ => None,
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SecurityLevel::Low => "low",
            SecurityLevel::Medium => "medium",
            SecurityLevel::High => "high",
        };
        f.write_str(name)
    }
}

/// The three transports the broker serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Pipe,
    Queue,
    Shm,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [ChannelKind::Pipe, ChannelKind::Queue, ChannelKind::Shm];

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pipe" => Some(ChannelKind::Pipe),
            "queue" => Some(ChannelKind::Queue),
            "shm" => Some(ChannelKind::Shm),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelKind::Pipe => "pipe",
            ChannelKind::Queue => "queue",
            ChannelKind::Shm => "shm",
        };
        f.write_str(name)
    }
}

/// How payloads are delimited on byte-oriented channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// Bytes as written, NUL-terminated text
    #[default]
    Raw,
    /// u16 little-endian length followed by the payload
    LengthPrefixed,
}

/// Payload transform applied to every message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CipherAlgorithm {
    /// Repeating-key XOR
    #[default]
    Xor,
    /// AES-256-GCM with a key derived from `cipher.key`
    AesGcm,
}

/// What the authorization registry does when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    /// Reject unseen processes once the table is full
    #[default]
    Deny,
    /// Replace the entry with the oldest last activity
    OldestActivity,
}

/// Logging output settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Also write logs to a daily rolling file (default: false)
    #[serde(default)]
    pub log_to_file: bool,

    /// Directory for log files (default: "./logs")
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Emit JSON formatted logs (default: false)
    #[serde(default)]
    pub json_format: bool,
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_to_file: false,
            log_dir: default_log_dir(),
            json_format: false,
        }
    }
}

/// Broker loop settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    /// Sleep between polling passes in milliseconds (default: 100)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Order in which channels are polled within a pass
    #[serde(default = "default_order")]
    pub order: Vec<ChannelKind>,

    /// Remove the FIFO and SysV objects when the broker is signalled to stop
    #[serde(default)]
    pub remove_on_shutdown: bool,
}

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_order() -> Vec<ChannelKind> {
    ChannelKind::ALL.to_vec()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            tick_interval_ms: default_tick_interval_ms(),
            order: default_order(),
            remove_on_shutdown: false,
        }
    }
}

impl BrokerConfig {
    /// Returns the tick interval as a [`Duration`].
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Payload cipher settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CipherConfig {
    #[serde(default)]
    pub algorithm: CipherAlgorithm,

    /// Shared key; must be identical for the broker and every producer
    #[serde(default = "default_cipher_key")]
    pub key: String,
}

fn default_cipher_key() -> String {
    "neon_ipc_key".to_string()
}

impl Default for CipherConfig {
    fn default() -> Self {
        CipherConfig {
            algorithm: CipherAlgorithm::default(),
            key: default_cipher_key(),
        }
    }
}

/// Authorization registry settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// Maximum number of tracked processes (default: 10)
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default)]
    pub eviction: EvictionPolicy,
}

fn default_capacity() -> usize {
    10
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            capacity: default_capacity(),
            eviction: EvictionPolicy::default(),
        }
    }
}

/// Named pipe channel settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipeConfig {
    #[serde(default = "default_pipe_path")]
    pub path: PathBuf,

    #[serde(default)]
    pub security: SecurityLevel,

    #[serde(default)]
    pub framing: Framing,

    /// Check senders against the registry (pipes carry no sender id)
    #[serde(default)]
    pub authorize: bool,
}

fn default_pipe_path() -> PathBuf {
    PathBuf::from("process_comm")
}

impl Default for PipeConfig {
    fn default() -> Self {
        PipeConfig {
            path: default_pipe_path(),
            security: SecurityLevel::default(),
            framing: Framing::default(),
            authorize: false,
        }
    }
}

/// Message queue channel settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Path used to derive the SysV key; created empty if missing
    #[serde(default = "default_queue_path")]
    pub path: PathBuf,

    #[serde(default)]
    pub security: SecurityLevel,

    /// Check senders against the registry (default: true)
    #[serde(default = "default_true")]
    pub authorize: bool,
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("data_stream")
}

fn default_true() -> bool {
    true
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            path: default_queue_path(),
            security: SecurityLevel::default(),
            authorize: default_true(),
        }
    }
}

/// Shared memory channel settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShmConfig {
    /// Path used to derive the SysV key; created empty if missing
    #[serde(default = "default_shm_path")]
    pub path: PathBuf,

    #[serde(default)]
    pub security: SecurityLevel,

    /// Raw framing stores NUL-terminated ciphertext, so any message whose
    /// ciphertext contains a zero byte is refused. With the XOR cipher that
    /// happens whenever a text byte equals the key byte it lines up with
    /// (`"Test message 0"` under the default key). Use `length-prefixed` to
    /// carry arbitrary ciphertext.
    #[serde(default)]
    pub framing: Framing,

    /// Region size in bytes (default: 1024)
    #[serde(default = "default_shm_size")]
    pub size: usize,

    #[serde(default)]
    pub authorize: bool,
}

fn default_shm_path() -> PathBuf {
    PathBuf::from("shared_cache")
}

fn default_shm_size() -> usize {
    1024
}

impl Default for ShmConfig {
    fn default() -> Self {
        ShmConfig {
            path: default_shm_path(),
            security: SecurityLevel::default(),
            framing: Framing::default(),
            size: default_shm_size(),
            authorize: false,
        }
    }
}

/// Per-channel settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub pipe: PipeConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub shm: ShmConfig,
}

impl ChannelsConfig {
    /// Security level configured for the given channel.
    pub fn security(&self, kind: ChannelKind) -> SecurityLevel {
        match kind {
            ChannelKind::Pipe => self.pipe.security,
            ChannelKind::Queue => self.queue.security,
            ChannelKind::Shm => self.shm.security,
        }
    }

    /// Whether messages on the given channel are checked against the registry.
    pub fn authorize(&self, kind: ChannelKind) -> bool {
        match kind {
            ChannelKind::Pipe => self.pipe.authorize,
            ChannelKind::Queue => self.queue.authorize,
            ChannelKind::Shm => self.shm.authorize,
        }
    }
}

/// Main configuration structure for NeonIPC.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub cipher: CipherConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub channels: ChannelsConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            logging: LoggingConfig::default(),
            broker: BrokerConfig::default(),
            cipher: CipherConfig::default(),
            registry: RegistryConfig::default(),
            channels: ChannelsConfig::default(),
        }
    }
}

/// Largest shared memory region the length-prefixed framing can describe.
pub const MAX_SHM_SIZE: usize = u16::MAX as usize;

impl Config {
    /// Configuration file looked up when none is given
    pub const DEFAULT_PATH: &'static str = "neonipc.toml";

    /// Create a new default configuration
    pub fn new() -> Self {
        Config::default()
    }

    /// Load configuration from a TOML file, then apply `NEONIPC_*` overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cipher.key.is_empty() {
            return Err(ConfigError::MissingValue("cipher.key".to_string()));
        }

        if self.broker.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "broker.tick_interval_ms".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        let mut seen = Vec::with_capacity(ChannelKind::ALL.len());
        for kind in &self.broker.order {
            if seen.contains(kind) {
                return Err(ConfigError::InvalidValue {
                    key: "broker.order".to_string(),
                    message: format!("channel {kind} listed more than once"),
                });
            }
            seen.push(*kind);
        }
        if seen.len() != ChannelKind::ALL.len() {
            return Err(ConfigError::InvalidValue {
                key: "broker.order".to_string(),
                message: "must list pipe, queue and shm exactly once".to_string(),
            });
        }

        if self.registry.capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "registry.capacity".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        for (key, path) in [
            ("channels.pipe.path", &self.channels.pipe.path),
            ("channels.queue.path", &self.channels.queue.path),
            ("channels.shm.path", &self.channels.shm.path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "path cannot be empty".to_string(),
                });
            }
        }

        if self.channels.shm.size == 0 || self.channels.shm.size > MAX_SHM_SIZE {
            return Err(ConfigError::InvalidValue {
                key: "channels.shm.size".to_string(),
                message: format!("must be between 1 and {MAX_SHM_SIZE}"),
            });
        }

        // Ciphertext may contain NUL bytes, which a NUL-terminated region cannot carry.
        if self.cipher.algorithm == CipherAlgorithm::AesGcm
            && self.channels.shm.framing != Framing::LengthPrefixed
        {
            return Err(ConfigError::InvalidValue {
                key: "channels.shm.framing".to_string(),
                message: "aes-gcm requires length-prefixed framing".to_string(),
            });
        }

        Ok(())
    }

    /// Apply overrides (prefix: NEONIPC_) read through `lookup`.
    ///
    /// Recognised keys:
    /// - NEONIPC_LOG_LEVEL, NEONIPC_LOG_TO_FILE, NEONIPC_LOG_DIR, NEONIPC_LOG_JSON
    /// - NEONIPC_BROKER_TICK_INTERVAL_MS, NEONIPC_BROKER_ORDER, NEONIPC_BROKER_REMOVE_ON_SHUTDOWN
    /// - NEONIPC_CIPHER_ALGORITHM, NEONIPC_CIPHER_KEY
    /// - NEONIPC_REGISTRY_CAPACITY, NEONIPC_REGISTRY_EVICTION
    /// - NEONIPC_PIPE_PATH, NEONIPC_PIPE_SECURITY, NEONIPC_QUEUE_PATH, NEONIPC_QUEUE_SECURITY,
    ///   NEONIPC_SHM_PATH, NEONIPC_SHM_SECURITY, NEONIPC_SHM_SIZE
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse_bool(s: &str) -> Option<bool> {
            match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Some(true),
                "false" | "0" | "no" | "n" => Some(false),
                _ => None,
            }
        }

        if let Some(v) = lookup("NEONIPC_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(b) = lookup("NEONIPC_LOG_TO_FILE").as_deref().and_then(parse_bool) {
            self.logging.log_to_file = b;
        }
        if let Some(v) = lookup("NEONIPC_LOG_DIR") {
            if !v.is_empty() {
                self.logging.log_dir = v;
            }
        }
        if let Some(b) = lookup("NEONIPC_LOG_JSON").as_deref().and_then(parse_bool) {
            self.logging.json_format = b;
        }

        // Broker
        if let Some(n) = lookup("NEONIPC_BROKER_TICK_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.broker.tick_interval_ms = n;
        }
        if let Some(v) = lookup("NEONIPC_BROKER_ORDER") {
            let order: Option<Vec<ChannelKind>> = v.split(',').map(ChannelKind::parse).collect();
            if let Some(order) = order {
                self.broker.order = order;
            }
        }
        if let Some(b) = lookup("NEONIPC_BROKER_REMOVE_ON_SHUTDOWN")
            .as_deref()
            .and_then(parse_bool)
        {
            self.broker.remove_on_shutdown = b;
        }

        // Cipher
        if let Some(v) = lookup("NEONIPC_CIPHER_ALGORITHM") {
            self.cipher.algorithm = match v.to_ascii_lowercase().as_str() {
                "xor" => CipherAlgorithm::Xor,
                "aes-gcm" => CipherAlgorithm::AesGcm,
                _ => self.cipher.algorithm,
            };
        }
        if let Some(v) = lookup("NEONIPC_CIPHER_KEY") {
            if !v.is_empty() {
                self.cipher.key = v;
            }
        }

        // Registry
        if let Some(n) = lookup("NEONIPC_REGISTRY_CAPACITY").and_then(|v| v.parse().ok()) {
            self.registry.capacity = n;
        }
        if let Some(v) = lookup("NEONIPC_REGISTRY_EVICTION") {
            self.registry.eviction = match v.to_ascii_lowercase().as_str() {
                "deny" => EvictionPolicy::Deny,
                "oldest-activity" => EvictionPolicy::OldestActivity,
                _ => self.registry.eviction,
            };
        }

        // Channels
        if let Some(v) = lookup("NEONIPC_PIPE_PATH") {
            if !v.is_empty() {
                self.channels.pipe.path = PathBuf::from(v);
            }
        }
        if let Some(level) = lookup("NEONIPC_PIPE_SECURITY").as_deref().and_then(SecurityLevel::parse) {
            self.channels.pipe.security = level;
        }
        if let Some(v) = lookup("NEONIPC_QUEUE_PATH") {
            if !v.is_empty() {
                self.channels.queue.path = PathBuf::from(v);
            }
        }
        if let Some(level) = lookup("NEONIPC_QUEUE_SECURITY").as_deref().and_then(SecurityLevel::parse) {
            self.channels.queue.security = level;
        }
        if let Some(v) = lookup("NEONIPC_SHM_PATH") {
            if !v.is_empty() {
                self.channels.shm.path = PathBuf::from(v);
            }
        }
        if let Some(level) = lookup("NEONIPC_SHM_SECURITY").as_deref().and_then(SecurityLevel::parse) {
            self.channels.shm.security = level;
        }
        if let Some(n) = lookup("NEONIPC_SHM_SIZE").and_then(|v| v.parse().ok()) {
            self.channels.shm.size = n;
        }
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        PathBuf::from(Self::DEFAULT_PATH)
    }
}

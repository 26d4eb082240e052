//! Proxy server configuration settings

use crate::error::Error;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default configuration file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "config.yml";

/// Main configuration for the proxy server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Server listening address
    pub listen_addr: SocketAddr,

    /// Log level configuration
    pub log_level: String,

    /// Number of worker loops sharing the listener
    pub worker_threads: usize,

    /// Response cache configuration
    pub cache: CacheConfig,

    /// Origin connection configuration
    pub upstream: UpstreamConfig,

    /// Worker loop configuration
    pub worker: WorkerConfig,

    /// CONNECT tunnel configuration
    pub tunnel: TunnelConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Disable to relay every request to the origin
    pub enabled: bool,

    /// Entries older than this are never served
    pub ttl_secs: u64,

    /// Maximum number of cached responses
    pub max_entries: usize,

    /// Responses larger than this are relayed but not retained
    pub max_entry_bytes: usize,
}

/// Origin connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Connection timeout in seconds (DNS resolution included)
    pub connect_timeout_secs: u64,

    /// Send/receive timeout in seconds on the origin socket
    pub io_timeout_secs: u64,

    /// Rewrite the forwarded `Connection` header to `close`
    pub force_connection_close: bool,
}

/// Worker loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Upper bound on one readiness wait, in milliseconds
    pub poll_interval_ms: u64,

    /// Bytes read from a ready socket per dispatch
    pub read_buffer_size: usize,

    /// Request headers larger than this without a terminator are rejected
    pub max_request_header_bytes: usize,
}

/// CONNECT tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Relay buffer size in bytes
    pub buffer_size: usize,

    /// Upper bound on one relay wait, in milliseconds
    pub poll_interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Also write logs to this file when set
    pub file_path: Option<String>,

    /// Emit per-request JSON transaction records at DEBUG level
    pub json_transactions: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_level: "info".to_string(),
            worker_threads: 4,
            cache: CacheConfig::default(),
            upstream: UpstreamConfig::default(),
            worker: WorkerConfig::default(),
            tunnel: TunnelConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            max_entries: 100,
            max_entry_bytes: 8 * 1024 * 1024, // 8MB
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            io_timeout_secs: 5,
            force_connection_close: true,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            read_buffer_size: 16384,
            max_request_header_bytes: 64 * 1024, // 64KB
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            buffer_size: 16384,
            poll_interval_ms: 1000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file_path: None,
            json_transactions: true,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl TunnelConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ProxyConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: ProxyConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load configuration from an explicit path, `config.yml`, or defaults,
    /// then apply environment variable overrides
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_yaml_file(DEFAULT_CONFIG_FILE)?
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Override settings from environment variables (these take precedence over the file)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr_str) = std::env::var("PROXY_LISTEN_ADDR") {
            if let Ok(addr) = addr_str.parse() {
                self.listen_addr = addr;
            }
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.log_level = log_level;
        }

        if let Ok(ttl) = std::env::var("PROXY_CACHE_TTL_SECS") {
            if let Ok(ttl) = ttl.parse() {
                self.cache.ttl_secs = ttl;
            }
        }

        if let Ok(max_entries) = std::env::var("PROXY_CACHE_MAX_ENTRIES") {
            if let Ok(max_entries) = max_entries.parse() {
                self.cache.max_entries = max_entries;
            }
        }

        if let Ok(timeout) = std::env::var("PROXY_CONNECT_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout.parse() {
                self.upstream.connect_timeout_secs = timeout;
            }
        }

        if let Ok(timeout) = std::env::var("PROXY_IO_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout.parse() {
                self.upstream.io_timeout_secs = timeout;
            }
        }

        if let Ok(interval) = std::env::var("PROXY_POLL_INTERVAL_MS") {
            if let Ok(interval) = interval.parse() {
                self.worker.poll_interval_ms = interval;
            }
        }

        if let Ok(file_path) = std::env::var("PROXY_LOG_FILE") {
            self.logging.file_path = Some(file_path);
        }
    }

    /// Reject settings the worker loop cannot run with
    pub fn validate(&self) -> std::result::Result<(), Error> {
        let checks: [(&str, bool); 9] = [
            ("worker_threads", self.worker_threads > 0),
            ("cache.ttl_secs", self.cache.ttl_secs > 0),
            ("cache.max_entries", self.cache.max_entries > 0),
            ("upstream.connect_timeout_secs", self.upstream.connect_timeout_secs > 0),
            ("upstream.io_timeout_secs", self.upstream.io_timeout_secs > 0),
            ("worker.poll_interval_ms", self.worker.poll_interval_ms > 0),
            ("worker.read_buffer_size", self.worker.read_buffer_size > 0),
            ("tunnel.buffer_size", self.tunnel.buffer_size > 0),
            ("tunnel.poll_interval_ms", self.tunnel.poll_interval_ms > 0),
        ];

        match checks.iter().find(|(_, ok)| !ok) {
            Some((name, _)) => Err(Error::Config(format!("{} must be greater than zero", name))),
            None => Ok(()),
        }
    }
}

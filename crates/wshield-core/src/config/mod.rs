//! Configuration management for WebShield
//!
//! Strongly-typed TOML configuration with profile-based presets. Every
//! recognized option is a typed field; unknown sections are ignored and
//! missing ones fall back to their defaults.

mod profile;

pub use profile::Profile;

use crate::error::{Error, Result};
use crate::filter::DomainEntry;
use crate::lists::{ListFormat, ListKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Active profile
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,

    /// Listener and upstream connection settings
    pub proxy: ProxyConfig,

    /// Static security policy
    pub security: SecurityConfig,

    /// Sliding-window rate limiting
    pub rate_limit: RateLimitConfig,

    /// Verdict cache
    pub cache: CacheConfig,

    /// Blocklist/whitelist sources
    pub lists: ListsConfig,

    /// Threat intelligence feed
    pub threat: ThreatConfig,

    /// Event channel sizing
    pub telemetry: TelemetryConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| Error::ConfigNotFound {
            path: path.display().to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(Error::from)
    }

    /// Create configuration from a preset profile
    pub fn from_profile(profile: Profile) -> Self {
        profile.into_config()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.proxy.port == 0 {
            return Err(Error::InvalidPort { port: 0 });
        }
        if self.proxy.host.trim().is_empty() {
            return Err(Error::config_value("proxy.host", "Must not be empty"));
        }
        if self.proxy.max_connections == 0 {
            return Err(Error::config_value(
                "proxy.max_connections",
                "Must be greater than 0",
            ));
        }
        if self.proxy.connect_timeout_secs == 0 || self.proxy.response_timeout_secs == 0 {
            return Err(Error::config_value(
                "proxy",
                "Connect and response timeouts must be greater than 0",
            ));
        }
        if self.proxy.retry_response_timeout_secs < self.proxy.response_timeout_secs {
            return Err(Error::config_value(
                "proxy.retry_response_timeout_secs",
                "Must not be shorter than response_timeout_secs",
            ));
        }
        if self.proxy.max_retries > 1 {
            return Err(Error::config_value(
                "proxy.max_retries",
                "Retry budget is 0 or 1",
            ));
        }

        for &port in self
            .security
            .allowed_ports
            .iter()
            .chain(&self.security.extra_allowed_ports)
        {
            if port == 0 {
                return Err(Error::InvalidPort { port: 0 });
            }
        }

        if self.rate_limit.enabled {
            if self.rate_limit.max_requests == 0 {
                return Err(Error::config_value(
                    "rate_limit.max_requests",
                    "Must be greater than 0",
                ));
            }
            if self.rate_limit.window_ms == 0 {
                return Err(Error::config_value(
                    "rate_limit.window_ms",
                    "Must be greater than 0",
                ));
            }
        }

        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err(Error::config_value(
                "cache.max_entries",
                "Must be greater than 0 when the cache is enabled",
            ));
        }

        let rate = self.lists.bloom_fp_rate;
        if !(rate > 0.0 && rate < 1.0) {
            return Err(Error::config_value(
                "lists.bloom_fp_rate",
                "Must be between 0 and 1 (exclusive)",
            ));
        }

        let mut ids = HashSet::new();
        for source in self.lists.sources.iter().chain(&self.threat.sources) {
            if source.id.trim().is_empty() {
                return Err(Error::config_value("sources.id", "Must not be empty"));
            }
            if !ids.insert(source.id.as_str()) {
                return Err(Error::config_value(
                    "sources.id",
                    format!("Duplicate source id: {}", source.id),
                ));
            }
        }

        for pattern in self.lists.whitelist.iter().chain(&self.lists.blocklist) {
            DomainEntry::parse(pattern, "config")?;
        }

        if self.telemetry.channel_capacity == 0 {
            return Err(Error::config_value(
                "telemetry.channel_capacity",
                "Must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Serialize to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Listener and upstream connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listen address
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Concurrent connection cap (excess gets 503)
    pub max_connections: usize,
    /// Upstream TCP connect timeout (seconds)
    pub connect_timeout_secs: u64,
    /// Wait for the first response byte (seconds)
    pub response_timeout_secs: u64,
    /// Response wait used on the retry attempt (seconds)
    pub retry_response_timeout_secs: u64,
    /// Retry budget for bodiless HTTP requests (0 or 1)
    pub max_retries: u8,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8081,
            max_connections: 1024,
            connect_timeout_secs: 30,
            response_timeout_secs: 60,
            retry_response_timeout_secs: 90,
            max_retries: 1,
        }
    }
}

impl ProxyConfig {
    /// `host:port` listen address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Response wait for the given attempt (0 = first)
    pub fn response_timeout(&self, attempt: u8) -> Duration {
        if attempt == 0 {
            Duration::from_secs(self.response_timeout_secs)
        } else {
            Duration::from_secs(self.retry_response_timeout_secs)
        }
    }
}

/// Static security policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Block requests whose host is a literal IP
    pub block_direct_ips: bool,
    /// Block ports outside the allowed set
    pub block_non_standard_ports: bool,
    /// Standard port set
    pub allowed_ports: Vec<u16>,
    /// Ports allowed in addition to the standard set
    pub extra_allowed_ports: Vec<u16>,
    /// Block plaintext HTTP
    pub force_https: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            block_direct_ips: true,
            block_non_standard_ports: false,
            allowed_ports: vec![80, 443],
            extra_allowed_ports: Vec::new(),
            force_https: false,
        }
    }
}

impl SecurityConfig {
    /// Whether `port` is in the standard or extended allow-list
    pub fn is_port_allowed(&self, port: u16) -> bool {
        self.allowed_ports.contains(&port) || self.extra_allowed_ports.contains(&port)
    }
}

/// Sliding-window rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Requests allowed per window
    pub max_requests: usize,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Cooldown after the limit is hit, in milliseconds
    pub block_duration_ms: u64,
    /// Idle window sweep interval (seconds)
    pub gc_interval_secs: u64,
    /// Key on `client_ip/host` instead of host alone
    pub per_client: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 100,
            window_ms: 10_000,
            block_duration_ms: 60_000,
            gc_interval_secs: 60,
            per_client: false,
        }
    }
}

/// Verdict cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable verdict caching
    pub enabled: bool,
    /// Entry lifetime (seconds)
    pub ttl_secs: u64,
    /// Capacity before oldest-first eviction
    pub max_entries: usize,
    /// Expired entry sweep interval (seconds)
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            max_entries: 50_000,
            sweep_interval_secs: 60,
        }
    }
}

/// One downloadable list or feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique identifier (also the cache file name)
    pub id: String,
    /// `http(s)://` URL or local file path
    pub location: String,
    /// Which list the entries feed
    #[serde(default)]
    pub list: ListKind,
    /// Line format
    #[serde(default)]
    pub format: ListFormat,
    /// Refresh order, lower first
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Include this source in refreshes
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_priority() -> u8 {
    10
}

fn default_true() -> bool {
    true
}

/// Blocklist/whitelist configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListsConfig {
    /// Scheduled refresh interval (seconds)
    pub refresh_interval_secs: u64,
    /// Pause between source downloads (milliseconds)
    pub source_delay_ms: u64,
    /// Target bloom false-positive rate
    pub bloom_fp_rate: f64,
    /// Where lists and metadata are persisted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Inline whitelist patterns
    pub whitelist: Vec<String>,
    /// Inline blocklist patterns
    pub blocklist: Vec<String>,
    /// Downloadable sources
    pub sources: Vec<SourceConfig>,
}

impl Default for ListsConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 86_400,
            source_delay_ms: 500,
            bloom_fp_rate: 0.01,
            data_dir: None,
            whitelist: Vec::new(),
            blocklist: Vec::new(),
            sources: vec![SourceConfig {
                id: "stevenblack".to_string(),
                location: "https://raw.githubusercontent.com/StevenBlack/hosts/master/hosts"
                    .to_string(),
                list: ListKind::Blocklist,
                format: ListFormat::Hosts,
                priority: 1,
                enabled: true,
            }],
        }
    }
}

/// Threat intelligence feed settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreatConfig {
    /// Consult the feed during evaluation
    pub enabled: bool,
    /// Feed refresh interval (seconds)
    pub refresh_interval_secs: u64,
    /// Feed sources (`urls` format for URLs, `hosts`/`simple` for domains)
    pub sources: Vec<SourceConfig>,
}

impl Default for ThreatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            refresh_interval_secs: 3_600,
            sources: vec![SourceConfig {
                id: "urlhaus".to_string(),
                location: "https://urlhaus.abuse.ch/downloads/text_online/".to_string(),
                list: ListKind::Blocklist,
                format: ListFormat::Urls,
                priority: 1,
                enabled: true,
            }],
        }
    }
}

/// Telemetry channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Ring size of the event channel
    pub channel_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log file path (None = stdout only)
    pub file: Option<String>,
    /// Enable JSON format logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json_format: false,
        }
    }
}

//! Policy presets
//!
//! Each profile is a starting point that a config file can further tune.

use super::*;
use serde::{Deserialize, Serialize};

/// Predefined configuration profiles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Lists only: raw IPs allowed, generous rate limit
    Relaxed,
    /// Lists, threat feed, raw-IP blocking, default rate limit (default)
    #[default]
    Balanced,
    /// Balanced plus non-standard port and plaintext HTTP blocking
    Strict,
}

impl Profile {
    /// Convert profile to full configuration
    pub fn into_config(self) -> Config {
        let mut config = Config {
            profile: Some(self),
            ..Config::default()
        };

        match self {
            Profile::Relaxed => {
                config.security.block_direct_ips = false;
                config.rate_limit.max_requests = 300;
                config.rate_limit.block_duration_ms = 30_000;
            }
            Profile::Balanced => {}
            Profile::Strict => {
                config.security.block_non_standard_ports = true;
                config.security.force_https = true;
                config.rate_limit.max_requests = 50;
                config.rate_limit.block_duration_ms = 120_000;
                config.rate_limit.per_client = true;
            }
        }

        config
    }

    /// Get profile name
    pub fn name(&self) -> &'static str {
        match self {
            Profile::Relaxed => "relaxed",
            Profile::Balanced => "balanced",
            Profile::Strict => "strict",
        }
    }

    /// Get profile description
    pub fn description(&self) -> &'static str {
        match self {
            Profile::Relaxed => "Blocklists only, direct IP access allowed",
            Profile::Balanced => "Blocklists, threat feed and direct IP blocking (default)",
            Profile::Strict => "Balanced plus HTTPS-only and standard ports only",
        }
    }

    /// All presets in display order
    pub fn all() -> [Profile; 3] {
        [Profile::Relaxed, Profile::Balanced, Profile::Strict]
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Profile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "relaxed" | "low" => Ok(Profile::Relaxed),
            "balanced" | "default" => Ok(Profile::Balanced),
            "strict" | "high" => Ok(Profile::Strict),
            _ => Err(Error::config_value("profile", format!("Unknown profile: {s}"))),
        }
    }
}

impl Profile {
    /// Parse profile from name string
    pub fn from_name(name: &str) -> Result<Self> {
        name.parse()
    }
}

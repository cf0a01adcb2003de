//! Error types for wshield-core
//!
//! Centralized error handling using `thiserror` for ergonomic error definitions.

use thiserror::Error;

/// Main error type for wshield-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        /// Path to the missing config file
        path: String,
    },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    ConfigValue {
        /// Configuration key
        key: String,
        /// Error message
        message: String,
    },

    /// A list entry was rejected at the point of mutation
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The rejected input
        pattern: String,
        /// Why it was rejected
        reason: String,
    },

    /// Invalid port number
    #[error("Invalid port number: {port} (must be 1-65535)")]
    InvalidPort {
        /// The invalid port
        port: u32,
    },

    /// Imported bloom filter bits do not match the declared size
    #[error("Bloom filter size mismatch: expected {expected} words, got {actual}")]
    BloomMismatch {
        /// Word count implied by the declared bit size
        expected: usize,
        /// Word count actually supplied
        actual: usize,
    },

    /// A list source could not be downloaded or read
    #[error("Failed to fetch list source '{source_id}': {message}")]
    Fetch {
        /// Identifier of the source
        source_id: String,
        /// Failure description
        message: String,
    },

    /// Persistent storage failure
    #[error("Persistence error for '{path}': {message}")]
    Persistence {
        /// File involved
        path: String,
        /// Error message
        message: String,
    },

    /// I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a config value error
    pub fn config_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValue {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create an invalid pattern error
    pub fn invalid_pattern(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    /// Create a fetch error
    pub fn fetch(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    /// Create a persistence error
    pub fn persistence(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Persistence {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::invalid_pattern("bad domain", "contains whitespace");
        assert!(err.to_string().contains("bad domain"));
        assert!(err.to_string().contains("whitespace"));

        let err = Error::fetch("urlhaus", "HTTP 503");
        assert!(err.to_string().contains("urlhaus"));
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[test]
    fn test_bloom_mismatch_fields() {
        let err = Error::BloomMismatch {
            expected: 16,
            actual: 4,
        };
        match err {
            Error::BloomMismatch { expected, actual } => {
                assert_eq!(expected, 16);
                assert_eq!(actual, 4);
            }
            _ => panic!("Wrong error type"),
        }
    }
}

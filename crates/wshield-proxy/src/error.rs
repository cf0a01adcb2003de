//! Error types for the proxy front end, plus the benign network error set.

use std::io;
use thiserror::Error;

/// Errors raised while serving one connection or starting the server
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Proxy bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("HTTP parse error: {0}")]
    HttpParse(String),

    #[error("Request header exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("Upstream connection failed to {host}: {reason}")]
    UpstreamConnect { host: String, reason: String },

    #[error("Upstream timed out: {host}")]
    UpstreamTimeout { host: String },

    #[error("Client closed the connection")]
    ClientClosed,

    #[error("Proxy shutdown")]
    Shutdown,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Network error codes treated as expected churn
///
/// These map to a client status and are logged at debug level only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetErrorCode {
    ConnReset,
    ConnAborted,
    BrokenPipe,
    TimedOut,
    NotFound,
    Canceled,
    ConnRefused,
    HangUp,
}

impl NetErrorCode {
    /// Conventional errno-style name
    pub fn as_str(self) -> &'static str {
        match self {
            NetErrorCode::ConnReset => "ECONNRESET",
            NetErrorCode::ConnAborted => "ECONNABORTED",
            NetErrorCode::BrokenPipe => "EPIPE",
            NetErrorCode::TimedOut => "ETIMEDOUT",
            NetErrorCode::NotFound => "ENOTFOUND",
            NetErrorCode::Canceled => "ECANCELED",
            NetErrorCode::ConnRefused => "ECONNREFUSED",
            NetErrorCode::HangUp => "socket hang up",
        }
    }

    /// Status sent to the client when this error ends an upstream attempt
    pub fn gateway_status(self) -> u16 {
        match self {
            NetErrorCode::TimedOut => 504,
            _ => 502,
        }
    }

    /// Whether a bodiless request may be retried after this error
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            NetErrorCode::TimedOut | NetErrorCode::ConnReset | NetErrorCode::HangUp
        )
    }

    /// Classify an I/O error; `None` means it is not in the benign set
    pub fn from_io(err: &io::Error) -> Option<Self> {
        use io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset => Some(NetErrorCode::ConnReset),
            ErrorKind::ConnectionAborted => Some(NetErrorCode::ConnAborted),
            ErrorKind::BrokenPipe => Some(NetErrorCode::BrokenPipe),
            ErrorKind::TimedOut => Some(NetErrorCode::TimedOut),
            ErrorKind::ConnectionRefused => Some(NetErrorCode::ConnRefused),
            ErrorKind::Interrupted => Some(NetErrorCode::Canceled),
            ErrorKind::UnexpectedEof => Some(NetErrorCode::HangUp),
            _ => Self::from_message(&err.to_string()),
        }
    }

    /// Classify by message text (resolver failures surface as plain strings)
    pub fn from_message(message: &str) -> Option<Self> {
        let lower = message.to_ascii_lowercase();
        if lower.contains("socket hang up") {
            Some(NetErrorCode::HangUp)
        } else if lower.contains("connection refused") {
            Some(NetErrorCode::ConnRefused)
        } else if lower.contains("connection reset") {
            Some(NetErrorCode::ConnReset)
        } else if lower.contains("failed to lookup address")
            || lower.contains("name or service not known")
            || lower.contains("nodename nor servname")
            || lower.contains("no such host")
            || lower.contains("enotfound")
        {
            Some(NetErrorCode::NotFound)
        } else {
            None
        }
    }
}

impl std::fmt::Display for NetErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ProxyError {
    /// Benign classification of this error, if any
    pub fn net_code(&self) -> Option<NetErrorCode> {
        match self {
            ProxyError::Io(e) => NetErrorCode::from_io(e),
            ProxyError::UpstreamTimeout { .. } => Some(NetErrorCode::TimedOut),
            ProxyError::UpstreamConnect { reason, .. } => NetErrorCode::from_message(reason),
            ProxyError::Shutdown | ProxyError::ClientClosed => Some(NetErrorCode::Canceled),
            _ => None,
        }
    }

    /// Whether the error is expected network churn
    pub fn is_benign(&self) -> bool {
        self.net_code().is_some()
    }
}

/// Log a connection-level error at the level its classification calls for
pub fn log_connection_error(peer: std::net::SocketAddr, err: &ProxyError) {
    match err.net_code() {
        Some(code) => tracing::debug!(%peer, code = %code, "Connection ended: {}", err),
        None => tracing::warn!(%peer, "Connection error: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_kinds_are_benign() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::TimedOut,
            io::ErrorKind::ConnectionRefused,
        ] {
            let err = ProxyError::Io(io::Error::from(kind));
            assert!(err.is_benign(), "{kind:?}");
        }
    }

    #[test]
    fn test_unknown_errors_not_benign() {
        let err = ProxyError::Io(io::Error::new(io::ErrorKind::Other, "disk on fire"));
        assert!(!err.is_benign());
        assert!(!ProxyError::HttpParse("bad".into()).is_benign());
    }

    #[test]
    fn test_dns_failure_is_not_found() {
        let err = ProxyError::UpstreamConnect {
            host: "nx.test".into(),
            reason: "failed to lookup address information: Name or service not known".into(),
        };
        assert_eq!(err.net_code(), Some(NetErrorCode::NotFound));
        assert_eq!(NetErrorCode::NotFound.gateway_status(), 502);
    }

    #[test]
    fn test_timeout_maps_to_504() {
        let err = ProxyError::UpstreamTimeout {
            host: "slow.test".into(),
        };
        assert_eq!(err.net_code().map(NetErrorCode::gateway_status), Some(504));
    }

    #[test]
    fn test_hang_up_message() {
        assert_eq!(
            NetErrorCode::from_message("socket hang up"),
            Some(NetErrorCode::HangUp)
        );
        assert!(NetErrorCode::HangUp.is_retryable());
        assert!(!NetErrorCode::ConnRefused.is_retryable());
    }
}

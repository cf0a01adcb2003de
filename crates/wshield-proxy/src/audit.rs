//! Audit lines for allow/deny decisions.
//!
//! Emitted under the `wshield_proxy::audit` target so they can be routed
//! separately from diagnostics. Request bodies and credentials never appear.

use tracing::info;

/// How the request reached the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    /// Plain HTTP forwarded by the proxy
    Forward,
    /// CONNECT tunnel
    Tunnel,
}

impl std::fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyMode::Forward => write!(f, "forward"),
            ProxyMode::Tunnel => write!(f, "tunnel"),
        }
    }
}

/// Log an allowed request
pub fn log_allowed(mode: ProxyMode, host: &str, port: u16, method: &str, cached: bool) {
    info!(
        target: "wshield_proxy::audit",
        mode = %mode,
        host = host,
        port = port,
        method = method,
        cached = cached,
        decision = "allow",
        "proxy request allowed"
    );
}

/// Log a blocked request
pub fn log_denied(mode: ProxyMode, host: &str, port: u16, method: &str, reason: &str) {
    info!(
        target: "wshield_proxy::audit",
        mode = %mode,
        host = host,
        port = port,
        method = method,
        decision = "deny",
        reason = reason,
        "proxy request denied"
    );
}

/// Log an allowed request that the upstream could not serve
pub fn log_gateway_error(mode: ProxyMode, host: &str, port: u16, status: u16, error: &str) {
    info!(
        target: "wshield_proxy::audit",
        mode = %mode,
        host = host,
        port = port,
        status = status,
        error = error,
        "upstream unavailable"
    );
}

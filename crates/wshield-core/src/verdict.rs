//! Allow/block outcome of one evaluation

use std::fmt;

/// Why a request was blocked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// The host's rate window is full or in cooldown
    RateLimited,
    /// The exact URL is in the threat feed
    ThreatUrl {
        /// Threat category
        kind: String,
        /// Reporting feed
        source: String,
    },
    /// Literal IP destination with direct IP access disabled
    DirectIp,
    /// Port outside the allowed set
    NonStandardPort(u16),
    /// Plaintext HTTP with HTTPS-only enforced
    InsecureHttp,
    /// The exact URL is on the malicious URL list
    MaliciousUrl,
    /// The host matches the blocklist
    BlockedDomain,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::RateLimited => f.write_str("rate limit exceeded"),
            BlockReason::ThreatUrl { kind, source } => {
                write!(f, "Threat Intelligence: {kind} ({source})")
            }
            BlockReason::DirectIp => f.write_str("Direct IP Access Blocked"),
            BlockReason::NonStandardPort(port) => write!(f, "Non-Standard Port {port} Blocked"),
            BlockReason::InsecureHttp => f.write_str("Insecure HTTP Blocked (HTTPS-only mode)"),
            BlockReason::MaliciousUrl => f.write_str("Malicious URL"),
            BlockReason::BlockedDomain => f.write_str("Blocked Domain"),
        }
    }
}

/// Outcome of [`FilterEngine::evaluate`](crate::FilterEngine::evaluate)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// The request must not be forwarded
    pub blocked: bool,
    /// Always present when blocked
    pub reason: Option<BlockReason>,
    /// Served from the verdict cache
    pub cached: bool,
}

impl Verdict {
    /// Allowed verdict
    pub fn allow() -> Self {
        Self {
            blocked: false,
            reason: None,
            cached: false,
        }
    }

    /// Blocked verdict
    pub fn block(reason: BlockReason) -> Self {
        Self {
            blocked: true,
            reason: Some(reason),
            cached: false,
        }
    }

    /// Reason as display text
    pub fn reason_text(&self) -> Option<String> {
        self.reason.as_ref().map(ToString::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_strings() {
        assert_eq!(BlockReason::RateLimited.to_string(), "rate limit exceeded");
        assert_eq!(
            BlockReason::NonStandardPort(8443).to_string(),
            "Non-Standard Port 8443 Blocked"
        );
        assert_eq!(
            BlockReason::ThreatUrl {
                kind: "malware_url".into(),
                source: "urlhaus".into()
            }
            .to_string(),
            "Threat Intelligence: malware_url (urlhaus)"
        );
        assert_eq!(BlockReason::BlockedDomain.to_string(), "Blocked Domain");
    }

    #[test]
    fn test_block_always_has_reason() {
        let v = Verdict::block(BlockReason::DirectIp);
        assert!(v.blocked);
        assert_eq!(v.reason_text().as_deref(), Some("Direct IP Access Blocked"));
        assert_eq!(Verdict::allow().reason_text(), None);
    }
}

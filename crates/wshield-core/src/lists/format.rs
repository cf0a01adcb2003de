//! List source formats and line parsing

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which list a source feeds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    /// Requests matching are blocked
    #[default]
    Blocklist,
    /// Requests matching bypass every other rule
    Whitelist,
}

impl ListKind {
    /// Stable name, used for file names and CLI output
    pub fn name(&self) -> &'static str {
        match self {
            ListKind::Blocklist => "blocklist",
            ListKind::Whitelist => "whitelist",
        }
    }
}

impl fmt::Display for ListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ListKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "blocklist" | "block" | "blacklist" => Ok(ListKind::Blocklist),
            "whitelist" | "allow" | "allowlist" => Ok(ListKind::Whitelist),
            _ => Err(crate::Error::config_value(
                "list",
                format!("Unknown list kind: {s}"),
            )),
        }
    }
}

/// Line format of a list source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListFormat {
    /// `0.0.0.0 domain` / `127.0.0.1 domain`
    Hosts,
    /// One pattern per line
    #[default]
    Simple,
    /// One `http(s)://` URL per line
    Urls,
}

impl ListFormat {
    /// Extract the item from one line, `None` for comments and noise
    pub fn parse_line(&self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        match self {
            Self::Hosts => parse_hosts_line(line),
            Self::Simple => parse_simple_line(line),
            Self::Urls => parse_url_line(line),
        }
    }

    /// Parse a whole document
    pub fn parse_document(&self, content: &str) -> Vec<String> {
        content.lines().filter_map(|l| self.parse_line(l)).collect()
    }
}

fn parse_hosts_line(line: &str) -> Option<String> {
    if line.starts_with('#') {
        return None;
    }

    let line = line.split('#').next().unwrap_or(line);
    let mut parts = line.split_whitespace();
    let ip = parts.next()?;
    if !matches!(ip, "0.0.0.0" | "127.0.0.1" | "::" | "::1" | "0:0:0:0:0:0:0:0") {
        return None;
    }

    let domain = parts.next()?;
    if matches!(
        domain,
        "localhost"
            | "localhost.localdomain"
            | "local"
            | "broadcasthost"
            | "ip6-localhost"
            | "ip6-loopback"
            | "0.0.0.0"
    ) {
        return None;
    }

    Some(domain.to_string())
}

fn parse_simple_line(line: &str) -> Option<String> {
    if line.starts_with('#') || line.starts_with('!') {
        return None;
    }
    let item = line.split('#').next().unwrap_or(line).trim();
    (!item.is_empty()).then(|| item.to_string())
}

fn parse_url_line(line: &str) -> Option<String> {
    if line.starts_with('#') {
        return None;
    }
    let lower = line.to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return None;
    }
    Some(normalize_url(line))
}

/// Canonical URL form used as cache key and threat-set member
///
/// Lower-cases scheme and authority, drops default ports and supplies a
/// `/` path when none is present. The path and query are left untouched.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let scheme = scheme.to_ascii_lowercase();

    let (authority, path) = match rest.find(['/', '?', '#']) {
        Some(pos) => rest.split_at(pos),
        None => (rest, ""),
    };
    let mut authority = authority.to_ascii_lowercase();

    let default_port = match scheme.as_str() {
        "http" => Some(":80"),
        "https" => Some(":443"),
        _ => None,
    };
    if let Some(port) = default_port {
        if let Some(stripped) = authority.strip_suffix(port) {
            authority = stripped.to_string();
        }
    }

    let path = if path.is_empty() {
        "/".to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };

    format!("{scheme}://{authority}{path}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hosts_format() {
        let f = ListFormat::Hosts;
        assert_eq!(f.parse_line("0.0.0.0 ads.example"), Some("ads.example".into()));
        assert_eq!(f.parse_line("127.0.0.1\ttracker.io # inline"), Some("tracker.io".into()));
        assert_eq!(f.parse_line(":: v6.example"), Some("v6.example".into()));
        assert_eq!(f.parse_line("127.0.0.1 localhost"), None);
        assert_eq!(f.parse_line("# comment"), None);
        assert_eq!(f.parse_line("192.168.1.1 router.lan"), None);
        assert_eq!(f.parse_line("0.0.0.0"), None);
    }

    #[test]
    fn test_simple_format() {
        let f = ListFormat::Simple;
        assert_eq!(f.parse_line("  *.ads.example  "), Some("*.ads.example".into()));
        assert_eq!(f.parse_line("10.0.0.0/8"), Some("10.0.0.0/8".into()));
        assert_eq!(f.parse_line("! adblock comment"), None);
        assert_eq!(f.parse_line("# comment"), None);
        assert_eq!(f.parse_line(""), None);
    }

    #[test]
    fn test_url_format() {
        let f = ListFormat::Urls;
        assert_eq!(
            f.parse_line("HTTP://Evil.Example:80/payload.exe"),
            Some("http://evil.example/payload.exe".into())
        );
        assert_eq!(f.parse_line("evil.example/x"), None);
        assert_eq!(f.parse_line("# header"), None);
    }

    #[test]
    fn test_parse_document() {
        let doc = "# header\n0.0.0.0 a.test\n\n0.0.0.0 b.test\n127.0.0.1 localhost\n";
        assert_eq!(
            ListFormat::Hosts.parse_document(doc),
            vec!["a.test".to_string(), "b.test".to_string()]
        );
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("https://Example.com"), "https://example.com/");
        assert_eq!(normalize_url("https://example.com:443/a?b"), "https://example.com/a?b");
        assert_eq!(normalize_url("http://example.com:8080/A"), "http://example.com:8080/A");
        assert_eq!(normalize_url("http://example.com?q=1"), "http://example.com/?q=1");
    }

    #[test]
    fn test_list_kind_parse() {
        assert_eq!("allow".parse::<ListKind>().unwrap(), ListKind::Whitelist);
        assert_eq!("blocklist".parse::<ListKind>().unwrap(), ListKind::Blocklist);
        assert!("other".parse::<ListKind>().is_err());
    }
}

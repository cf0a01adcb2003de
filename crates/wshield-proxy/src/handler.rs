//! Per-connection state machine
//!
//! `Accepted -> Filtering -> {Blocked, Forwarding | Tunneling} -> Closed`
//!
//! The request head is read through a `BufReader` that stays alive for the
//! whole connection, so body bytes (or a TLS ClientHello sent right after
//! CONNECT) that were read ahead are not lost.

use crate::audit::{self, ProxyMode};
use crate::block_page;
use crate::connect;
use crate::error::{ProxyError, Result};
use crate::forward;
use crate::registry::ConnectionGuard;
use crate::server::ProxyState;
use bytes::BytesMut;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tracing::{debug, trace};
use wshield_core::engine::split_authority;
use wshield_core::{EventKind, FilterRequest, ProxyEvent, Verdict};

/// Maximum total size of the request line plus headers (64 KiB)
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Accepted,
    Filtering,
    Blocked,
    Forwarding,
    Tunneling,
    Closed,
}

/// Parsed request line and headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    /// Headers in arrival order, names as sent
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse the already-split head lines (without CRLF)
    pub fn parse(lines: &[String]) -> Result<Self> {
        let (first, rest) = lines
            .split_first()
            .ok_or_else(|| ProxyError::HttpParse("empty request".to_string()))?;

        let mut parts = first.split_whitespace();
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ProxyError::HttpParse(format!(
                "malformed request line: {first}"
            )));
        };
        if !version.starts_with("HTTP/") {
            return Err(ProxyError::HttpParse(format!(
                "unsupported protocol: {version}"
            )));
        }

        let mut headers = Vec::with_capacity(rest.len());
        for line in rest {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ProxyError::HttpParse(format!("malformed header: {line}")))?;
            let name = name.trim();
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(ProxyError::HttpParse(format!("malformed header: {line}")));
            }
            headers.push((name.to_string(), value.trim().to_string()));
        }

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    /// First header with this name, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether this is a CONNECT request
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

/// Read the request head, `Ok(None)` if the client closed before sending one
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    let mut total = 0usize;
    let mut lines: Vec<String> = Vec::new();

    loop {
        let mut line = Vec::new();
        // One byte over the limit is enough to detect an overflow
        let budget = (MAX_HEADER_SIZE + 1).saturating_sub(total) as u64;
        let n = (&mut *reader).take(budget).read_until(b'\n', &mut line).await?;
        if n == 0 {
            if total == 0 {
                return Ok(None);
            }
            return Err(ProxyError::HttpParse(
                "connection closed inside request head".to_string(),
            ));
        }
        total += n;
        if total > MAX_HEADER_SIZE {
            return Err(ProxyError::HeaderTooLarge {
                limit: MAX_HEADER_SIZE,
            });
        }

        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        if line.is_empty() {
            if lines.is_empty() {
                // Stray CRLF before the request line
                continue;
            }
            break;
        }
        let text = String::from_utf8(line)
            .map_err(|_| ProxyError::HttpParse("request head is not UTF-8".to_string()))?;
        lines.push(text);
    }

    RequestHead::parse(&lines).map(Some)
}

/// Where the request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// CONNECT host:port
    Tunnel { host: String, port: u16 },
    /// Plain HTTP; `path` is the origin-form request target
    Http {
        url: String,
        host: String,
        port: u16,
        path: String,
    },
}

impl Target {
    /// Resolve the target from the request line, falling back to `Host`
    pub fn from_head(head: &RequestHead) -> Result<Self> {
        if head.is_connect() {
            let (host, port) = split_authority(&head.target, 443).ok_or_else(|| {
                ProxyError::HttpParse(format!("invalid CONNECT target: {}", head.target))
            })?;
            return Ok(Target::Tunnel { host, port });
        }

        let url = if head.target.starts_with('/') {
            let host = head
                .header("host")
                .filter(|h| !h.is_empty())
                .ok_or_else(|| ProxyError::HttpParse("missing Host header".to_string()))?;
            format!("http://{host}{}", head.target)
        } else if has_scheme(&head.target, "http") {
            head.target.clone()
        } else if has_scheme(&head.target, "https") {
            return Err(ProxyError::HttpParse(
                "https targets must use CONNECT".to_string(),
            ));
        } else {
            return Err(ProxyError::HttpParse(format!(
                "unsupported request target: {}",
                head.target
            )));
        };

        let request =
            FilterRequest::from_url(&url).map_err(|e| ProxyError::HttpParse(e.to_string()))?;
        Ok(Target::Http {
            path: origin_form(&url),
            url,
            host: request.host,
            port: request.port,
        })
    }

    /// Host being contacted
    pub fn host(&self) -> &str {
        match self {
            Target::Tunnel { host, .. } | Target::Http { host, .. } => host,
        }
    }

    /// Port being contacted
    pub fn port(&self) -> u16 {
        match self {
            Target::Tunnel { port, .. } | Target::Http { port, .. } => *port,
        }
    }

    fn mode(&self) -> ProxyMode {
        match self {
            Target::Tunnel { .. } => ProxyMode::Tunnel,
            Target::Http { .. } => ProxyMode::Forward,
        }
    }

    fn filter_request(&self) -> FilterRequest {
        match self {
            Target::Tunnel { host, port } => FilterRequest::connect(host, *port),
            Target::Http {
                url, host, port, ..
            } => FilterRequest::http(url, host, *port),
        }
    }
}

fn has_scheme(target: &str, scheme: &str) -> bool {
    target
        .get(..scheme.len())
        .is_some_and(|s| s.eq_ignore_ascii_case(scheme))
        && target[scheme.len()..].starts_with("://")
}

/// Path and query of an absolute URL, `/` if empty
pub fn origin_form(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let rest = rest.split('#').next().unwrap_or_default();
    match rest.find(['/', '?']) {
        Some(i) if rest[i..].starts_with('/') => rest[i..].to_string(),
        Some(i) => format!("/{}", &rest[i..]),
        None => "/".to_string(),
    }
}

/// Standard reason phrase for the statuses the proxy emits itself
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "Connection Established",
        400 => "Bad Request",
        403 => "Forbidden",
        431 => "Request Header Fields Too Large",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

/// Write a body-less status response
pub async fn send_status<W>(stream: &mut W, status: u16, x_error: Option<&str>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut response = format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status));
    if let Some(hint) = x_error {
        response.push_str("X-Error: ");
        response.push_str(hint);
        response.push_str("\r\n");
    }
    if status != 200 {
        response.push_str("Content-Length: 0\r\nConnection: close\r\n");
    }
    response.push_str("\r\n");
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Client bytes held back while an upstream operation is pending
const EARLY_DATA_LIMIT: usize = 64 * 1024;

/// Drive `op` to completion unless the client hangs up first
///
/// Anything the client sends meanwhile is appended to `early` for the caller
/// to relay; reading pauses once `EARLY_DATA_LIMIT` bytes are held. Returns
/// `None` when the client closed or reset the connection.
pub(crate) async fn unless_client_closed<S, F>(
    client: &mut S,
    early: &mut BytesMut,
    op: F,
) -> Option<F::Output>
where
    S: AsyncRead + Unpin,
    F: Future,
{
    tokio::pin!(op);
    loop {
        tokio::select! {
            output = &mut op => return Some(output),
            read = client.read_buf(early), if early.len() < EARLY_DATA_LIMIT => match read {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            },
        }
    }
}

/// Bare status line used to refuse a tunnel
const TUNNEL_FORBIDDEN: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\n";

struct Conn {
    peer: SocketAddr,
    state: ConnState,
    accepted_at: Instant,
}

impl Conn {
    fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            state: ConnState::Accepted,
            accepted_at: Instant::now(),
        }
    }

    fn transition(&mut self, next: ConnState) {
        trace!(peer = %self.peer, from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.accepted_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Serve one client connection to completion
pub(crate) async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    state: &ProxyState,
    guard: &ConnectionGuard,
) -> Result<()> {
    let mut conn = Conn::new(peer);
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
    let mut client = BufReader::new(stream);

    let head = match read_request_head(&mut client).await {
        Ok(Some(head)) => head,
        Ok(None) => {
            conn.transition(ConnState::Closed);
            return Ok(());
        }
        Err(ProxyError::HeaderTooLarge { limit }) => {
            debug!(%peer, limit, "Request head too large");
            send_status(client.get_mut(), 431, None).await?;
            conn.transition(ConnState::Closed);
            return Ok(());
        }
        Err(e) => {
            // Best effort: the client may already be gone
            let _ = send_status(client.get_mut(), 400, None).await;
            return Err(e);
        }
    };

    conn.transition(ConnState::Filtering);
    let target = match Target::from_head(&head) {
        Ok(target) => target,
        Err(e) => {
            let _ = send_status(client.get_mut(), 400, None).await;
            return Err(e);
        }
    };
    let mode = target.mode();
    guard.set_target(target.host(), target.port(), mode == ProxyMode::Tunnel);

    let request = target.filter_request().with_client(peer.ip());
    let verdict = state.engine.evaluate(&request);

    if verdict.blocked {
        conn.transition(ConnState::Blocked);
        let reason = verdict.reason_text().unwrap_or_default();
        audit::log_denied(mode, &request.host, request.port, &head.method, &reason);
        record(state, &conn, &request, &head.method, &verdict);

        match mode {
            ProxyMode::Tunnel => client.get_mut().write_all(TUNNEL_FORBIDDEN).await?,
            ProxyMode::Forward => {
                let page = block_page::response(&request.host, &reason);
                client.get_mut().write_all(&page).await?;
            }
        }
        client.get_mut().flush().await?;
        conn.transition(ConnState::Closed);
        return Ok(());
    }

    audit::log_allowed(mode, &request.host, request.port, &head.method, verdict.cached);
    record(state, &conn, &request, &head.method, &verdict);

    let result = match &target {
        Target::Tunnel { host, port } => {
            conn.transition(ConnState::Tunneling);
            connect::tunnel(&mut client, host, *port, state).await
        }
        Target::Http {
            host, port, path, ..
        } => {
            conn.transition(ConnState::Forwarding);
            forward::forward(&mut client, &head, host, *port, path, state).await
        }
    };
    conn.transition(ConnState::Closed);
    result
}

fn record(
    state: &ProxyState,
    conn: &Conn,
    request: &FilterRequest,
    method: &str,
    verdict: &Verdict,
) {
    let kind = if verdict.blocked {
        EventKind::Blocked
    } else {
        EventKind::Allowed
    };
    state.telemetry.record_event(ProxyEvent {
        kind,
        domain: request.host.clone(),
        reason: verdict.reason_text(),
        method: method.to_string(),
        duration_ms: conn.elapsed_ms(),
    });
}

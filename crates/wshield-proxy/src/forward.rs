//! Plain HTTP forwarding
//!
//! The request is rewritten to origin-form, proxy-only and hop-by-hop
//! headers are dropped and `Connection: close` is added, so each client
//! connection carries exactly one exchange. The request body streams to the
//! upstream while the response streams back.
//!
//! Bodiless requests get at most one retry, and only for a timeout or a reset
//! that happened before any response byte reached the client. The retry waits
//! longer for the response. Once bytes have been relayed nothing else may be
//! written, not even an error status.
//!
//! The response timeout counts from the last request byte sent upstream, so a
//! chunked body that has finished arms it just like a fixed-length one. A
//! client hang-up at any point before the response ends the exchange.

use crate::audit::{self, ProxyMode};
use crate::error::{NetErrorCode, ProxyError, Result};
use crate::handler::{send_status, unless_client_closed, RequestHead};
use crate::server::ProxyState;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Headers never sent upstream
const STRIPPED_HEADERS: &[&str] = &[
    "proxy-connection",
    "proxy-authorization",
    "connection",
    "keep-alive",
];

const READ_CHUNK: usize = 16 * 1024;

/// How the client frames its request body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestBody {
    None,
    Length(u64),
    /// Relayed raw until the client stops sending
    Chunked,
}

impl RequestBody {
    /// Body framing from `Transfer-Encoding` / `Content-Length`
    pub fn from_head(head: &RequestHead) -> Result<Self> {
        if head
            .header("transfer-encoding")
            .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"))
        {
            return Ok(RequestBody::Chunked);
        }
        match head.header("content-length") {
            None => Ok(RequestBody::None),
            Some(value) => {
                let len: u64 = value.parse().map_err(|_| {
                    ProxyError::HttpParse(format!("invalid Content-Length: {value}"))
                })?;
                Ok(if len == 0 {
                    RequestBody::None
                } else {
                    RequestBody::Length(len)
                })
            }
        }
    }
}

/// Serialize the upstream request head
pub fn upstream_request(head: &RequestHead, path: &str, host: &str, port: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(512);
    buf.put_slice(head.method.as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");

    let mut has_host = false;
    for (name, value) in &head.headers {
        if STRIPPED_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        has_host |= name.eq_ignore_ascii_case("host");
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    if !has_host {
        buf.put_slice(b"Host: ");
        buf.put_slice(authority(host, port).as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"Connection: close\r\n\r\n");
    buf.freeze()
}

fn authority(host: &str, port: u16) -> String {
    let host = if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    if port == 80 {
        host
    } else {
        format!("{host}:{port}")
    }
}

/// Status code from the first response chunk
fn parse_status(chunk: &[u8]) -> Option<u16> {
    let line = chunk.split(|b| *b == b'\n').next()?;
    let line = std::str::from_utf8(line).ok()?;
    let mut parts = line.split_whitespace();
    parts.next().filter(|v| v.starts_with("HTTP/"))?;
    parts.next()?.parse().ok()
}

enum AttemptError {
    /// Nothing reached the client; a status may still be sent
    BeforeResponse(ProxyError),
    /// Response bytes were relayed
    AfterResponse(ProxyError),
    /// The client hung up; nothing more is written
    ClientGone,
}

struct Relayed {
    status: Option<u16>,
    bytes: u64,
}

/// When request bytes last reached the upstream
struct Progress {
    origin: Instant,
    elapsed_ms: AtomicU64,
}

impl Progress {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let ms = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.elapsed_ms.store(ms, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.origin + Duration::from_millis(self.elapsed_ms.load(Ordering::Relaxed))
    }
}

/// Forward one allowed HTTP request and relay the response
pub(crate) async fn forward<S>(
    client: &mut S,
    head: &RequestHead,
    host: &str,
    port: u16,
    path: &str,
    state: &ProxyState,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let body = match RequestBody::from_head(head) {
        Ok(body) => body,
        Err(e) => {
            let _ = send_status(client, 400, None).await;
            return Err(e);
        }
    };
    let request = upstream_request(head, path, host, port);
    let retries = if body == RequestBody::None {
        state.config.max_retries.min(1)
    } else {
        0
    };

    let mut attempt: u8 = 0;
    loop {
        match attempt_once(&mut *client, &request, body, host, port, state, attempt).await {
            Ok(relayed) => {
                debug!(
                    host,
                    port,
                    status = ?relayed.status,
                    bytes = relayed.bytes,
                    attempts = attempt + 1,
                    "Response relayed"
                );
                return Ok(());
            }
            Err(AttemptError::BeforeResponse(e)) => {
                let code = e.net_code();
                if attempt < retries && code.is_some_and(NetErrorCode::is_retryable) {
                    debug!(host, port, error = %e, "Retrying upstream request");
                    attempt += 1;
                    continue;
                }
                let status = code.map_or(502, NetErrorCode::gateway_status);
                audit::log_gateway_error(ProxyMode::Forward, host, port, status, &e.to_string());
                let _ = send_status(client, status, code.map(NetErrorCode::as_str)).await;
                return Err(e);
            }
            Err(AttemptError::AfterResponse(e)) => return Err(e),
            Err(AttemptError::ClientGone) => {
                debug!(host, port, "Client closed before the exchange finished");
                return Err(ProxyError::ClientClosed);
            }
        }
    }
}

/// Relay the request body, starting with bytes already read from the client
async fn send_body<R, W>(
    client: &mut R,
    upstream: &mut W,
    body: RequestBody,
    early: &[u8],
    progress: &Progress,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (preread, mut remaining) = match body {
        RequestBody::None => return Ok(0),
        RequestBody::Length(len) => {
            let n = early.len().min(usize::try_from(len).unwrap_or(usize::MAX));
            (&early[..n], Some(len - n as u64))
        }
        RequestBody::Chunked => (early, None),
    };

    let mut sent = 0u64;
    if !preread.is_empty() {
        upstream.write_all(preread).await?;
        sent += preread.len() as u64;
        progress.touch();
    }

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let want = match remaining {
            Some(0) => break,
            Some(left) => buf.len().min(usize::try_from(left).unwrap_or(usize::MAX)),
            None => buf.len(),
        };
        let n = client.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        upstream.write_all(&buf[..n]).await?;
        sent += n as u64;
        progress.touch();
        if let Some(left) = remaining.as_mut() {
            *left -= n as u64;
        }
    }
    Ok(sent)
}

async fn attempt_once<S>(
    client: &mut S,
    request: &Bytes,
    body: RequestBody,
    host: &str,
    port: u16,
    state: &ProxyState,
    attempt: u8,
) -> std::result::Result<Relayed, AttemptError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    use AttemptError::{AfterResponse, BeforeResponse, ClientGone};

    let mut early = BytesMut::new();
    let dial = state
        .connector
        .connect(host, port, state.config.connect_timeout());
    let upstream = unless_client_closed(&mut *client, &mut early, dial)
        .await
        .ok_or(ClientGone)?
        .map_err(BeforeResponse)?;
    let (mut up_rd, mut up_wr) = upstream.into_split();
    up_wr
        .write_all(request)
        .await
        .map_err(|e| BeforeResponse(e.into()))?;

    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let started = AtomicBool::new(false);
    let progress = Progress::new();

    // Ends only when the client hangs up
    let client_side = async {
        match send_body(&mut client_rd, &mut up_wr, body, &early, &progress).await {
            Ok(bytes) => trace!(bytes, "Request body sent"),
            Err(e) => debug!(error = %e, "Request body relay stopped"),
        }
        let mut scratch = [0u8; 1024];
        loop {
            match client_rd.read(&mut scratch).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };

    let relay = async {
        let mut buf = vec![0u8; READ_CHUNK];
        let n = match up_rd.read(&mut buf).await {
            Ok(0) => {
                return Err(BeforeResponse(
                    io::Error::new(io::ErrorKind::UnexpectedEof, "socket hang up").into(),
                ))
            }
            Ok(n) => n,
            Err(e) => return Err(BeforeResponse(e.into())),
        };
        started.store(true, Ordering::Relaxed);

        let status = parse_status(&buf[..n]);
        client_wr
            .write_all(&buf[..n])
            .await
            .map_err(|e| AfterResponse(e.into()))?;
        let rest = tokio::io::copy(&mut up_rd, &mut client_wr)
            .await
            .map_err(|e| AfterResponse(e.into()))?;
        client_wr
            .flush()
            .await
            .map_err(|e| AfterResponse(e.into()))?;
        Ok(Relayed {
            status,
            bytes: n as u64 + rest,
        })
    };

    // The response clock runs from the last request byte sent
    let wait = state.config.response_timeout(attempt);
    let deadline = tokio::time::sleep(wait);
    tokio::pin!(client_side, relay, deadline);

    loop {
        tokio::select! {
            () = &mut client_side => return Err(ClientGone),
            result = &mut relay => return result,
            () = &mut deadline, if !started.load(Ordering::Relaxed) => {
                let idle_until = progress.last() + wait;
                if idle_until > Instant::now() {
                    deadline.as_mut().reset(idle_until);
                } else {
                    return Err(BeforeResponse(ProxyError::UpstreamTimeout {
                        host: host.to_string(),
                    }));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::FixedConnector;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    fn head(lines: &[&str]) -> RequestHead {
        let lines: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        RequestHead::parse(&lines).unwrap()
    }

    /// Read one request head from an upstream socket
    async fn read_upstream_head(socket: &mut BufReader<TcpStream>) -> String {
        let mut text = String::new();
        loop {
            let mut line = String::new();
            if socket.read_line(&mut line).await.unwrap() == 0 || line == "\r\n" {
                return text;
            }
            text.push_str(&line);
        }
    }

    /// Upstream that drops the first `drop_first` connections without replying
    async fn upstream(drop_first: usize) -> (SocketAddr, Arc<AtomicUsize>, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let task = tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let mut socket = BufReader::new(socket);
                let request = read_upstream_head(&mut socket).await;
                if n < drop_first {
                    continue;
                }
                socket
                    .get_mut()
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                    .await
                    .unwrap();
                return request;
            }
        });
        (addr, seen, task)
    }

    #[test]
    fn test_upstream_request_rewrite() {
        let h = head(&[
            "GET http://a.test/p?q=1 HTTP/1.1",
            "Host: a.test",
            "Proxy-Connection: keep-alive",
            "Proxy-Authorization: Basic eDp5",
            "Connection: keep-alive",
            "Keep-Alive: timeout=5",
            "Accept: text/html",
        ]);
        let bytes = upstream_request(&h, "/p?q=1", "a.test", 80);
        let text = std::str::from_utf8(&bytes).unwrap();

        assert!(text.starts_with("GET /p?q=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: a.test\r\n"));
        assert!(text.contains("Accept: text/html\r\n"));
        assert!(!text.to_ascii_lowercase().contains("proxy-"));
        assert!(!text.contains("keep-alive"));
        assert!(text.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn test_missing_host_added() {
        let h = head(&["GET http://a.test:8080/ HTTP/1.1"]);
        let bytes = upstream_request(&h, "/", "a.test", 8080);
        assert!(std::str::from_utf8(&bytes)
            .unwrap()
            .contains("Host: a.test:8080\r\n"));
    }

    #[test]
    fn test_body_framing() {
        assert_eq!(
            RequestBody::from_head(&head(&["GET / HTTP/1.1"])).unwrap(),
            RequestBody::None
        );
        assert_eq!(
            RequestBody::from_head(&head(&["POST / HTTP/1.1", "Content-Length: 12"])).unwrap(),
            RequestBody::Length(12)
        );
        assert_eq!(
            RequestBody::from_head(&head(&["POST / HTTP/1.1", "Transfer-Encoding: chunked"]))
                .unwrap(),
            RequestBody::Chunked
        );
        assert!(RequestBody::from_head(&head(&["POST / HTTP/1.1", "Content-Length: x"])).is_err());
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status(b"HTTP/1.1 404 Not Found\r\n"), Some(404));
        assert_eq!(parse_status(b"garbage"), None);
    }

    async fn run_forward(state: &ProxyState, h: &RequestHead, body: &[u8]) -> (Result<()>, String) {
        let (mut client, mut proxy_side) = tokio::io::duplex(64 * 1024);
        client.write_all(body).await.unwrap();
        let result = forward(&mut proxy_side, h, "site.test", 80, "/", state).await;
        drop(proxy_side);
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        (result, response)
    }

    #[tokio::test]
    async fn test_forward_relays_response() {
        let (addr, seen, task) = upstream(0).await;
        let state = ProxyState::for_tests(Arc::new(FixedConnector::new(addr)));
        let h = head(&["GET http://site.test/ HTTP/1.1", "Host: site.test"]);

        let (result, response) = run_forward(&state, &h, b"").await;
        result.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("ok"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        let upstream_saw = task.await.unwrap();
        assert!(upstream_saw.starts_with("GET / HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn test_bodiless_request_retried_once_after_hang_up() {
        let (addr, seen, _task) = upstream(1).await;
        let state = ProxyState::for_tests(Arc::new(FixedConnector::new(addr)));
        let h = head(&["GET http://site.test/ HTTP/1.1", "Host: site.test"]);

        let (result, response) = run_forward(&state, &h, b"").await;
        result.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_request_with_body_not_retried() {
        let (addr, seen, _task) = upstream(1).await;
        let state = ProxyState::for_tests(Arc::new(FixedConnector::new(addr)));
        let h = head(&[
            "POST http://site.test/ HTTP/1.1",
            "Host: site.test",
            "Content-Length: 4",
        ]);

        let (result, response) = run_forward(&state, &h, b"data").await;
        assert!(result.unwrap_err().is_benign());
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    /// Upstream that accepts and holds connections without ever replying
    async fn silent_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                held.push(socket);
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_silent_upstream_times_out_with_504() {
        let addr = silent_upstream().await;
        let mut state = ProxyState::for_tests(Arc::new(FixedConnector::new(addr)));
        state.config.max_retries = 0;
        let h = head(&["GET http://site.test/ HTTP/1.1", "Host: site.test"]);

        let (result, response) = run_forward(&state, &h, b"").await;
        assert!(matches!(result, Err(ProxyError::UpstreamTimeout { .. })));
        assert!(response.starts_with("HTTP/1.1 504 Gateway Timeout"));
        assert!(response.contains("X-Error: ETIMEDOUT"));
    }

    #[tokio::test]
    async fn test_complete_chunked_body_still_times_out() {
        let addr = silent_upstream().await;
        let state = ProxyState::for_tests(Arc::new(FixedConnector::new(addr)));
        let h = head(&[
            "POST http://site.test/ HTTP/1.1",
            "Host: site.test",
            "Transfer-Encoding: chunked",
        ]);

        // The client stays connected after the last chunk, waiting for a reply
        let (result, response) = tokio::time::timeout(
            Duration::from_secs(5),
            run_forward(&state, &h, b"4\r\ndata\r\n0\r\n\r\n"),
        )
        .await
        .expect("response wait should be bounded");
        assert!(matches!(result, Err(ProxyError::UpstreamTimeout { .. })));
        assert!(response.starts_with("HTTP/1.1 504 Gateway Timeout"));
    }

    #[tokio::test]
    async fn test_body_upload_keeps_response_clock_fresh() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);
            read_upstream_head(&mut socket).await;
            let mut body = [0u8; 8];
            socket.read_exact(&mut body).await.unwrap();
            socket
                .get_mut()
                .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let state = ProxyState::for_tests(Arc::new(FixedConnector::new(addr)));
        let h = head(&[
            "POST http://site.test/ HTTP/1.1",
            "Host: site.test",
            "Content-Length: 8",
        ]);

        // The body finishes 1.2s in; each piece restarts the 1s clock
        let (mut client, mut proxy_side) = tokio::io::duplex(1024);
        let upload = tokio::spawn(async move {
            client.write_all(b"ha").await.unwrap();
            tokio::time::sleep(Duration::from_millis(600)).await;
            client.write_all(b"lf").await.unwrap();
            tokio::time::sleep(Duration::from_millis(600)).await;
            client.write_all(b"done").await.unwrap();
            let mut response = String::new();
            client.read_to_string(&mut response).await.unwrap();
            response
        });

        let result = forward(&mut proxy_side, &h, "site.test", 80, "/", &state).await;
        drop(proxy_side);
        result.unwrap();
        assert!(upload.await.unwrap().starts_with("HTTP/1.1 201 Created"));
    }

    #[tokio::test]
    async fn test_client_hang_up_ends_response_wait() {
        let addr = silent_upstream().await;
        let mut state = ProxyState::for_tests(Arc::new(FixedConnector::new(addr)));
        state.config.response_timeout_secs = 60;
        state.config.retry_response_timeout_secs = 60;
        let h = head(&["GET http://site.test/ HTTP/1.1", "Host: site.test"]);

        let (client, mut proxy_side) = tokio::io::duplex(1024);
        let task = tokio::spawn(async move {
            forward(&mut proxy_side, &h, "site.test", 80, "/", &state).await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(client);
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("hang-up should cancel the upstream wait")
            .unwrap();
        assert!(matches!(result, Err(ProxyError::ClientClosed)));
    }
}
